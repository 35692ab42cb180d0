//! In-container agent: the HTTP API the container backend talks to.

use crate::api::{
    BytesResponse, ContentResponse, DownloadResponse, EntriesResponse, ExecRequest, ExecResponse,
    FindRequest, PathRequest, ReplaceRequest, ReplaceResponse, SearchRequest, SearchResponse,
    ServiceStatus, SupervisorStatus, UploadRequest, WriteRequest, STATE_RUNNING, STATE_STARTING,
};
use crate::backend::MAX_TRANSFER_BYTES;
use crate::error::SandboxError;
use crate::local::{self, RunConfig};
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tower_http::trace::TraceLayer;
use tracing::info;

type ApiError = (StatusCode, String);
type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub scratch_dir: PathBuf,
    pub nofile: u64,
    /// Extra services reported by the supervisor endpoint, probed by TCP
    /// connect on localhost.
    pub watch: Vec<(String, u16)>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir(),
            nofile: 1024,
            watch: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct AgentState {
    config: Arc<AgentConfig>,
}

impl AgentState {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

/// Parse a `name=port` watch specification.
pub fn parse_watch(spec: &str) -> Result<(String, u16), String> {
    let (name, port) = spec
        .split_once('=')
        .ok_or_else(|| format!("expected name=port, got '{}'", spec))?;
    let port = port
        .parse()
        .map_err(|_| format!("invalid port in '{}'", spec))?;
    Ok((name.to_string(), port))
}

pub fn router(state: AgentState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/supervisor/status", get(supervisor_status))
        .route("/api/v1/shell/exec", post(shell_exec))
        .route("/api/v1/file/read", post(file_read))
        .route("/api/v1/file/write", post(file_write))
        .route("/api/v1/file/replace", post(file_replace))
        .route("/api/v1/file/search", post(file_search))
        .route("/api/v1/file/find", post(file_find))
        .route("/api/v1/file/delete", post(file_delete))
        .route("/api/v1/file/list", post(file_list))
        .route("/api/v1/file/upload", post(file_upload))
        .route("/api/v1/file/download", post(file_download))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the agent on the given port.
pub async fn run_server(port: u16, state: AgentState) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting agent on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await
}

fn internal(e: impl ToString) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn failed(e: SandboxError) -> ApiError {
    let status = match &e {
        SandboxError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
        SandboxError::Backend(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

/// Run blocking filesystem work off the runtime.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> crate::error::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(internal)?
        .map_err(failed)
}

async fn health() -> &'static str {
    "OK"
}

async fn supervisor_status(State(state): State<AgentState>) -> Json<SupervisorStatus> {
    let mut services = vec![ServiceStatus {
        name: "shell".to_string(),
        statename: STATE_RUNNING.to_string(),
    }];
    for (name, port) in &state.config.watch {
        let up = tokio::time::timeout(
            Duration::from_secs(1),
            TcpStream::connect(("127.0.0.1", *port)),
        )
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);
        services.push(ServiceStatus {
            name: name.clone(),
            statename: if up { STATE_RUNNING } else { STATE_STARTING }.to_string(),
        });
    }
    Json(SupervisorStatus { services })
}

async fn shell_exec(
    State(state): State<AgentState>,
    Json(req): Json<ExecRequest>,
) -> ApiResult<ExecResponse> {
    info!(id = %req.id, script_len = req.script.len(), "POST /api/v1/shell/exec");
    let config = RunConfig {
        script: req.script,
        timeout: Duration::from_secs(req.timeout_secs),
        nofile: state.config.nofile,
        scratch_dir: state.config.scratch_dir.clone(),
    };
    let result = local::run_script(&config).await.map_err(failed)?;
    Ok(Json(ExecResponse {
        exit_code: result.status(),
        stdout: result.stdout,
        stderr: result.stderr,
    }))
}

async fn file_read(Json(req): Json<PathRequest>) -> ApiResult<ContentResponse> {
    let content = blocking(move || local::read_file(req.path.as_ref())).await?;
    Ok(Json(ContentResponse { content }))
}

async fn file_write(Json(req): Json<WriteRequest>) -> ApiResult<BytesResponse> {
    let bytes = blocking(move || local::write_file(req.path.as_ref(), req.content.as_bytes(), req.append)).await?;
    Ok(Json(BytesResponse { bytes }))
}

async fn file_replace(Json(req): Json<ReplaceRequest>) -> ApiResult<ReplaceResponse> {
    let replacements = blocking(move || {
        let path = std::path::Path::new(&req.path);
        let content = local::read_file(path)?;
        let (updated, count) = local::replace_all(&content, &req.old, &req.new)?;
        if count > 0 {
            local::write_file(path, updated.as_bytes(), false)?;
        }
        Ok(count)
    })
    .await?;
    Ok(Json(ReplaceResponse { replacements }))
}

async fn file_search(Json(req): Json<SearchRequest>) -> ApiResult<SearchResponse> {
    let matches = blocking(move || {
        let content = local::read_file(req.path.as_ref())?;
        local::search_lines(&content, &req.pattern)
    })
    .await?;
    Ok(Json(SearchResponse { matches }))
}

async fn file_find(Json(req): Json<FindRequest>) -> ApiResult<EntriesResponse> {
    let entries = blocking(move || local::find_files(req.path.as_ref(), &req.glob)).await?;
    Ok(Json(EntriesResponse { entries }))
}

async fn file_delete(Json(req): Json<PathRequest>) -> Result<StatusCode, ApiError> {
    blocking(move || local::delete_path(req.path.as_ref())).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn file_list(Json(req): Json<PathRequest>) -> ApiResult<EntriesResponse> {
    let entries = blocking(move || local::list_dir(req.path.as_ref())).await?;
    Ok(Json(EntriesResponse { entries }))
}

async fn file_upload(Json(req): Json<UploadRequest>) -> ApiResult<BytesResponse> {
    let data = STANDARD
        .decode(req.data.as_bytes())
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid base64: {}", e)))?;
    let bytes = blocking(move || local::write_file(req.path.as_ref(), &data, false)).await?;
    Ok(Json(BytesResponse { bytes }))
}

async fn file_download(Json(req): Json<PathRequest>) -> ApiResult<DownloadResponse> {
    let data = blocking(move || local::read_bytes(req.path.as_ref(), MAX_TRANSFER_BYTES)).await?;
    Ok(Json(DownloadResponse {
        size: data.len() as u64,
        data: STANDARD.encode(&data),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn serve(config: AgentConfig) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(AgentState::new(config))).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn watch_specs() {
        assert_eq!(parse_watch("chrome=9222"), Ok(("chrome".to_string(), 9222)));
        assert!(parse_watch("chrome").is_err());
        assert!(parse_watch("chrome=port").is_err());
    }

    #[tokio::test]
    async fn exec_runs_script_and_reports_status() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve(AgentConfig {
            scratch_dir: dir.path().to_path_buf(),
            ..AgentConfig::default()
        })
        .await;

        let response: ExecResponse = reqwest::Client::new()
            .post(format!("{}/api/v1/shell/exec", base))
            .json(&json!({ "id": "s1", "script": "echo out; echo err >&2; exit 3" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(response.exit_code, 3);
        assert_eq!(response.stdout, "out\n");
        assert_eq!(response.stderr, "err\n");
    }

    #[tokio::test]
    async fn supervisor_reports_watched_services() {
        let idle = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open_port = idle.local_addr().unwrap().port();
        let base = serve(AgentConfig {
            watch: vec![("browser".into(), open_port), ("vnc".into(), 1)],
            ..AgentConfig::default()
        })
        .await;

        let status: SupervisorStatus = reqwest::get(format!("{}/api/v1/supervisor/status", base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status.services.len(), 3);
        assert_eq!(status.services[1].statename, STATE_RUNNING);
        assert_eq!(status.services[2].statename, STATE_STARTING);
        assert!(!status.all_running());
    }

    #[tokio::test]
    async fn file_round_trip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve(AgentConfig::default()).await;
        let client = reqwest::Client::new();
        let path = dir.path().join("nested/notes.txt").display().to_string();

        let written: BytesResponse = client
            .post(format!("{}/api/v1/file/write", base))
            .json(&json!({ "path": path, "content": "alpha\nbeta\n" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(written.bytes, 11);

        let replaced: ReplaceResponse = client
            .post(format!("{}/api/v1/file/replace", base))
            .json(&json!({ "path": path, "old": "beta", "new": "gamma" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(replaced.replacements, 1);

        let found: SearchResponse = client
            .post(format!("{}/api/v1/file/search", base))
            .json(&json!({ "path": path, "pattern": "^gam" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(found.matches[0].line, 2);

        let missing = client
            .post(format!("{}/api/v1/file/read", base))
            .json(&json!({ "path": dir.path().join("nope").display().to_string() }))
            .send()
            .await
            .unwrap();
        assert!(!missing.status().is_success());
    }
}
