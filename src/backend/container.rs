//! Persistent-container backend: one long-lived container per sandbox,
//! driven over the agent's HTTP API.

use super::{ExecutionBackend, RawOutput, RemoteControl, ScriptRequest, MAX_TRANSFER_BYTES};
use crate::api::{
    BytesResponse, ContentResponse, DownloadResponse, EntriesResponse, ExecRequest, ExecResponse,
    FindRequest, PathRequest, ReplaceRequest, ReplaceResponse, SearchMatch, SearchRequest,
    SearchResponse, SupervisorStatus, UploadRequest, WriteRequest,
};
use crate::config::{BackendKind, ContainerConfig};
use crate::error::{Result, SandboxError};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

const FILE_OP_TIMEOUT: Duration = Duration::from_secs(300);

pub struct ContainerBackend {
    id: String,
    /// Set when this backend started the container and owns its removal.
    container_name: Option<String>,
    host: String,
    base_url: String,
    config: ContainerConfig,
    client: reqwest::Client,
}

impl ContainerBackend {
    /// Attach to a configured agent address, or start a fresh container.
    pub async fn create(config: &ContainerConfig) -> Result<Self> {
        match &config.address {
            Some(address) => Self::attach(address, config),
            None => Self::start_container(config).await,
        }
    }

    /// Connect to an agent that is already running. `address` may be a
    /// bare host, `host:port` or a full URL.
    pub fn attach(address: &str, config: &ContainerConfig) -> Result<Self> {
        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else if address.contains(':') {
            format!("http://{}", address)
        } else {
            format!("http://{}:{}", address, config.api_port)
        };
        let host = url::Url::parse(&base_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| SandboxError::Config(format!("invalid container address '{}'", address)))?;

        info!(base_url = %base_url, "Attached to container agent");
        Ok(Self {
            id: host.clone(),
            container_name: None,
            host,
            base_url,
            config: config.clone(),
            client: reqwest::Client::new(),
        })
    }

    async fn start_container(config: &ContainerConfig) -> Result<Self> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{}-{}", config.name_prefix, &suffix[..8]);

        let mut run = Command::new("docker");
        run.args(["run", "-d", "--name", name.as_str()]);
        if let Some(network) = &config.network {
            run.args(["--network", network.as_str()]);
        }
        run.arg(&config.image);
        docker(&mut run).await?;

        let ip = docker(Command::new("docker").args([
            "inspect",
            "-f",
            "{{range .NetworkSettings.Networks}}{{.IPAddress}}{{end}}",
            name.as_str(),
        ]))
        .await?;
        let ip = ip.split_whitespace().next().unwrap_or_default().to_string();
        if ip.is_empty() {
            remove_container(&name).await;
            return Err(SandboxError::Backend(format!("container {} has no IP address", name)));
        }

        info!(container = %name, ip = %ip, image = %config.image, "Started sandbox container");
        let mut backend = Self::attach(&ip, config)?;
        backend.id = name.clone();
        backend.container_name = Some(name);
        Ok(backend)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn cdp_url(&self) -> Option<String> {
        self.config
            .cdp_port
            .map(|port| format!("http://{}:{}", self.host, port))
    }

    async fn post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        route: &str,
        body: &Req,
        timeout: Duration,
    ) -> Result<Resp> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, route))
            .timeout(timeout)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SandboxError::Backend(format!("{} returned {}: {}", route, status, detail)));
        }
        Ok(response.json().await?)
    }

    /// One readiness probe. Err carries the reason the sandbox is not ready.
    async fn check_ready(&self) -> std::result::Result<(), String> {
        let status: SupervisorStatus = self
            .client
            .get(format!("{}/api/v1/supervisor/status", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| format!("status endpoint unreachable: {}", e))?
            .json()
            .await
            .map_err(|e| format!("invalid status response: {}", e))?;

        if !status.all_running() {
            let pending: Vec<String> = status
                .services
                .iter()
                .filter(|s| s.statename != crate::api::STATE_RUNNING)
                .map(|s| format!("{}={}", s.name, s.statename))
                .collect();
            return Err(format!("services not running: {}", pending.join(", ")));
        }

        if let Some(cdp) = self.cdp_url() {
            let body = self
                .client
                .get(format!("{}/json/version", cdp))
                .timeout(Duration::from_secs(5))
                .send()
                .await
                .map_err(|e| format!("remote control port unreachable: {}", e))?
                .text()
                .await
                .map_err(|e| format!("remote control probe failed: {}", e))?;
            if !(body.contains("Browser") && body.contains("Protocol-Version")) {
                return Err("remote control endpoint did not identify a browser".to_string());
            }
        }
        Ok(())
    }
}

async fn docker(command: &mut Command) -> Result<String> {
    let output = command
        .output()
        .await
        .map_err(|e| SandboxError::Backend(format!("run docker: {}", e)))?;
    if !output.status.success() {
        return Err(SandboxError::Backend(format!(
            "docker failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn remove_container(name: &str) {
    if let Err(e) = docker(Command::new("docker").args(["rm", "-f", name])).await {
        warn!(container = %name, error = %e, "Failed to remove container");
    } else {
        info!(container = %name, "Removed sandbox container");
    }
}

#[async_trait]
impl ExecutionBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn ensure_ready(&self) -> Result<()> {
        let retries = self.config.ready_retries.max(1);
        let interval = Duration::from_millis(self.config.ready_interval_ms);
        let mut last_reason = String::new();

        for attempt in 1..=retries {
            match self.check_ready().await {
                Ok(()) => {
                    info!(sandbox = %self.id, attempt, "Sandbox ready");
                    return Ok(());
                }
                Err(reason) => {
                    debug!(sandbox = %self.id, attempt, retries, reason = %reason, "Sandbox not ready yet");
                    last_reason = reason;
                }
            }
            if attempt < retries {
                tokio::time::sleep(interval).await;
            }
        }
        Err(SandboxError::NotReady(format!(
            "gave up after {} attempts: {}",
            retries, last_reason
        )))
    }

    async fn destroy(&self) -> Result<()> {
        if let Some(name) = &self.container_name {
            remove_container(name).await;
        }
        Ok(())
    }

    async fn run_script(&self, request: ScriptRequest) -> Result<RawOutput> {
        let body = ExecRequest {
            id: request.session.clone(),
            script: request.script,
            timeout_secs: request.timeout.as_secs().max(1),
        };
        let response: ExecResponse = self
            .post("/api/v1/shell/exec", &body, request.timeout + self.timeout_slack())
            .await?;
        Ok(RawOutput {
            exit_code: response.exit_code,
            stdout: response.stdout,
            stderr: response.stderr,
            snapshot: None,
        })
    }

    fn remote_control(&self) -> Option<RemoteControl> {
        self.cdp_url().map(|cdp_url| RemoteControl {
            cdp_url,
            vnc_url: Some(format!("vnc://{}:{}", self.host, self.config.vnc_port)),
        })
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let response: ContentResponse = self
            .post("/api/v1/file/read", &PathRequest { path: path.to_string() }, FILE_OP_TIMEOUT)
            .await?;
        Ok(response.content)
    }

    async fn write_file(&self, path: &str, content: &str, append: bool) -> Result<u64> {
        let body = WriteRequest {
            path: path.to_string(),
            content: content.to_string(),
            append,
        };
        let response: BytesResponse = self.post("/api/v1/file/write", &body, FILE_OP_TIMEOUT).await?;
        Ok(response.bytes)
    }

    async fn replace_in_file(&self, path: &str, old: &str, new: &str) -> Result<usize> {
        let body = ReplaceRequest {
            path: path.to_string(),
            old: old.to_string(),
            new: new.to_string(),
        };
        let response: ReplaceResponse = self.post("/api/v1/file/replace", &body, FILE_OP_TIMEOUT).await?;
        Ok(response.replacements)
    }

    async fn search_file(&self, path: &str, pattern: &str) -> Result<Vec<SearchMatch>> {
        let body = SearchRequest {
            path: path.to_string(),
            pattern: pattern.to_string(),
        };
        let response: SearchResponse = self.post("/api/v1/file/search", &body, FILE_OP_TIMEOUT).await?;
        Ok(response.matches)
    }

    async fn find_files(&self, dir: &str, glob: &str) -> Result<Vec<String>> {
        let body = FindRequest {
            path: dir.to_string(),
            glob: glob.to_string(),
        };
        let response: EntriesResponse = self.post("/api/v1/file/find", &body, FILE_OP_TIMEOUT).await?;
        Ok(response.entries)
    }

    async fn delete_path(&self, path: &str) -> Result<()> {
        let _: serde_json::Value = self
            .post("/api/v1/file/delete", &PathRequest { path: path.to_string() }, FILE_OP_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        let response: EntriesResponse = self
            .post("/api/v1/file/list", &PathRequest { path: path.to_string() }, FILE_OP_TIMEOUT)
            .await?;
        Ok(response.entries)
    }

    async fn upload(&self, path: &str, data: &[u8]) -> Result<u64> {
        let body = UploadRequest {
            path: path.to_string(),
            data: STANDARD.encode(data),
        };
        let response: BytesResponse = self.post("/api/v1/file/upload", &body, FILE_OP_TIMEOUT).await?;
        Ok(response.bytes)
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        let response: DownloadResponse = self
            .post("/api/v1/file/download", &PathRequest { path: path.to_string() }, FILE_OP_TIMEOUT)
            .await?;
        if response.size > MAX_TRANSFER_BYTES {
            return Err(SandboxError::Backend(format!(
                "file is {} bytes, limit is {}",
                response.size, MAX_TRANSFER_BYTES
            )));
        }
        STANDARD
            .decode(response.data)
            .map_err(|e| SandboxError::Backend(format!("invalid download payload: {}", e)))
    }
}
