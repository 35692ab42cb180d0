//! Managed-job backend: every script runs in a single-use compute job and
//! session state lives in a durable object store between jobs.

use super::{ExecutionBackend, RawOutput, ScriptRequest};
use crate::config::{BackendKind, ManagedJobConfig};
use crate::error::{Result, SandboxError};
use crate::state::{ObjectSessionStore, Session};
use async_trait::async_trait;
use bytes::Bytes;
use object_store::{path::Path as ObjPath, ObjectStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Stderr reported when a job finishes without writing its result.
pub const NO_RESULT_MESSAGE: &str = "Execution failed - no result found";

/// Everything a job needs to run one script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    pub execution_id: String,
    pub session: String,
    pub image: String,
    pub script: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub snapshot: Option<Session>,
    pub timeout_secs: u64,
    pub memory: String,
    pub cpu: String,
    pub max_retries: u32,
    /// Object key the job writes its [`JobRecord`] to.
    pub result_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub job: String,
    pub execution: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed(String),
}

/// Result written by the job when it finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub execution_id: String,
    pub session: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub new_state: Option<Session>,
}

/// Compute service that runs single-use jobs.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn launch(&self, spec: &JobSpec) -> Result<JobHandle>;

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus>;

    async fn delete(&self, handle: &JobHandle) -> Result<()>;
}

pub fn result_path(prefix: &ObjPath, execution_id: &str) -> ObjPath {
    prefix.child("executions").child(execution_id).child("result.json")
}

pub async fn write_record(store: &dyn ObjectStore, prefix: &ObjPath, record: &JobRecord) -> Result<()> {
    let path = result_path(prefix, &record.execution_id);
    let data = serde_json::to_vec(record)?;
    store.put(&path, Bytes::from(data).into()).await?;
    Ok(())
}

pub async fn read_record(store: &dyn ObjectStore, prefix: &ObjPath, execution_id: &str) -> Result<Option<JobRecord>> {
    let path = result_path(prefix, execution_id);
    let bytes = match store.get(&path).await {
        Ok(result) => result.bytes().await?,
        Err(object_store::Error::NotFound { .. }) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Open the object store behind `url`. Local `file://` stores are created
/// if they do not exist yet; cloud credentials come from the environment.
pub fn open_state_store(url: &str) -> Result<(Arc<dyn ObjectStore>, ObjPath)> {
    let parsed = url::Url::parse(url)
        .map_err(|e| SandboxError::Config(format!("invalid state store url '{}': {}", url, e)))?;
    if parsed.scheme() == "file" {
        let dir = parsed
            .to_file_path()
            .map_err(|_| SandboxError::Config(format!("invalid file url '{}'", url)))?;
        std::fs::create_dir_all(&dir)?;
    }
    let options = std::env::vars().map(|(k, v)| (k.to_ascii_lowercase(), v));
    let (store, prefix) = object_store::parse_url_opts(&parsed, options)?;
    Ok((Arc::from(store), prefix))
}

/// REST client for the job service.
pub struct HttpJobRunner {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct ExecutionState {
    state: String,
    #[serde(default)]
    message: Option<String>,
}

impl HttpJobRunner {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl JobRunner for HttpJobRunner {
    async fn launch(&self, spec: &JobSpec) -> Result<JobHandle> {
        let response = self
            .authorize(self.client.post(format!("{}/v1/jobs", self.endpoint)))
            .json(spec)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        let state: ExecutionState = self
            .authorize(
                self.client
                    .get(format!("{}/v1/executions/{}", self.endpoint, handle.execution)),
            )
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(match state.state.as_str() {
            "succeeded" => JobStatus::Succeeded,
            "failed" | "cancelled" => JobStatus::Failed(state.message.unwrap_or(state.state)),
            _ => JobStatus::Running,
        })
    }

    async fn delete(&self, handle: &JobHandle) -> Result<()> {
        self.authorize(
            self.client
                .delete(format!("{}/v1/jobs/{}", self.endpoint, handle.job)),
        )
        .send()
        .await?
        .error_for_status()?;
        Ok(())
    }
}

pub struct ManagedJobBackend {
    id: String,
    runner: Arc<dyn JobRunner>,
    state: ObjectSessionStore,
    config: ManagedJobConfig,
}

impl ManagedJobBackend {
    pub fn new(runner: Arc<dyn JobRunner>, state: ObjectSessionStore, config: ManagedJobConfig) -> Self {
        Self {
            id: format!("jobs-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
            runner,
            state,
            config,
        }
    }

    /// Build from configuration; requires a job endpoint and a state store.
    pub fn create(config: &ManagedJobConfig, workspace_root: &str) -> Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| SandboxError::Config("managed_job.endpoint is not set".to_string()))?;
        let url = config
            .state_store_url
            .as_deref()
            .ok_or_else(|| SandboxError::Config("managed_job.state_store_url is not set".to_string()))?;
        let (store, prefix) = open_state_store(url)?;
        let runner = Arc::new(HttpJobRunner::new(endpoint, config.token.clone()));
        Ok(Self::new(
            runner,
            ObjectSessionStore::new(store, prefix, workspace_root),
            config.clone(),
        ))
    }

    /// Session store sharing this backend's object store.
    pub fn session_store(&self) -> ObjectSessionStore {
        self.state.clone()
    }

    /// Poll until the job finishes or the deadline passes. A job still
    /// running at the deadline is treated as failed.
    async fn wait(&self, handle: &JobHandle, timeout: Duration) -> JobStatus {
        let deadline = Instant::now() + timeout + Duration::from_secs(self.config.poll_grace_secs);
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            match self.runner.status(handle).await {
                Ok(JobStatus::Running) => {}
                Ok(done) => return done,
                Err(e) => debug!(job = %handle.job, error = %e, "Job status poll failed"),
            }
            if Instant::now() >= deadline {
                warn!(job = %handle.job, "Job did not finish before deadline");
                return JobStatus::Failed("job timed out".to_string());
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn cleanup(&self, handle: &JobHandle) {
        match self.runner.delete(handle).await {
            Ok(()) => debug!(job = %handle.job, "Deleted job"),
            Err(e) => warn!(job = %handle.job, error = %e, "Failed to delete job"),
        }
    }
}

#[async_trait]
impl ExecutionBackend for ManagedJobBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ManagedJob
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn timeout_slack(&self) -> Duration {
        Duration::from_secs(self.config.poll_grace_secs)
            + Duration::from_millis(self.config.poll_interval_ms)
            + Duration::from_secs(10)
    }

    async fn ensure_ready(&self) -> Result<()> {
        self.state
            .probe()
            .await
            .map_err(|e| SandboxError::NotReady(format!("state store unreachable: {}", e)))?;
        info!(sandbox = %self.id, "State store reachable");
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        Ok(())
    }

    async fn run_script(&self, request: ScriptRequest) -> Result<RawOutput> {
        let execution_id = uuid::Uuid::new_v4().to_string();
        let spec = JobSpec {
            name: format!("sandbox-{}", &execution_id[..8]),
            execution_id: execution_id.clone(),
            session: request.session.clone(),
            image: self.config.image.clone(),
            script: request.script,
            command: request.command,
            snapshot: request.snapshot,
            timeout_secs: request.timeout.as_secs().max(1),
            memory: self.config.memory.clone(),
            cpu: self.config.cpu.clone(),
            max_retries: 0,
            result_key: result_path(self.state.prefix(), &execution_id).to_string(),
        };

        let handle = self.runner.launch(&spec).await?;
        info!(job = %handle.job, session = %request.session, "Launched job");

        let status = self.wait(&handle, request.timeout).await;
        let record = read_record(self.state.object_store().as_ref(), self.state.prefix(), &execution_id).await;
        self.cleanup(&handle).await;

        match record {
            Ok(Some(record)) => Ok(RawOutput {
                exit_code: record.exit_code,
                stdout: record.stdout,
                stderr: record.stderr,
                snapshot: record.new_state,
            }),
            Ok(None) => {
                let detail = match status {
                    JobStatus::Failed(reason) => format!("{} ({})", NO_RESULT_MESSAGE, reason),
                    _ => NO_RESULT_MESSAGE.to_string(),
                };
                warn!(job = %handle.job, "Job finished without a result record");
                Ok(RawOutput {
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: detail,
                    snapshot: None,
                })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use std::sync::Mutex;

    /// Job service double. `complete` decides what a launched job writes.
    struct FakeRunner {
        store: Arc<dyn ObjectStore>,
        prefix: ObjPath,
        pub write_result: bool,
        pub finish: bool,
        pub launched: Mutex<Vec<JobSpec>>,
        pub deleted: Mutex<Vec<String>>,
    }

    impl FakeRunner {
        fn new(store: Arc<dyn ObjectStore>, prefix: ObjPath) -> Self {
            Self {
                store,
                prefix,
                write_result: true,
                finish: true,
                launched: Mutex::new(Vec::new()),
                deleted: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl JobRunner for FakeRunner {
        async fn launch(&self, spec: &JobSpec) -> Result<JobHandle> {
            self.launched.lock().unwrap().push(spec.clone());
            if self.write_result {
                let mut state = spec.snapshot.clone().unwrap_or_else(|| Session::new("/workspace"));
                state.cwd = "/srv".into();
                let record = JobRecord {
                    execution_id: spec.execution_id.clone(),
                    session: spec.session.clone(),
                    exit_code: 0,
                    stdout: "hello\n".into(),
                    stderr: String::new(),
                    new_state: Some(state),
                };
                write_record(self.store.as_ref(), &self.prefix, &record).await?;
            }
            Ok(JobHandle {
                job: spec.name.clone(),
                execution: format!("{}-exec", spec.name),
            })
        }

        async fn status(&self, _handle: &JobHandle) -> Result<JobStatus> {
            Ok(if self.finish { JobStatus::Succeeded } else { JobStatus::Running })
        }

        async fn delete(&self, handle: &JobHandle) -> Result<()> {
            self.deleted.lock().unwrap().push(handle.job.clone());
            Err(SandboxError::Backend("delete is flaky".into()))
        }
    }

    fn fast_config() -> ManagedJobConfig {
        ManagedJobConfig {
            poll_interval_ms: 5,
            poll_grace_secs: 0,
            ..ManagedJobConfig::default()
        }
    }

    fn backend(configure: impl FnOnce(&mut FakeRunner)) -> (ManagedJobBackend, Arc<FakeRunner>) {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let prefix = ObjPath::from("sandbox");
        let mut runner = FakeRunner::new(store.clone(), prefix.clone());
        configure(&mut runner);
        let runner = Arc::new(runner);
        let backend = ManagedJobBackend::new(
            runner.clone(),
            ObjectSessionStore::new(store, prefix, "/workspace"),
            fast_config(),
        );
        (backend, runner)
    }

    #[tokio::test]
    async fn result_record_is_returned_with_snapshot() {
        let (backend, runner) = backend(|_| {});
        let mut request = ScriptRequest::raw("echo hello", Duration::from_secs(1));
        request.snapshot = Some(Session::new("/workspace"));

        let out = backend.run_script(request).await.unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.snapshot.unwrap().cwd, "/srv");

        let launched = runner.launched.lock().unwrap();
        assert!(launched[0].name.starts_with("sandbox-"));
        assert_eq!(launched[0].name.len(), "sandbox-".len() + 8);
        assert_eq!(launched[0].memory, "512Mi");
        assert_eq!(launched[0].max_retries, 0);
        // Deletion failure is swallowed but still attempted.
        assert_eq!(runner.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_result_yields_minus_one_and_still_deletes_job() {
        let (backend, runner) = backend(|r| r.write_result = false);
        let out = backend
            .run_script(ScriptRequest::raw("true", Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(out.exit_code, -1);
        assert!(out.stderr.contains("no result"));
        assert_eq!(runner.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unfinished_job_is_failed_at_deadline() {
        let (backend, runner) = backend(|r| {
            r.write_result = false;
            r.finish = false;
        });
        let started = std::time::Instant::now();
        let out = backend
            .run_script(ScriptRequest::raw("sleep 999", Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(out.exit_code, -1);
        assert!(out.stderr.contains("timed out"));
        assert_eq!(runner.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ensure_ready_probes_store() {
        let (backend, _) = backend(|_| {});
        backend.ensure_ready().await.unwrap();
    }

    #[tokio::test]
    async fn file_urls_are_created_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("state");
        let url = url::Url::from_directory_path(&root).unwrap();
        let (store, prefix) = open_state_store(url.as_str()).unwrap();
        assert!(root.exists());
        let sessions = ObjectSessionStore::new(store, prefix, "/workspace");
        sessions.probe().await.unwrap();
    }
}
