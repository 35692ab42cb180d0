//! Execution backends: where wrapped scripts actually run.
//!
//! A backend does not keep shell state itself. It runs whatever script the
//! wrapper hands it and returns the raw output; file operations default to
//! generated shell scripts so a backend only has to provide `run_script`.

pub mod container;
pub mod managed_job;
mod shell_ops;

use crate::api::SearchMatch;
use crate::config::BackendKind;
use crate::error::Result;
use crate::state::Session;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

pub use container::ContainerBackend;
pub use managed_job::{HttpJobRunner, JobRunner, ManagedJobBackend};

/// Upper bound for a single download.
pub const MAX_TRANSFER_BYTES: u64 = 500 * 1024 * 1024;

/// A script to run inside the sandbox.
#[derive(Debug, Clone)]
pub struct ScriptRequest {
    pub session: String,
    /// The caller's command before wrapping, when there is one.
    pub command: Option<String>,
    pub script: String,
    pub timeout: Duration,
    /// Session state the script was built from.
    pub snapshot: Option<Session>,
}

impl ScriptRequest {
    /// A one-off script with no session bookkeeping attached.
    pub fn raw(script: impl Into<String>, timeout: Duration) -> Self {
        Self {
            session: crate::state::DEFAULT_SESSION.to_string(),
            command: None,
            script: script.into(),
            timeout,
            snapshot: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Post-execution state reported by backends that compute it themselves.
    pub snapshot: Option<Session>,
}

impl RawOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
            snapshot: None,
        }
    }
}

/// Endpoints for driving a browser inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteControl {
    pub cdp_url: String,
    pub vnc_url: Option<String>,
}

#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn id(&self) -> &str;

    /// Extra time the backend may need beyond a command's own timeout.
    fn timeout_slack(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn ensure_ready(&self) -> Result<()>;

    /// Tear down the environment. Cleanup failures are logged, not returned.
    async fn destroy(&self) -> Result<()>;

    async fn run_script(&self, request: ScriptRequest) -> Result<RawOutput>;

    fn remote_control(&self) -> Option<RemoteControl> {
        None
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        shell_ops::read_file(self, path).await
    }

    async fn write_file(&self, path: &str, content: &str, append: bool) -> Result<u64> {
        shell_ops::write_bytes(self, path, content.as_bytes(), append).await
    }

    async fn replace_in_file(&self, path: &str, old: &str, new: &str) -> Result<usize> {
        shell_ops::replace_in_file(self, path, old, new).await
    }

    async fn search_file(&self, path: &str, pattern: &str) -> Result<Vec<SearchMatch>> {
        shell_ops::search_file(self, path, pattern).await
    }

    async fn find_files(&self, dir: &str, glob: &str) -> Result<Vec<String>> {
        shell_ops::find_files(self, dir, glob).await
    }

    async fn delete_path(&self, path: &str) -> Result<()> {
        shell_ops::delete_path(self, path).await
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<String>> {
        shell_ops::list_dir(self, path).await
    }

    async fn upload(&self, path: &str, data: &[u8]) -> Result<u64> {
        shell_ops::write_bytes(self, path, data, false).await
    }

    async fn download(&self, path: &str) -> Result<Vec<u8>> {
        shell_ops::download(self, path).await
    }
}
