//! Error types shared across the engine.

use std::time::Duration;
use thiserror::Error;

/// Reasons the launch validator refuses a server command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchRejection {
    #[error("command is empty")]
    Empty,
    #[error("command could not be tokenized: {0}")]
    Unparseable(String),
    #[error("command contains dangerous shell metacharacter {0:?}")]
    ShellMetacharacter(char),
    #[error("executable '{0}' must be a bare binary name, paths are not allowed")]
    PathInExecutable(String),
    #[error("executable '{0}' is not allowed")]
    BinaryNotAllowed(String),
    #[error("forbidden argument '{0}'")]
    ForbiddenArgument(String),
    #[error("setting environment variable {0} is forbidden")]
    ForbiddenEnvVar(String),
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("state store error: {0}")]
    Store(#[from] object_store::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid session key '{0}'")]
    InvalidSessionKey(String),
    #[error("launch rejected: {0}")]
    LaunchRejected(#[from] LaunchRejection),
    #[error("SECURITY ALERT for pid {pid}: {reason}")]
    SecurityAlert { pid: u32, reason: String },
    #[error("process {0} is not tracked by this sandbox")]
    UntrackedProcess(u32),
    #[error("sandbox not ready: {0}")]
    NotReady(String),
    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),
    #[error("verification failed: {0}")]
    Verification(String),
    #[error("server limit reached: {0} servers already running")]
    ServerLimit(usize),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl SandboxError {
    /// Short machine-readable tag used in tool results.
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::Transport(_) | SandboxError::Http(_) => "transport",
            SandboxError::Timeout(_) => "timeout",
            SandboxError::Store(_) => "store",
            SandboxError::Json(_) => "json",
            SandboxError::Io(_) => "io",
            SandboxError::InvalidSessionKey(_) => "invalid_session",
            SandboxError::LaunchRejected(_) => "validation",
            SandboxError::SecurityAlert { .. } => "security_alert",
            SandboxError::UntrackedProcess(_) => "untracked_process",
            SandboxError::NotReady(_) => "not_ready",
            SandboxError::Unsupported(_) => "unsupported",
            SandboxError::Verification(_) => "verification",
            SandboxError::ServerLimit(_) => "limit",
            SandboxError::Backend(_) => "backend",
            SandboxError::Config(_) => "config",
            SandboxError::InvalidArgument(_) => "invalid_argument",
        }
    }

    pub fn is_security_alert(&self) -> bool {
        matches!(self, SandboxError::SecurityAlert { .. })
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
