//! Configuration surface for the sandbox engine.
//!
//! Everything here is loaded from an optional JSON file; every field has a
//! default so an empty object (or no file at all) is a valid configuration.

use crate::error::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Container,
    ManagedJob,
}

impl std::str::FromStr for BackendKind {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "container" | "docker" => Ok(BackendKind::Container),
            "managed_job" | "managed-job" | "job" => Ok(BackendKind::ManagedJob),
            other => Err(SandboxError::Config(format!("unknown backend '{}'", other))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Container => f.write_str("container"),
            BackendKind::ManagedJob => f.write_str("managed_job"),
        }
    }
}

/// What to do when no process-to-socket lookup tool exists in the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipPolicy {
    #[default]
    FailOpen,
    FailClosed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_workspace_root")]
    pub workspace_root: String,
    #[serde(default = "default_capture_dir")]
    pub capture_dir: String,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub managed_job: ManagedJobConfig,
    #[serde(default)]
    pub launch: LaunchConfig,
    #[serde(default)]
    pub background: BackgroundConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Address of an already running container agent. When unset a
    /// container is started from `image`.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_cdp_port")]
    pub cdp_port: Option<u16>,
    #[serde(default = "default_vnc_port")]
    pub vnc_port: u16,
    #[serde(default = "default_ready_retries")]
    pub ready_retries: u32,
    #[serde(default = "default_ready_interval_ms")]
    pub ready_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedJobConfig {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_image")]
    pub image: String,
    /// Object store URL holding session state and job results,
    /// e.g. `s3://bucket/prefix` or `file:///var/lib/sandbox`.
    #[serde(default)]
    pub state_store_url: Option<String>,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpu")]
    pub cpu: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_grace_secs")]
    pub poll_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    #[serde(default = "default_allowed_binaries")]
    pub allowed_binaries: Vec<String>,
    #[serde(default = "default_forbidden_args")]
    pub forbidden_args: Vec<String>,
    #[serde(default = "default_forbidden_env_vars")]
    pub forbidden_env_vars: Vec<String>,
    #[serde(default = "default_max_servers")]
    pub max_servers: usize,
    #[serde(default = "default_start_time_tolerance_secs")]
    pub start_time_tolerance_secs: u64,
    #[serde(default)]
    pub ownership_policy: OwnershipPolicy,
    #[serde(default = "default_health_check_retries")]
    pub health_check_retries: u32,
    #[serde(default = "default_health_check_timeout_secs")]
    pub health_check_timeout_secs: u64,
    #[serde(default = "default_url_detect_timeout_secs")]
    pub url_detect_timeout_secs: u64,
    #[serde(default = "default_url_poll_interval_ms")]
    pub url_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundConfig {
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    #[serde(default = "default_max_log_read_bytes")]
    pub max_log_read_bytes: u64,
}

fn default_timeout_secs() -> u64 { 120 }
fn default_workspace_root() -> String { "/workspace".to_string() }
fn default_capture_dir() -> String { "/tmp".to_string() }
fn default_image() -> String { "agent-sandbox:latest".to_string() }
fn default_name_prefix() -> String { "sandbox".to_string() }
fn default_api_port() -> u16 { 8080 }
fn default_cdp_port() -> Option<u16> { Some(9222) }
fn default_vnc_port() -> u16 { 5901 }
fn default_ready_retries() -> u32 { 30 }
fn default_ready_interval_ms() -> u64 { 2000 }
fn default_memory() -> String { "512Mi".to_string() }
fn default_cpu() -> String { "1".to_string() }
fn default_poll_interval_ms() -> u64 { 2000 }
fn default_poll_grace_secs() -> u64 { 30 }
fn default_max_servers() -> usize { 10 }
fn default_start_time_tolerance_secs() -> u64 { 2 }
fn default_health_check_retries() -> u32 { 3 }
fn default_health_check_timeout_secs() -> u64 { 5 }
fn default_url_detect_timeout_secs() -> u64 { 10 }
fn default_url_poll_interval_ms() -> u64 { 500 }
fn default_kill_grace_ms() -> u64 { 1000 }
fn default_max_log_read_bytes() -> u64 { 10 * 1024 * 1024 }

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub fn default_allowed_binaries() -> Vec<String> {
    strings(&[
        "npm", "node", "python", "python3", "flask", "uvicorn", "gunicorn", "django-admin",
        "php", "ruby", "rails", "deno", "bun", "pnpm", "yarn", "next", "vite",
        "webpack-dev-server",
    ])
}

pub fn default_forbidden_args() -> Vec<String> {
    strings(&[
        "-c", "-e", "-i", "-r", "--eval", "--print", "--interactive", "--require", "--import",
        "--loader", "--experimental-loader", "exec", "eval",
    ])
}

pub fn default_forbidden_env_vars() -> Vec<String> {
    strings(&[
        "LD_PRELOAD", "LD_LIBRARY_PATH", "LD_AUDIT", "DYLD_INSERT_LIBRARIES", "DYLD_LIBRARY_PATH",
        "PATH", "PYTHONPATH", "PYTHONSTARTUP", "NODE_OPTIONS", "NODE_PATH", "RUBYOPT", "RUBYLIB",
        "PERL5OPT", "BASH_ENV", "ENV",
    ])
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            default_timeout_secs: default_timeout_secs(),
            workspace_root: default_workspace_root(),
            capture_dir: default_capture_dir(),
            container: ContainerConfig::default(),
            managed_job: ManagedJobConfig::default(),
            launch: LaunchConfig::default(),
            background: BackgroundConfig::default(),
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            address: None,
            image: default_image(),
            name_prefix: default_name_prefix(),
            network: None,
            api_port: default_api_port(),
            cdp_port: default_cdp_port(),
            vnc_port: default_vnc_port(),
            ready_retries: default_ready_retries(),
            ready_interval_ms: default_ready_interval_ms(),
        }
    }
}

impl Default for ManagedJobConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            token: None,
            image: default_image(),
            state_store_url: None,
            memory: default_memory(),
            cpu: default_cpu(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_grace_secs: default_poll_grace_secs(),
        }
    }
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            allowed_binaries: default_allowed_binaries(),
            forbidden_args: default_forbidden_args(),
            forbidden_env_vars: default_forbidden_env_vars(),
            max_servers: default_max_servers(),
            start_time_tolerance_secs: default_start_time_tolerance_secs(),
            ownership_policy: OwnershipPolicy::default(),
            health_check_retries: default_health_check_retries(),
            health_check_timeout_secs: default_health_check_timeout_secs(),
            url_detect_timeout_secs: default_url_detect_timeout_secs(),
            url_poll_interval_ms: default_url_poll_interval_ms(),
        }
    }
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            kill_grace_ms: default_kill_grace_ms(),
            max_log_read_bytes: default_max_log_read_bytes(),
        }
    }
}

impl SandboxConfig {
    /// Load from a JSON file, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SandboxError::Config(format!("read {}: {}", path.display(), e)))?;
        serde_json::from_str(&raw)
            .map_err(|e| SandboxError::Config(format!("parse {}: {}", path.display(), e)))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}
