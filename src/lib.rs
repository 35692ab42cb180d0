//! Stateful, sandboxed command execution for autonomous agents.
//!
//! Commands run inside an isolated environment (a long-lived container or
//! single-use managed jobs) while the working directory, exported variables
//! and background processes of each named session carry over between calls.

#[cfg(not(unix))]
compile_error!("agent-sandbox only works on Unix.");

pub mod api;
pub mod background;
pub mod backend;
pub mod config;
pub mod error;
pub mod http_server;
pub mod job_exec;
pub mod local;
pub mod probe;
pub mod sandbox;
pub mod security;
pub mod selector;
pub mod servers;
pub mod state;
pub mod wrapper;

pub use error::{Result, SandboxError};
pub use sandbox::{Sandbox, ToolResult};
