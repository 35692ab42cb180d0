//! The in-job side of the managed-job backend.
//!
//! A job service launches `agent-sandbox job-exec` with the fields of a
//! [`JobSpec`](crate::backend::managed_job::JobSpec) in the environment. The
//! executor runs the script, derives the post-execution session state from
//! the output markers and writes a [`JobRecord`] for the orchestrator.

use crate::backend::managed_job::{open_state_store, write_record, JobRecord};
use crate::error::{Result, SandboxError};
use crate::local::{self, RunConfig};
use crate::state::{Session, DEFAULT_SESSION};
use crate::wrapper::{parse_output, SessionDelta};
use object_store::{path::Path as ObjPath, ObjectStore};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Inputs of one job execution.
#[derive(Debug, Clone)]
pub struct JobInput {
    pub execution_id: String,
    pub session: String,
    pub script: String,
    pub command: Option<String>,
    pub snapshot: Option<Session>,
    pub timeout: Duration,
    pub workspace_root: String,
    pub capture_dir: String,
}

fn required(name: &str) -> Result<String> {
    std::env::var(name).map_err(|_| SandboxError::Config(format!("{} is not set", name)))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl JobInput {
    pub fn from_env() -> Result<Self> {
        let snapshot = match optional("SANDBOX_SNAPSHOT") {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };
        let timeout_secs = optional("SANDBOX_TIMEOUT_SECS")
            .map(|v| v.parse::<u64>().map_err(|_| SandboxError::Config(format!("invalid SANDBOX_TIMEOUT_SECS '{}'", v))))
            .transpose()?
            .unwrap_or(120);
        Ok(Self {
            execution_id: required("SANDBOX_EXECUTION_ID")?,
            session: optional("SANDBOX_SESSION").unwrap_or_else(|| DEFAULT_SESSION.to_string()),
            script: required("SANDBOX_SCRIPT")?,
            command: optional("SANDBOX_COMMAND"),
            snapshot,
            timeout: Duration::from_secs(timeout_secs),
            workspace_root: optional("SANDBOX_WORKSPACE").unwrap_or_else(|| "/workspace".to_string()),
            capture_dir: optional("SANDBOX_CAPTURE_DIR").unwrap_or_else(|| "/tmp".to_string()),
        })
    }
}

/// Run the job script and build its result record.
pub async fn execute(input: &JobInput) -> Result<JobRecord> {
    let config = RunConfig {
        script: input.script.clone(),
        timeout: input.timeout,
        nofile: 1024,
        scratch_dir: PathBuf::from(&input.capture_dir),
    };
    let result = local::run_script(&config).await?;

    let before = input
        .snapshot
        .clone()
        .unwrap_or_else(|| Session::new(input.workspace_root.clone()));
    let parsed = parse_output(&result.stdout);
    let command = input.command.as_deref().unwrap_or_default();
    let delta = SessionDelta::derive(&input.session, command, &parsed, &input.capture_dir);
    let mut after = before;
    delta.apply(&mut after);

    Ok(JobRecord {
        execution_id: input.execution_id.clone(),
        session: input.session.clone(),
        exit_code: result.status(),
        stdout: result.stdout,
        stderr: result.stderr,
        new_state: Some(after),
    })
}

/// Execute and persist the record where the orchestrator will look for it.
pub async fn run(input: &JobInput, store: &dyn ObjectStore, prefix: &ObjPath) -> Result<JobRecord> {
    let record = execute(input).await?;
    write_record(store, prefix, &record).await?;
    info!(
        execution = %record.execution_id,
        session = %record.session,
        exit = record.exit_code,
        "Wrote job result"
    );
    Ok(record)
}

/// Entry point for `job-exec`: everything comes from the environment.
pub async fn run_from_env() -> Result<JobRecord> {
    let input = JobInput::from_env()?;
    let (store, prefix) = open_state_store(&required("SANDBOX_STATE_STORE")?)?;
    run(&input, store.as_ref(), &prefix).await
}
