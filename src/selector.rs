//! Backend selection from configuration.

use crate::backend::{ContainerBackend, ExecutionBackend, ManagedJobBackend};
use crate::config::{BackendKind, SandboxConfig};
use crate::error::Result;
use crate::sandbox::Sandbox;
use crate::state::{MemoryStore, SessionStore};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Which backend was chosen and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Selection {
    pub kind: BackendKind,
    pub requested: BackendKind,
    pub reason: String,
}

/// Decide which backend to use. The managed-job backend needs both a job
/// endpoint and a state store; without them the container backend is used.
pub fn select(config: &SandboxConfig) -> Selection {
    let requested = config.backend;
    if requested == BackendKind::ManagedJob {
        let mut missing = Vec::new();
        if config.managed_job.endpoint.is_none() {
            missing.push("managed_job.endpoint");
        }
        if config.managed_job.state_store_url.is_none() {
            missing.push("managed_job.state_store_url");
        }
        if !missing.is_empty() {
            let reason = format!("falling back to container: {} not configured", missing.join(", "));
            warn!(%reason, "Managed-job backend unavailable");
            return Selection {
                kind: BackendKind::Container,
                requested,
                reason,
            };
        }
    }
    Selection {
        kind: requested,
        requested,
        reason: "requested".to_string(),
    }
}

/// Build a sandbox on the selected backend.
pub async fn create_sandbox(config: SandboxConfig) -> Result<Sandbox> {
    let selection = select(&config);
    let (backend, store): (Arc<dyn ExecutionBackend>, Arc<dyn SessionStore>) = match selection.kind {
        BackendKind::Container => {
            let backend: Arc<dyn ExecutionBackend> = Arc::new(ContainerBackend::create(&config.container).await?);
            let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new(config.workspace_root.clone()));
            (backend, store)
        }
        BackendKind::ManagedJob => {
            let jobs = ManagedJobBackend::create(&config.managed_job, &config.workspace_root)?;
            let store: Arc<dyn SessionStore> = Arc::new(jobs.session_store());
            let backend: Arc<dyn ExecutionBackend> = Arc::new(jobs);
            (backend, store)
        }
    };
    info!(backend = %selection.kind, id = backend.id(), "Created sandbox");
    Ok(Sandbox::new(config, selection, backend, store))
}
