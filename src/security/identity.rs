//! Process identity checks: start-time fingerprints and port ownership.
//!
//! PIDs get reused. Before a tracked server is signalled its start time is
//! compared against the one recorded at launch, and after launch the port
//! it claims is checked to actually belong to it.

use crate::config::{LaunchConfig, OwnershipPolicy};
use crate::error::{Result, SandboxError};
use crate::probe::ProcessProbe;
use crate::state::unix_now;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityCheck {
    Unchanged,
    /// The process no longer exists.
    Gone,
}

/// Result of a successful port verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortReport {
    pub port: u16,
    /// False when ownership could not be determined and policy let it pass.
    pub ownership_confirmed: bool,
    /// Last HTTP status seen, if any probe answered.
    pub http_status: Option<u16>,
    pub responsive: bool,
}

pub struct IdentityVerifier {
    probe: Arc<dyn ProcessProbe>,
    tolerance: u64,
    policy: OwnershipPolicy,
    health_retries: u32,
    health_timeout: Duration,
    retry_delay: Duration,
}

impl IdentityVerifier {
    pub fn new(probe: Arc<dyn ProcessProbe>, config: &LaunchConfig) -> Self {
        Self {
            probe,
            tolerance: config.start_time_tolerance_secs,
            policy: config.ownership_policy,
            health_retries: config.health_check_retries.max(1),
            health_timeout: Duration::from_secs(config.health_check_timeout_secs),
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Start time of `pid` as unix seconds, `None` if it is not running.
    pub async fn fingerprint(&self, pid: u32) -> Result<Option<u64>> {
        Ok(self
            .probe
            .elapsed_secs(pid)
            .await?
            .map(|elapsed| unix_now().saturating_sub(elapsed)))
    }

    /// Compare the current start time of `pid` against `recorded`.
    pub async fn check_unchanged(&self, pid: u32, recorded: u64) -> Result<IdentityCheck> {
        let Some(current) = self.fingerprint(pid).await? else {
            info!(pid, "Tracked process is gone");
            return Ok(IdentityCheck::Gone);
        };
        let drift = current.abs_diff(recorded);
        if drift > self.tolerance {
            let reason = format!(
                "start time changed by {}s (recorded {}, now {}), pid was likely reused",
                drift, recorded, current
            );
            error!(pid, %reason, "SECURITY ALERT: process identity mismatch");
            return Err(SandboxError::SecurityAlert { pid, reason });
        }
        Ok(IdentityCheck::Unchanged)
    }

    /// Verify that `port` is listening, owned by `pid` (or its process
    /// group) and answering HTTP at `url`.
    pub async fn verify_port(&self, pid: u32, port: u16, url: &str) -> Result<PortReport> {
        if !self.probe.is_listening(port).await? {
            return Err(SandboxError::Verification(format!("port {} is not listening", port)));
        }

        let ownership_confirmed = match self.probe.socket_owners(port).await? {
            Some(owners) if !owners.is_empty() => {
                for owner in owners {
                    if owner == pid {
                        continue;
                    }
                    let group = self.probe.process_group(owner).await?;
                    if group != Some(pid) {
                        let reason = format!("port {} is held by pid {} outside the tracked process group", port, owner);
                        error!(pid, owner, port, "SECURITY ALERT: port hijack");
                        return Err(SandboxError::SecurityAlert { pid, reason });
                    }
                }
                true
            }
            _ => match self.policy {
                OwnershipPolicy::FailOpen => {
                    warn!(pid, port, "Port ownership could not be determined, allowing");
                    false
                }
                OwnershipPolicy::FailClosed => {
                    return Err(SandboxError::Verification(format!(
                        "ownership of port {} could not be determined",
                        port
                    )));
                }
            },
        };

        let mut http_status = None;
        let mut responsive = false;
        for attempt in 1..=self.health_retries {
            match self.probe.http_status(url, self.health_timeout).await? {
                None => {
                    warn!(url, "No HTTP client in sandbox, skipping health check");
                    break;
                }
                Some(status) => {
                    http_status = Some(status);
                    if (200..500).contains(&status) {
                        responsive = true;
                        break;
                    }
                    info!(url, status, attempt, "Server still starting");
                }
            }
            if attempt < self.health_retries {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Ok(PortReport {
            port,
            ownership_confirmed,
            http_status,
            responsive,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::testing::FakeProbe;
    use std::collections::HashMap;

    fn verifier(probe: Arc<FakeProbe>, policy: OwnershipPolicy) -> IdentityVerifier {
        let config = LaunchConfig {
            ownership_policy: policy,
            ..LaunchConfig::default()
        };
        IdentityVerifier::new(probe, &config).with_retry_delay(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn fingerprint_within_tolerance_is_unchanged() {
        let probe = Arc::new(FakeProbe::default());
        probe.spawn(10, 30);
        let v = verifier(probe.clone(), OwnershipPolicy::FailOpen);
        let recorded = v.fingerprint(10).await.unwrap().unwrap();
        assert_eq!(v.check_unchanged(10, recorded + 1).await.unwrap(), IdentityCheck::Unchanged);
    }

    #[tokio::test]
    async fn reused_pid_raises_alert() {
        let probe = Arc::new(FakeProbe::default());
        probe.spawn(10, 30);
        let v = verifier(probe.clone(), OwnershipPolicy::FailOpen);
        let recorded = v.fingerprint(10).await.unwrap().unwrap();

        // Same pid, new process that started just now.
        probe.elapsed.lock().unwrap().insert(10, 0);
        let err = v.check_unchanged(10, recorded).await.unwrap_err();
        assert!(err.is_security_alert());
    }

    #[tokio::test]
    async fn vanished_process_is_gone() {
        let probe = Arc::new(FakeProbe::default());
        let v = verifier(probe, OwnershipPolicy::FailOpen);
        assert_eq!(v.check_unchanged(99, 1).await.unwrap(), IdentityCheck::Gone);
    }

    #[tokio::test]
    async fn foreign_owner_is_a_hijack() {
        let probe = Arc::new(FakeProbe::default());
        probe.spawn(100, 1);
        probe.spawn(200, 1);
        probe.listening.lock().unwrap().insert(3000);
        *probe.owners.lock().unwrap() = Some(HashMap::from([(3000, vec![200])]));
        *probe.http.lock().unwrap() = Some(200);

        let err = verifier(probe, OwnershipPolicy::FailOpen)
            .verify_port(100, 3000, "http://localhost:3000")
            .await
            .unwrap_err();
        assert!(err.is_security_alert());
        assert!(err.to_string().contains("pid 200"));
    }

    #[tokio::test]
    async fn child_in_process_group_owns_port() {
        let probe = Arc::new(FakeProbe::default());
        probe.spawn(100, 1);
        probe.spawn(101, 1);
        probe.groups.lock().unwrap().insert(101, 100);
        probe.listening.lock().unwrap().insert(8000);
        *probe.owners.lock().unwrap() = Some(HashMap::from([(8000, vec![101])]));
        *probe.http.lock().unwrap() = Some(404);

        let report = verifier(probe, OwnershipPolicy::FailOpen)
            .verify_port(100, 8000, "http://localhost:8000")
            .await
            .unwrap();
        assert!(report.ownership_confirmed);
        assert!(report.responsive);
    }

    #[tokio::test]
    async fn missing_lsof_follows_policy() {
        let probe = Arc::new(FakeProbe::default());
        probe.listening.lock().unwrap().insert(5000);
        *probe.http.lock().unwrap() = Some(503);

        let report = verifier(probe.clone(), OwnershipPolicy::FailOpen)
            .verify_port(1, 5000, "http://localhost:5000")
            .await
            .unwrap();
        assert!(!report.ownership_confirmed);
        assert!(!report.responsive);
        assert_eq!(report.http_status, Some(503));

        let err = verifier(probe, OwnershipPolicy::FailClosed)
            .verify_port(1, 5000, "http://localhost:5000")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Verification(_)));
    }

    #[tokio::test]
    async fn closed_port_fails_verification() {
        let probe = Arc::new(FakeProbe::default());
        let err = verifier(probe, OwnershipPolicy::FailOpen)
            .verify_port(1, 4000, "http://localhost:4000")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "verification");
    }
}
