//! Dev-server supervision: validated launch, identity fingerprinting, URL
//! discovery and verified shutdown.

use crate::background::{BackgroundManager, KillReport, KillSelector};
use crate::config::LaunchConfig;
use crate::error::{Result, SandboxError};
use crate::security::{IdentityCheck, IdentityVerifier, LaunchValidator, PortReport};
use crate::wrapper::StatefulExecutor;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{error, info, warn};

static PORT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r":(\d+)", r"\b(\d{4,5})\b", r"--port[=\s]+(\d+)", r"-p\s+(\d+)"]
        .iter()
        .map(|p| Regex::new(p).expect("valid port pattern"))
        .collect()
});

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:(https?)://)?(localhost|127\.0\.0\.1|0\.0\.0\.0|\[::1\]):(\d{2,5})").expect("valid url pattern")
});

/// Port a server command is expected to listen on, if the command says.
pub fn extract_port(command: &str) -> Option<u16> {
    PORT_PATTERNS.iter().find_map(|pattern| {
        pattern
            .captures_iter(command)
            .filter_map(|c| c.get(1)?.as_str().parse::<u32>().ok())
            .find(|port| (1024..=65535).contains(port))
            .and_then(|port| u16::try_from(port).ok())
    })
}

/// First local listen URL announced in `output`. `0.0.0.0` becomes
/// `localhost`.
pub fn detect_url(output: &str) -> Option<String> {
    let captures = URL_PATTERN.captures(output)?;
    let scheme = captures.get(1).map_or("http", |m| m.as_str());
    let host = match &captures[2] {
        "0.0.0.0" => "localhost",
        other => other,
    };
    Some(format!("{}://{}:{}", scheme, host, &captures[3]))
}

fn url_port(url: &str) -> Option<u16> {
    url.rsplit(':').next()?.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedServer {
    pub pid: u32,
    pub session: String,
    pub command: String,
    pub port: Option<u16>,
    pub url: Option<String>,
    /// Start time fingerprint, unix seconds.
    pub started_at: u64,
    pub verified: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    #[serde(flatten)]
    pub server: TrackedServer,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartedServer {
    pub server: TrackedServer,
    pub report: Option<PortReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopReport {
    pub pid: u32,
    pub already_stopped: bool,
    pub kill: Option<KillReport>,
}

pub struct ServerSupervisor {
    executor: StatefulExecutor,
    background: BackgroundManager,
    validator: LaunchValidator,
    verifier: IdentityVerifier,
    servers: Mutex<HashMap<u32, TrackedServer>>,
    max_servers: usize,
    url_timeout: Duration,
    url_interval: Duration,
}

impl ServerSupervisor {
    pub fn new(executor: StatefulExecutor, background: BackgroundManager, config: &LaunchConfig) -> Self {
        let verifier = IdentityVerifier::new(background.probe().clone(), config);
        Self {
            executor,
            background,
            validator: LaunchValidator::from_config(config),
            verifier,
            servers: Mutex::new(HashMap::new()),
            max_servers: config.max_servers,
            url_timeout: Duration::from_secs(config.url_detect_timeout_secs),
            url_interval: Duration::from_millis(config.url_poll_interval_ms),
        }
    }

    pub fn with_verifier(mut self, verifier: IdentityVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn validator(&self) -> &LaunchValidator {
        &self.validator
    }

    /// Validate, launch in the background and verify a dev server.
    pub async fn start(&self, session: &str, command: &str) -> Result<StartedServer> {
        self.validator.validate(command)?;

        let mut servers = self.servers.lock().await;
        if servers.len() >= self.max_servers {
            return Err(SandboxError::ServerLimit(servers.len()));
        }

        let result = self.executor.execute(session, &format!("{} &", command), None).await;
        let Some(pid) = result.background_pid else {
            return Err(SandboxError::Backend(format!(
                "server did not start (exit {}): {}",
                result.exit_code,
                result.stderr.trim()
            )));
        };

        let started_at = match self.verifier.fingerprint(pid).await {
            Ok(Some(started_at)) => started_at,
            Ok(None) => {
                let logs = self.background.logs(pid).await.ok().flatten().unwrap_or_default();
                self.background.evict(pid).await?;
                return Err(SandboxError::Verification(format!(
                    "server exited immediately: {}",
                    logs.trim()
                )));
            }
            Err(e) => {
                warn!(pid, error = %e, "Could not fingerprint server");
                self.discard(pid).await;
                return Err(e);
            }
        };
        info!(pid, session, command, started_at, "Server launched");

        let mut server = TrackedServer {
            pid,
            session: session.to_string(),
            command: command.to_string(),
            port: extract_port(command),
            url: None,
            started_at,
            verified: false,
        };

        server.url = self.wait_for_url(pid).await;
        if server.url.is_none() {
            server.url = server.port.map(|port| format!("http://localhost:{}", port));
        }
        if let Some(port) = server.url.as_deref().and_then(url_port) {
            server.port = Some(port);
        }

        let report = match (server.port, server.url.clone()) {
            (Some(port), Some(url)) => match self.verifier.verify_port(pid, port, &url).await {
                Ok(report) => Some(report),
                Err(e) => {
                    if e.is_security_alert() {
                        error!(pid, error = %e, "Refusing to track server");
                    } else {
                        warn!(pid, error = %e, "Server verification failed");
                    }
                    self.discard(pid).await;
                    return Err(e);
                }
            },
            _ => {
                warn!(pid, "No port found for server, skipping verification");
                None
            }
        };
        server.verified = report.is_some();

        servers.insert(pid, server.clone());
        Ok(StartedServer { server, report })
    }

    /// Best-effort cleanup of a server that failed verification. The
    /// background record goes even when the kill could not be confirmed.
    async fn discard(&self, pid: u32) {
        if let Err(e) = self.background.kill(KillSelector::Pid(pid)).await {
            warn!(pid, error = %e, "Failed to clean up unverified server");
        }
        if let Err(e) = self.background.evict(pid).await {
            warn!(pid, error = %e, "Failed to evict unverified server");
        }
    }

    async fn wait_for_url(&self, pid: u32) -> Option<String> {
        let deadline = Instant::now() + self.url_timeout;
        loop {
            if let Ok(Some(logs)) = self.background.logs(pid).await {
                if let Some(url) = detect_url(&logs) {
                    return Some(url);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(self.url_interval).await;
        }
    }

    /// Stop a tracked server after confirming it is still the same process.
    pub async fn stop(&self, pid: u32) -> Result<StopReport> {
        let mut servers = self.servers.lock().await;
        let server = servers.get(&pid).cloned().ok_or(SandboxError::UntrackedProcess(pid))?;

        match self.verifier.check_unchanged(pid, server.started_at).await {
            Err(e) => {
                servers.remove(&pid);
                self.background.evict(pid).await?;
                Err(e)
            }
            Ok(IdentityCheck::Gone) => {
                servers.remove(&pid);
                self.background.evict(pid).await?;
                Ok(StopReport {
                    pid,
                    already_stopped: true,
                    kill: None,
                })
            }
            Ok(IdentityCheck::Unchanged) => {
                let kill = match self.background.kill(KillSelector::Pid(pid)).await {
                    Ok(report) => Some(report),
                    Err(SandboxError::UntrackedProcess(_)) => None,
                    Err(e) => return Err(e),
                };
                if let Some(report) = &kill {
                    if report.survivors.contains(&pid) || report.failed.contains(&pid) {
                        error!(pid, "Server is still running after stop");
                        return Err(SandboxError::Backend(format!(
                            "server {} could not be stopped and is still tracked",
                            pid
                        )));
                    }
                }
                servers.remove(&pid);
                info!(pid, "Server stopped");
                Ok(StopReport {
                    pid,
                    already_stopped: false,
                    kill,
                })
            }
        }
    }

    /// Kill background processes. Any target that is a tracked server gets
    /// the start-time check first. A PID that fails it is evicted without a
    /// signal: a `Pid` selector returns the alert, wider selectors list it in
    /// `refused` and carry on with the rest.
    pub async fn kill(&self, selector: KillSelector) -> Result<KillReport> {
        let mut servers = self.servers.lock().await;
        let mut targets = self.background.resolve(&selector).await?;
        let single = matches!(selector, KillSelector::Pid(_));
        let mut refused = Vec::new();
        let mut unchecked = Vec::new();

        for pids in targets.values_mut() {
            for pid in std::mem::take(pids) {
                let Some(started_at) = servers.get(&pid).map(|server| server.started_at) else {
                    pids.push(pid);
                    continue;
                };
                match self.verifier.check_unchanged(pid, started_at).await {
                    Ok(_) => pids.push(pid),
                    Err(e) if e.is_security_alert() => {
                        servers.remove(&pid);
                        self.background.evict(pid).await?;
                        if single {
                            return Err(e);
                        }
                        refused.push(pid);
                    }
                    Err(e) if single => return Err(e),
                    Err(e) => {
                        warn!(pid, error = %e, "Could not verify server identity, leaving it running");
                        unchecked.push(pid);
                    }
                }
            }
        }

        let mut report = self.background.kill_targets(targets).await?;
        for pid in report.killed_pids.iter().chain(&report.already_exited) {
            servers.remove(pid);
        }
        report.failed.extend(unchecked);
        report.refused = refused;
        info!(
            ?selector,
            killed = report.killed_count,
            refused = report.refused.len(),
            failed = report.failed.len(),
            "Killed background processes"
        );
        Ok(report)
    }

    /// Tracked servers with liveness, optionally limited to one session.
    pub async fn list(&self, session: Option<&str>) -> Vec<ServerStatus> {
        let servers: Vec<TrackedServer> = self
            .servers
            .lock()
            .await
            .values()
            .filter(|server| session.map_or(true, |key| server.session == key))
            .cloned()
            .collect();
        let mut statuses = Vec::with_capacity(servers.len());
        for server in servers {
            let running = self.background.probe().is_alive(server.pid).await.unwrap_or(false);
            statuses.push(ServerStatus { server, running });
        }
        statuses.sort_by_key(|s| s.server.pid);
        statuses
    }

    /// Last `tail_lines` lines of a tracked server's output.
    pub async fn logs(&self, pid: u32, tail_lines: usize) -> Result<Option<String>> {
        if !self.servers.lock().await.contains_key(&pid) {
            return Err(SandboxError::UntrackedProcess(pid));
        }
        let Some(logs) = self.background.logs(pid).await? else {
            return Ok(None);
        };
        let lines: Vec<&str> = logs.lines().collect();
        let start = lines.len().saturating_sub(tail_lines);
        Ok(Some(lines[start..].join("\n")))
    }
}
