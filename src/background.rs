//! Background process registry operations: list, kill and log retrieval.

use crate::error::{Result, SandboxError};
use crate::probe::{ProcessProbe, Signal};
use crate::state::{SessionLocks, SessionStore};
use crate::wrapper::capture_path;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Which tracked processes a kill applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KillSelector {
    Pid(u32),
    Session(String),
    /// Substring of the recorded command.
    Pattern(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackgroundInfo {
    pub session: String,
    pub command: String,
    pub pid: u32,
    pub running: bool,
    pub log_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KillReport {
    pub killed_count: usize,
    pub killed_pids: Vec<u32>,
    /// Tracked PIDs that were already gone.
    pub already_exited: Vec<u32>,
    /// PIDs still alive after SIGKILL.
    pub survivors: Vec<u32>,
    /// PIDs whose termination could not be confirmed. They stay tracked.
    pub failed: Vec<u32>,
    /// Tracked servers whose identity check failed. They were evicted
    /// without a signal.
    pub refused: Vec<u32>,
}

enum Outcome {
    Killed,
    AlreadyExited,
    Survived,
}

#[derive(Clone)]
pub struct BackgroundManager {
    store: Arc<dyn SessionStore>,
    locks: SessionLocks,
    probe: Arc<dyn ProcessProbe>,
    grace: Duration,
    max_log_bytes: u64,
    capture_dir: String,
}

impl BackgroundManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        locks: SessionLocks,
        probe: Arc<dyn ProcessProbe>,
        grace: Duration,
        max_log_bytes: u64,
        capture_dir: impl Into<String>,
    ) -> Self {
        Self {
            store,
            locks,
            probe,
            grace,
            max_log_bytes,
            capture_dir: capture_dir.into(),
        }
    }

    pub fn probe(&self) -> &Arc<dyn ProcessProbe> {
        &self.probe
    }

    async fn session_keys(&self, session: Option<&str>) -> Result<Vec<String>> {
        match session {
            Some(key) => Ok(vec![key.to_string()]),
            None => self.store.keys().await,
        }
    }

    /// Tracked processes, with liveness re-derived on every call.
    pub async fn list(&self, session: Option<&str>) -> Result<Vec<BackgroundInfo>> {
        let mut entries = Vec::new();
        for key in self.session_keys(session).await? {
            let state = self.store.load(&key).await;
            for (pid, record) in state.background {
                entries.push(BackgroundInfo {
                    session: key.clone(),
                    command: record.command,
                    pid,
                    running: false,
                    log_path: record.log_path,
                });
            }
        }

        let liveness = join_all(entries.iter().map(|e| self.probe.is_alive(e.pid))).await;
        for (entry, alive) in entries.iter_mut().zip(liveness) {
            entry.running = alive.unwrap_or_else(|e| {
                warn!(pid = entry.pid, error = %e, "Liveness probe failed");
                false
            });
        }
        Ok(entries)
    }

    /// Session that tracks `pid`, if any.
    pub async fn find_owner(&self, pid: u32) -> Result<Option<String>> {
        for key in self.store.keys().await? {
            if self.store.load(&key).await.background.contains_key(&pid) {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    /// Resolve the selector to tracked PIDs grouped by owning session.
    pub(crate) async fn resolve(&self, selector: &KillSelector) -> Result<BTreeMap<String, Vec<u32>>> {
        let mut targets: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        match selector {
            KillSelector::Pid(pid) => {
                let owner = self
                    .find_owner(*pid)
                    .await?
                    .ok_or(SandboxError::UntrackedProcess(*pid))?;
                targets.entry(owner).or_default().push(*pid);
            }
            KillSelector::Session(key) => {
                let pids: Vec<u32> = self.store.load(key).await.background.keys().copied().collect();
                if !pids.is_empty() {
                    targets.insert(key.clone(), pids);
                }
            }
            KillSelector::Pattern(pattern) => {
                if pattern.is_empty() {
                    return Err(SandboxError::InvalidArgument("kill pattern must not be empty".into()));
                }
                for key in self.store.keys().await? {
                    let pids: Vec<u32> = self
                        .store
                        .load(&key)
                        .await
                        .background
                        .iter()
                        .filter(|(_, record)| record.command.contains(pattern.as_str()))
                        .map(|(pid, _)| *pid)
                        .collect();
                    if !pids.is_empty() {
                        targets.insert(key, pids);
                    }
                }
            }
        }
        Ok(targets)
    }

    pub async fn kill(&self, selector: KillSelector) -> Result<KillReport> {
        let targets = self.resolve(&selector).await?;
        let report = self.kill_targets(targets).await?;
        info!(
            ?selector,
            killed = report.killed_count,
            exited = report.already_exited.len(),
            failed = report.failed.len(),
            "Killed background processes"
        );
        Ok(report)
    }

    /// Terminate resolved targets. A PID that cannot be terminated is
    /// reported in `failed` and the rest still proceed; each session's
    /// registry is saved with whatever was removed.
    pub(crate) async fn kill_targets(&self, targets: BTreeMap<String, Vec<u32>>) -> Result<KillReport> {
        let mut report = KillReport::default();

        for (key, pids) in targets {
            let _guard = self.locks.lock(&key).await;
            let mut state = self.store.load(&key).await;
            for pid in pids {
                if !state.background.contains_key(&pid) {
                    continue;
                }
                match self.terminate(pid).await {
                    Ok(Outcome::Killed) => {
                        report.killed_pids.push(pid);
                        state.background.remove(&pid);
                    }
                    Ok(Outcome::AlreadyExited) => {
                        report.already_exited.push(pid);
                        state.background.remove(&pid);
                    }
                    Ok(Outcome::Survived) => report.survivors.push(pid),
                    Err(e) => {
                        warn!(pid, session = %key, error = %e, "Failed to terminate background process");
                        report.failed.push(pid);
                    }
                }
            }
            self.store.save(&key, &state).await?;
        }

        report.killed_count = report.killed_pids.len();
        Ok(report)
    }

    /// SIGTERM the group, wait out the grace period, then SIGKILL.
    async fn terminate(&self, pid: u32) -> Result<Outcome> {
        if !self.probe.is_alive(pid).await? {
            return Ok(Outcome::AlreadyExited);
        }
        self.probe.signal(pid, Signal::Term).await?;
        tokio::time::sleep(self.grace).await;
        if self.probe.is_alive(pid).await? {
            warn!(pid, "Process survived SIGTERM, sending SIGKILL");
            self.probe.signal(pid, Signal::Kill).await?;
            tokio::time::sleep(Duration::from_millis(100)).await;
            if self.probe.is_alive(pid).await? {
                return Ok(Outcome::Survived);
            }
        }
        Ok(Outcome::Killed)
    }

    /// Tail of the capture file for `pid`.
    pub async fn logs(&self, pid: u32) -> Result<Option<String>> {
        let log_path = match self.find_owner(pid).await? {
            Some(key) => self
                .store
                .load(&key)
                .await
                .background
                .get(&pid)
                .map(|record| record.log_path.clone()),
            None => None,
        };
        let log_path = log_path.unwrap_or_else(|| capture_path(&self.capture_dir, pid));
        self.probe.read_tail(&log_path, self.max_log_bytes).await
    }

    /// Remove a record without signalling the process.
    pub async fn evict(&self, pid: u32) -> Result<()> {
        if let Some(key) = self.find_owner(pid).await? {
            let _guard = self.locks.lock(&key).await;
            let mut state = self.store.load(&key).await;
            if state.background.remove(&pid).is_some() {
                self.store.save(&key, &state).await?;
                warn!(pid, session = %key, "Evicted background record");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::testing::FakeProbe;
    use crate::state::{BackgroundProcess, MemoryStore, Session};

    async fn setup(tracked: &[(&str, u32, &str)]) -> (BackgroundManager, Arc<FakeProbe>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new("/workspace"));
        let probe = Arc::new(FakeProbe::default());
        for (session, pid, command) in tracked {
            let mut state = store.load(session).await;
            state.background.insert(
                *pid,
                BackgroundProcess {
                    command: command.to_string(),
                    log_path: format!("/tmp/bg_{}.out", pid),
                    session: session.to_string(),
                    registered_at: 0,
                },
            );
            store.save(session, &state).await.unwrap();
            probe.spawn(*pid, 1);
        }
        let manager = BackgroundManager::new(
            store.clone(),
            SessionLocks::default(),
            probe.clone(),
            Duration::from_millis(5),
            1024,
            "/tmp",
        );
        (manager, probe, store)
    }

    #[tokio::test]
    async fn killing_one_pid_leaves_the_rest() {
        let (manager, probe, store) =
            setup(&[("s1", 101, "sleep 30"), ("s1", 102, "sleep 31"), ("s1", 103, "sleep 32")]).await;

        let report = manager.kill(KillSelector::Pid(102)).await.unwrap();
        assert_eq!(report.killed_count, 1);
        assert_eq!(report.killed_pids, vec![102]);
        assert_eq!(probe.signals(), vec![(102, Signal::Term)]);

        let remaining: Vec<u32> = store.load("s1").await.background.keys().copied().collect();
        assert_eq!(remaining, vec![101, 103]);
        let listed = manager.list(Some("s1")).await.unwrap();
        assert!(listed.iter().all(|e| e.running));
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn stubborn_process_gets_sigkill() {
        let (manager, probe, _) = setup(&[("s1", 7, "node server.js")]).await;
        probe.stubborn.lock().unwrap().insert(7);
        let report = manager.kill(KillSelector::Pid(7)).await.unwrap();
        assert_eq!(report.killed_pids, vec![7]);
        assert_eq!(probe.signals(), vec![(7, Signal::Term), (7, Signal::Kill)]);
    }

    #[tokio::test]
    async fn dead_tracked_pid_is_removed_and_counts_zero() {
        let (manager, probe, store) = setup(&[("s1", 55, "sleep 1")]).await;
        probe.exit(55);

        let report = manager.kill(KillSelector::Pid(55)).await.unwrap();
        assert_eq!(report.killed_count, 0);
        assert_eq!(report.already_exited, vec![55]);
        assert!(probe.signals().is_empty());
        assert!(store.load("s1").await.background.is_empty());

        // Now untracked.
        assert!(matches!(
            manager.kill(KillSelector::Pid(55)).await,
            Err(SandboxError::UntrackedProcess(55))
        ));
    }

    #[tokio::test]
    async fn untracked_pid_is_rejected_without_signalling() {
        let (manager, probe, _) = setup(&[("s1", 1, "sleep 5")]).await;
        assert!(manager.kill(KillSelector::Pid(1)).await.is_ok());
        assert!(matches!(
            manager.kill(KillSelector::Pid(4242)).await,
            Err(SandboxError::UntrackedProcess(4242))
        ));
        assert_eq!(probe.signals().len(), 1);
    }

    #[tokio::test]
    async fn session_and_pattern_selectors() {
        let (manager, _, store) = setup(&[
            ("s1", 11, "python3 -m http.server 8000"),
            ("s1", 12, "sleep 100"),
            ("s2", 21, "python3 worker.py"),
            ("s2", 22, "tail -f log"),
        ])
        .await;

        let report = manager.kill(KillSelector::Pattern("python3".into())).await.unwrap();
        let mut killed = report.killed_pids.clone();
        killed.sort_unstable();
        assert_eq!(killed, vec![11, 21]);

        let report = manager.kill(KillSelector::Session("s2".into())).await.unwrap();
        assert_eq!(report.killed_pids, vec![22]);
        assert_eq!(store.load("s1").await.background.len(), 1);
        assert!(store.load("s2").await.background.is_empty());
    }

    #[tokio::test]
    async fn pattern_kill_within_one_session() {
        let (manager, _, store) = setup(&[
            ("s1", 11, "python3 -m http.server 8000"),
            ("s1", 12, "sleep 100"),
            ("s1", 13, "python3 worker.py"),
        ])
        .await;

        let report = manager.kill(KillSelector::Pattern("python3".into())).await.unwrap();
        assert_eq!(report.killed_pids, vec![11, 13]);
        let remaining: Vec<u32> = store.load("s1").await.background.keys().copied().collect();
        assert_eq!(remaining, vec![12]);

        let report = manager.kill(KillSelector::Pattern("node".into())).await.unwrap();
        assert_eq!(report, KillReport::default());
    }

    #[tokio::test]
    async fn empty_pattern_is_rejected() {
        let (manager, probe, store) = setup(&[("s1", 11, "sleep 100")]).await;
        let err = manager.kill(KillSelector::Pattern(String::new())).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
        assert!(probe.signals().is_empty());
        assert_eq!(store.load("s1").await.background.len(), 1);
    }

    #[tokio::test]
    async fn liveness_error_on_one_pid_still_saves_the_others() {
        let (manager, probe, store) = setup(&[("s1", 1, "sleep 10"), ("s1", 2, "sleep 20")]).await;
        probe.alive_errors.lock().unwrap().insert(2);

        let report = manager.kill(KillSelector::Session("s1".into())).await.unwrap();
        assert_eq!(report.killed_pids, vec![1]);
        assert_eq!(report.failed, vec![2]);
        assert_eq!(probe.signals(), vec![(1, Signal::Term)]);

        let remaining: Vec<u32> = store.load("s1").await.background.keys().copied().collect();
        assert_eq!(remaining, vec![2]);
    }

    #[tokio::test]
    async fn list_reports_exited_processes() {
        let (manager, probe, _) = setup(&[("s1", 1, "a"), ("s2", 2, "b")]).await;
        probe.exit(2);
        let listed = manager.list(None).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().find(|e| e.pid == 1).unwrap().running);
        assert!(!listed.iter().find(|e| e.pid == 2).unwrap().running);
        assert_eq!(listed[1].session, "s2");
    }

    #[tokio::test]
    async fn logs_use_recorded_path_and_report_missing_files() {
        let (manager, probe, _) = setup(&[("s1", 9, "npm run dev")]).await;
        probe
            .files
            .lock()
            .unwrap()
            .insert("/tmp/bg_9.out".into(), "ready on http://localhost:3000\n".into());
        assert_eq!(
            manager.logs(9).await.unwrap().as_deref(),
            Some("ready on http://localhost:3000\n")
        );
        assert_eq!(manager.logs(10).await.unwrap(), None);
    }

    #[tokio::test]
    async fn evict_drops_record_without_signal() {
        let (manager, probe, store) = setup(&[("s1", 5, "sleep 9")]).await;
        manager.evict(5).await.unwrap();
        assert!(store.load("s1").await.background.is_empty());
        assert!(probe.signals().is_empty());
        assert_eq!(store.load("s1").await, Session::new("/workspace"));
    }
}
