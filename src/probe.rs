//! Process inspection inside the sandbox.
//!
//! Everything here runs as small shell snippets through the backend, so the
//! same code works against a long-lived container and a local agent. Each
//! probe prefers `/proc` and falls back to portable tools.

use crate::backend::{ExecutionBackend, ScriptRequest};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    fn name(self) -> &'static str {
        match self {
            Signal::Term => "TERM",
            Signal::Kill => "KILL",
        }
    }
}

#[async_trait]
pub trait ProcessProbe: Send + Sync {
    /// True for a running process; zombies count as dead.
    async fn is_alive(&self, pid: u32) -> Result<bool>;

    /// Seconds since the process started, `None` if it is gone.
    async fn elapsed_secs(&self, pid: u32) -> Result<Option<u64>>;

    async fn process_group(&self, pid: u32) -> Result<Option<u32>>;

    /// Signal the process group led by `pid`, falling back to the pid itself.
    async fn signal(&self, pid: u32, signal: Signal) -> Result<()>;

    async fn is_listening(&self, port: u16) -> Result<bool>;

    /// PIDs holding a listening socket on `port`. `None` when no ownership
    /// tool is available.
    async fn socket_owners(&self, port: u16) -> Result<Option<Vec<u32>>>;

    /// HTTP status of `url`; `Some(0)` on connection failure, `None` when
    /// there is no client to ask with.
    async fn http_status(&self, url: &str, timeout: Duration) -> Result<Option<u16>>;

    /// Last `max_bytes` of a file, `None` if it does not exist.
    async fn read_tail(&self, path: &str, max_bytes: u64) -> Result<Option<String>>;
}

const UNAVAILABLE: &str = "unavailable";

/// Probe that runs inspection scripts through an execution backend.
pub struct ShellProbe {
    backend: Arc<dyn ExecutionBackend>,
    timeout: Duration,
}

impl ShellProbe {
    pub fn new(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            backend,
            timeout: Duration::from_secs(30),
        }
    }

    async fn run(&self, script: String) -> Result<(i32, String)> {
        let out = self
            .backend
            .run_script(ScriptRequest::raw(script, self.timeout))
            .await?;
        Ok((out.exit_code, out.stdout))
    }
}

pub(crate) fn alive_script(pid: u32) -> String {
    format!(
        "if [ -r /proc/{pid}/stat ]; then\n\
         \x20   state=$(sed 's/.*) //' /proc/{pid}/stat | cut -d' ' -f1)\n\
         \x20   [ \"$state\" != Z ] && [ \"$state\" != X ] && echo alive || echo dead\n\
         elif kill -0 {pid} 2>/dev/null; then echo alive\n\
         else echo dead; fi",
        pid = pid
    )
}

pub(crate) fn elapsed_script(pid: u32) -> String {
    format!(
        "if [ -r /proc/{pid}/stat ]; then\n\
         \x20   start=$(sed 's/.*) //' /proc/{pid}/stat | cut -d' ' -f20)\n\
         \x20   hz=$(getconf CLK_TCK 2>/dev/null || echo 100)\n\
         \x20   up=$(cut -d' ' -f1 /proc/uptime | cut -d. -f1)\n\
         \x20   echo $((up - start / hz))\n\
         else ps -o etimes= -p {pid} 2>/dev/null | tr -d ' '; fi",
        pid = pid
    )
}

pub(crate) fn group_script(pid: u32) -> String {
    format!(
        "if [ -r /proc/{pid}/stat ]; then sed 's/.*) //' /proc/{pid}/stat | cut -d' ' -f3\n\
         else ps -o pgid= -p {pid} 2>/dev/null | tr -d ' '; fi",
        pid = pid
    )
}

pub(crate) fn signal_script(pid: u32, signal: Signal) -> String {
    format!(
        "kill -s {sig} -- -{pid} 2>/dev/null || kill -s {sig} -{pid} 2>/dev/null || kill -s {sig} {pid} 2>/dev/null || true",
        sig = signal.name(),
        pid = pid
    )
}

pub(crate) fn listening_script(port: u16) -> String {
    format!(
        "if command -v ss >/dev/null 2>&1; then ss -ltn 2>/dev/null | awk '{{print $4}}'\n\
         elif command -v netstat >/dev/null 2>&1; then netstat -ltn 2>/dev/null | awk '{{print $4}}'\n\
         else cat /proc/net/tcp /proc/net/tcp6 2>/dev/null | awk '$4 == \"0A\" {{print $2}}' | grep -i ':{hex}$'; fi",
        hex = format!("{:04X}", port)
    )
}

fn listening_in(listing: &str, port: u16) -> bool {
    let decimal = format!(":{}", port);
    let dotted = format!(".{}", port);
    let hex = format!(":{:04X}", port);
    listing.lines().map(str::trim).any(|addr| {
        addr.ends_with(&decimal) || addr.ends_with(&dotted) || addr.to_ascii_uppercase().ends_with(&hex)
    })
}

pub(crate) fn owners_script(port: u16) -> String {
    format!(
        "command -v lsof >/dev/null 2>&1 || {{ echo {}; exit 0; }}\n\
         lsof -nP -t -iTCP:{} -sTCP:LISTEN 2>/dev/null || true",
        UNAVAILABLE, port
    )
}

#[async_trait]
impl ProcessProbe for ShellProbe {
    async fn is_alive(&self, pid: u32) -> Result<bool> {
        let (_, out) = self.run(alive_script(pid)).await?;
        Ok(out.trim() == "alive")
    }

    async fn elapsed_secs(&self, pid: u32) -> Result<Option<u64>> {
        let (_, out) = self.run(elapsed_script(pid)).await?;
        Ok(out.trim().parse().ok())
    }

    async fn process_group(&self, pid: u32) -> Result<Option<u32>> {
        let (_, out) = self.run(group_script(pid)).await?;
        Ok(out.trim().parse().ok())
    }

    async fn signal(&self, pid: u32, signal: Signal) -> Result<()> {
        debug!(pid, signal = signal.name(), "Sending signal");
        self.run(signal_script(pid, signal)).await?;
        Ok(())
    }

    async fn is_listening(&self, port: u16) -> Result<bool> {
        let (_, out) = self.run(listening_script(port)).await?;
        Ok(listening_in(&out, port))
    }

    async fn socket_owners(&self, port: u16) -> Result<Option<Vec<u32>>> {
        let (_, out) = self.run(owners_script(port)).await?;
        if out.trim() == UNAVAILABLE {
            return Ok(None);
        }
        let mut owners: Vec<u32> = out.lines().filter_map(|l| l.trim().parse().ok()).collect();
        owners.sort_unstable();
        owners.dedup();
        Ok(Some(owners))
    }

    async fn http_status(&self, url: &str, timeout: Duration) -> Result<Option<u16>> {
        let script = format!(
            "command -v curl >/dev/null 2>&1 || {{ echo {}; exit 0; }}\n\
             curl -s -o /dev/null -w '%{{http_code}}' --max-time {} {}",
            UNAVAILABLE,
            timeout.as_secs().max(1),
            shell_words::quote(url)
        );
        let (_, out) = self.run(script).await?;
        let out = out.trim();
        if out == UNAVAILABLE {
            return Ok(None);
        }
        Ok(Some(out.parse().unwrap_or(0)))
    }

    async fn read_tail(&self, path: &str, max_bytes: u64) -> Result<Option<String>> {
        let quoted = shell_words::quote(path);
        let script = format!("[ -f {p} ] || exit 3\ntail -c {n} {p}", p = quoted, n = max_bytes);
        let (code, out) = self.run(script).await?;
        Ok((code == 0).then_some(out))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::SandboxError;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// In-memory process table.
    #[derive(Default)]
    pub struct FakeProbe {
        pub alive: Mutex<HashSet<u32>>,
        /// PIDs that ignore SIGTERM.
        pub stubborn: Mutex<HashSet<u32>>,
        /// PIDs that ignore every signal.
        pub unkillable: Mutex<HashSet<u32>>,
        /// PIDs whose liveness check errors.
        pub alive_errors: Mutex<HashSet<u32>>,
        /// PIDs whose start time lookup errors.
        pub elapsed_errors: Mutex<HashSet<u32>>,
        pub elapsed: Mutex<HashMap<u32, u64>>,
        pub groups: Mutex<HashMap<u32, u32>>,
        pub listening: Mutex<HashSet<u16>>,
        pub owners: Mutex<Option<HashMap<u16, Vec<u32>>>>,
        pub http: Mutex<Option<u16>>,
        pub files: Mutex<HashMap<String, String>>,
        pub signals: Mutex<Vec<(u32, Signal)>>,
    }

    impl FakeProbe {
        pub fn spawn(&self, pid: u32, elapsed: u64) {
            self.alive.lock().unwrap().insert(pid);
            self.elapsed.lock().unwrap().insert(pid, elapsed);
            self.groups.lock().unwrap().insert(pid, pid);
        }

        pub fn exit(&self, pid: u32) {
            self.alive.lock().unwrap().remove(&pid);
            self.elapsed.lock().unwrap().remove(&pid);
        }

        pub fn signals(&self) -> Vec<(u32, Signal)> {
            self.signals.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProcessProbe for FakeProbe {
        async fn is_alive(&self, pid: u32) -> Result<bool> {
            if self.alive_errors.lock().unwrap().contains(&pid) {
                return Err(SandboxError::Transport("ps unavailable".into()));
            }
            Ok(self.alive.lock().unwrap().contains(&pid))
        }

        async fn elapsed_secs(&self, pid: u32) -> Result<Option<u64>> {
            if self.elapsed_errors.lock().unwrap().contains(&pid) {
                return Err(SandboxError::Transport("ps unavailable".into()));
            }
            Ok(self.elapsed.lock().unwrap().get(&pid).copied())
        }

        async fn process_group(&self, pid: u32) -> Result<Option<u32>> {
            Ok(self.groups.lock().unwrap().get(&pid).copied())
        }

        async fn signal(&self, pid: u32, signal: Signal) -> Result<()> {
            self.signals.lock().unwrap().push((pid, signal));
            let ignores = self.unkillable.lock().unwrap().contains(&pid)
                || (signal == Signal::Term && self.stubborn.lock().unwrap().contains(&pid));
            if !ignores {
                self.exit(pid);
            }
            Ok(())
        }

        async fn is_listening(&self, port: u16) -> Result<bool> {
            Ok(self.listening.lock().unwrap().contains(&port))
        }

        async fn socket_owners(&self, port: u16) -> Result<Option<Vec<u32>>> {
            Ok(self
                .owners
                .lock()
                .unwrap()
                .as_ref()
                .map(|owners| owners.get(&port).cloned().unwrap_or_default()))
        }

        async fn http_status(&self, _url: &str, _timeout: Duration) -> Result<Option<u16>> {
            Ok(*self.http.lock().unwrap())
        }

        async fn read_tail(&self, path: &str, _max_bytes: u64) -> Result<Option<String>> {
            Ok(self.files.lock().unwrap().get(path).cloned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::ScriptedBackend;
    use crate::backend::RawOutput;

    #[test]
    fn listening_matches_common_formats() {
        assert!(listening_in("0.0.0.0:8080\n[::]:22\n", 8080));
        assert!(listening_in("*.3000\n", 3000));
        assert!(listening_in("0100007F:1F90\n", 8080));
        assert!(!listening_in("0.0.0.0:18080\n", 8080));
        assert!(!listening_in("127.0.0.1:80801\n", 8080));
    }

    #[test]
    fn signal_script_targets_group_first() {
        let script = signal_script(42, Signal::Term);
        assert!(script.starts_with("kill -s TERM -- -42"));
        assert!(script.contains("kill -s TERM 42"));
    }

    #[tokio::test]
    async fn owners_report_missing_lsof() {
        let probe = ShellProbe::new(Arc::new(ScriptedBackend::new(|_| RawOutput::ok("unavailable\n"))));
        assert_eq!(probe.socket_owners(3000).await.unwrap(), None);

        let probe = ShellProbe::new(Arc::new(ScriptedBackend::new(|_| RawOutput::ok("12\n34\n12\n"))));
        assert_eq!(probe.socket_owners(3000).await.unwrap(), Some(vec![12, 34]));
    }

    #[tokio::test]
    async fn http_status_distinguishes_no_curl_from_no_connection() {
        let probe = ShellProbe::new(Arc::new(ScriptedBackend::new(|_| RawOutput::ok("000"))));
        assert_eq!(probe.http_status("http://localhost:1", Duration::from_secs(1)).await.unwrap(), Some(0));

        let probe = ShellProbe::new(Arc::new(ScriptedBackend::new(|_| RawOutput::ok("204"))));
        assert_eq!(probe.http_status("http://localhost:1", Duration::from_secs(1)).await.unwrap(), Some(204));

        let probe = ShellProbe::new(Arc::new(ScriptedBackend::new(|_| RawOutput::ok("unavailable"))));
        assert_eq!(probe.http_status("http://localhost:1", Duration::from_secs(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_tail_is_none_for_missing_file() {
        let probe = ShellProbe::new(Arc::new(ScriptedBackend::new(|_| RawOutput {
            exit_code: 3,
            stdout: String::new(),
            stderr: String::new(),
            snapshot: None,
        })));
        assert_eq!(probe.read_tail("/tmp/bg_1.out", 10).await.unwrap(), None);
    }
}
