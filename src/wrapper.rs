//! Stateful execution: turns a bare command into a self-contained script
//! that restores the session, runs the command and reports the new state.
//!
//! Environment tracking is a best-effort mirror of `export`/`unset`
//! statements found in the command text. It is not a shell interpreter:
//! variables set by sourced files or by values that need expansion are not
//! captured.

use crate::backend::{ExecutionBackend, RawOutput, ScriptRequest};
use crate::error::SandboxError;
use crate::state::{unix_now, validate_session_key, BackgroundProcess, Session, SessionLocks, SessionStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Prefix of the line carrying the working directory after execution.
pub const CWD_MARKER: &str = "__SANDBOX_CWD__:";
/// Prefix of the line carrying a freshly spawned background PID.
pub const PID_MARKER: &str = "__SANDBOX_BG_PID__:";

const SHELL_METACHARS: &[char] = &[';', '|', '&', '$', '`', '(', ')', '<', '>', '\n', '\r', '*', '?', '~'];

/// Outcome of one command in one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub session: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_pid: Option<u32>,
}

impl ExecutionResult {
    pub fn failed(session: &str, cwd: &str, reason: impl Into<String>) -> Self {
        Self {
            session: session.to_string(),
            exit_code: -1,
            stdout: String::new(),
            stderr: reason.into(),
            cwd: cwd.to_string(),
            background_pid: None,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Path of the capture file for a background PID.
pub fn capture_path(capture_dir: &str, pid: u32) -> String {
    format!("{}/bg_{}.out", capture_dir.trim_end_matches('/'), pid)
}

/// Strip a trailing `&` (but not `&&`), reporting whether it was present.
pub fn split_background(command: &str) -> (String, bool) {
    let trimmed = command.trim_end();
    if let Some(body) = trimmed.strip_suffix('&') {
        if !body.ends_with('&') && !body.trim().is_empty() {
            return (body.trim_end().to_string(), true);
        }
    }
    (trimmed.to_string(), false)
}

fn is_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// True when the command can be exec'd directly, so that `$!` is the
/// command's own PID rather than an intermediate shell.
fn is_simple_command(command: &str) -> bool {
    if command.contains(SHELL_METACHARS) {
        return false;
    }
    match shell_words::split(command) {
        Ok(tokens) => tokens.first().map(|t| !t.contains('=')).unwrap_or(false),
        Err(_) => false,
    }
}

/// Build the script that restores `session`, runs `command` and prints
/// the resulting state behind markers.
pub fn build_script(session: &Session, command: &str, background: bool, capture_dir: &str) -> String {
    let mut script = String::new();
    script.push_str("__sandbox_finish() {\n");
    script.push_str("    __sandbox_status=$?\n");
    script.push_str(&format!(
        "    printf '\\n%s%s\\n' '{}' \"$(pwd)\"\n",
        CWD_MARKER
    ));
    script.push_str("    exit \"$__sandbox_status\"\n");
    script.push_str("}\n");
    script.push_str("trap __sandbox_finish EXIT\n");
    script.push_str(&format!(
        "cd {} 2>/dev/null || true\n",
        shell_words::quote(&session.cwd)
    ));
    for (name, value) in &session.env {
        if is_env_name(name) {
            script.push_str(&format!("export {}={}\n", name, shell_words::quote(value)));
        }
    }

    if background {
        let launch = if is_simple_command(command) {
            command.to_string()
        } else {
            format!("sh -c {}", shell_words::quote(command))
        };
        let dir = shell_words::quote(capture_dir.trim_end_matches('/')).into_owned();
        script.push_str(&format!("__sandbox_bg_log={}/bg_pending_$$.out\n", dir));
        script.push_str("if command -v setsid >/dev/null 2>&1; then\n");
        script.push_str(&format!(
            "    setsid nohup {} > \"$__sandbox_bg_log\" 2>&1 < /dev/null &\n",
            launch
        ));
        script.push_str("else\n");
        script.push_str(&format!(
            "    nohup {} > \"$__sandbox_bg_log\" 2>&1 < /dev/null &\n",
            launch
        ));
        script.push_str("fi\n");
        script.push_str("__sandbox_bg_pid=$!\n");
        script.push_str(&format!(
            "mv -f \"$__sandbox_bg_log\" {}/\"bg_${{__sandbox_bg_pid}}.out\"\n",
            dir
        ));
        script.push_str(&format!(
            "printf '%s%s\\n' '{}' \"$__sandbox_bg_pid\"\n",
            PID_MARKER
        ));
    } else {
        script.push_str(command);
        script.push('\n');
    }
    script
}

/// Command output with the wrapper's markers removed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedOutput {
    pub stdout: String,
    pub cwd: Option<String>,
    pub pid: Option<u32>,
}

pub fn parse_output(raw: &str) -> ParsedOutput {
    let needle = format!("\n{}", CWD_MARKER);
    let (body, cwd) = match raw.rfind(&needle) {
        Some(idx) => {
            let rest = &raw[idx + needle.len()..];
            let cwd = rest.lines().next().unwrap_or("").trim_end_matches('\r');
            let cwd = (!cwd.is_empty()).then(|| cwd.to_string());
            (&raw[..idx], cwd)
        }
        None => (raw, None),
    };

    let mut pid = None;
    let mut stdout = String::with_capacity(body.len());
    for line in body.split_inclusive('\n') {
        if let Some(value) = line.trim_end().strip_prefix(PID_MARKER) {
            pid = value.trim().parse().ok().or(pid);
            continue;
        }
        stdout.push_str(line);
    }
    ParsedOutput { stdout, cwd, pid }
}

/// Split command text into statements on unquoted `;`, `&`, `|` and newlines.
fn split_statements(command: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let (mut single, mut double, mut escaped) = (false, false, false);
    for c in command.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if !single => {
                escaped = true;
                current.push(c);
            }
            '\'' if !double => {
                single = !single;
                current.push(c);
            }
            '"' if !single => {
                double = !double;
                current.push(c);
            }
            ';' | '&' | '|' | '\n' if !single && !double => {
                if !current.trim().is_empty() {
                    statements.push(std::mem::take(&mut current));
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        statements.push(current);
    }
    statements
}

/// Environment changes implied by the command text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvMutations {
    pub set: Vec<(String, String)>,
    pub unset: Vec<String>,
}

pub fn env_mutations(command: &str) -> EnvMutations {
    let mut mutations = EnvMutations::default();
    for statement in split_statements(command) {
        let Ok(tokens) = shell_words::split(&statement) else {
            continue;
        };
        let Some((head, args)) = tokens.split_first() else {
            continue;
        };
        match head.as_str() {
            "export" => {
                for arg in args.iter().filter(|a| !a.starts_with('-')) {
                    let Some((name, value)) = arg.split_once('=') else {
                        continue;
                    };
                    if !is_env_name(name) {
                        continue;
                    }
                    if value.contains('$') || value.contains('`') {
                        debug!(name, "Skipping export whose value needs shell expansion");
                        continue;
                    }
                    mutations.unset.retain(|n| n != name);
                    mutations.set.retain(|(n, _)| n != name);
                    mutations.set.push((name.to_string(), value.to_string()));
                }
            }
            "unset" => {
                for name in args.iter().filter(|a| !a.starts_with('-') && is_env_name(a)) {
                    mutations.set.retain(|(n, _)| n != name);
                    if !mutations.unset.contains(name) {
                        mutations.unset.push(name.clone());
                    }
                }
            }
            _ => {}
        }
    }
    mutations
}

/// State changes produced by one execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionDelta {
    pub cwd: Option<String>,
    pub env: EnvMutations,
    pub spawned: Option<(u32, BackgroundProcess)>,
}

impl SessionDelta {
    /// Derive the delta from the command text and its parsed output.
    pub fn derive(session_key: &str, command: &str, parsed: &ParsedOutput, capture_dir: &str) -> Self {
        let spawned = parsed.pid.map(|pid| {
            (
                pid,
                BackgroundProcess {
                    command: command.to_string(),
                    log_path: capture_path(capture_dir, pid),
                    session: session_key.to_string(),
                    registered_at: unix_now(),
                },
            )
        });
        Self {
            cwd: parsed.cwd.clone(),
            env: env_mutations(command),
            spawned,
        }
    }

    /// Fold an authoritative post-execution snapshot in. Its cwd and env
    /// win over anything parsed from output.
    pub fn merge_snapshot(&mut self, before: &Session, snapshot: &Session) {
        self.cwd = Some(snapshot.cwd.clone());
        for (name, value) in &snapshot.env {
            if before.env.get(name) != Some(value) {
                self.env.set.retain(|(n, _)| n != name);
                self.env.set.push((name.clone(), value.clone()));
            }
        }
        for name in before.env.keys() {
            if !snapshot.env.contains_key(name) && !self.env.unset.contains(name) {
                self.env.unset.push(name.clone());
            }
        }
    }

    pub fn apply(&self, session: &mut Session) {
        if let Some(cwd) = &self.cwd {
            session.cwd = cwd.clone();
        }
        for name in &self.env.unset {
            session.env.remove(name);
        }
        for (name, value) in &self.env.set {
            session.env.insert(name.clone(), value.clone());
        }
        if let Some((pid, process)) = &self.spawned {
            session.background.insert(*pid, process.clone());
        }
    }
}

/// Runs commands through a backend while carrying session state.
#[derive(Clone)]
pub struct StatefulExecutor {
    backend: Arc<dyn ExecutionBackend>,
    store: Arc<dyn SessionStore>,
    locks: SessionLocks,
    capture_dir: String,
    default_timeout: Duration,
}

impl StatefulExecutor {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        store: Arc<dyn SessionStore>,
        locks: SessionLocks,
        capture_dir: impl Into<String>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            store,
            locks,
            capture_dir: capture_dir.into(),
            default_timeout,
        }
    }

    pub fn capture_dir(&self) -> &str {
        &self.capture_dir
    }

    /// Execute `command` in `session_key`. Never fails: infrastructure
    /// problems come back as exit code -1 with the reason in stderr.
    pub async fn execute(&self, session_key: &str, command: &str, timeout: Option<Duration>) -> ExecutionResult {
        if let Err(e) = validate_session_key(session_key) {
            return ExecutionResult::failed(session_key, "", e.to_string());
        }

        let session = self.store.load(session_key).await;
        let (body, background) = split_background(command);
        let script = build_script(&session, &body, background, &self.capture_dir);
        let timeout = timeout.unwrap_or(self.default_timeout);
        info!(session = %session_key, background, command = %body, "Executing command");

        let request = ScriptRequest {
            session: session_key.to_string(),
            command: Some(body.clone()),
            script,
            timeout,
            snapshot: Some(session.clone()),
        };
        let deadline = timeout + self.backend.timeout_slack();
        let raw: RawOutput = match tokio::time::timeout(deadline, self.backend.run_script(request)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!(session = %session_key, error = %e, "Command execution failed");
                return ExecutionResult::failed(session_key, &session.cwd, format!("Command execution failed: {}", e));
            }
            Err(_) => {
                warn!(session = %session_key, ?timeout, "Command timed out");
                return ExecutionResult::failed(
                    session_key,
                    &session.cwd,
                    SandboxError::Timeout(timeout).to_string(),
                );
            }
        };

        let parsed = parse_output(&raw.stdout);
        let mut delta = SessionDelta::derive(session_key, &body, &parsed, &self.capture_dir);
        if let Some(snapshot) = &raw.snapshot {
            delta.merge_snapshot(&session, snapshot);
        }
        if background && parsed.pid.is_none() {
            warn!(session = %session_key, "Background launch did not report a PID");
        }

        let mut result = ExecutionResult {
            session: session_key.to_string(),
            exit_code: raw.exit_code,
            stdout: parsed.stdout,
            stderr: raw.stderr,
            cwd: delta.cwd.clone().unwrap_or_else(|| session.cwd.clone()),
            background_pid: parsed.pid,
        };

        if let Err(e) = self.commit(session_key, &delta).await {
            error!(session = %session_key, error = %e, "Failed to save session state");
            result.exit_code = -1;
            if !result.stderr.is_empty() && !result.stderr.ends_with('\n') {
                result.stderr.push('\n');
            }
            result.stderr.push_str(&format!("Failed to save session state: {}", e));
        }
        result
    }

    /// Apply `delta` to the latest stored copy of the session, so registry
    /// edits made while the command ran are not overwritten.
    async fn commit(&self, session_key: &str, delta: &SessionDelta) -> crate::error::Result<()> {
        let _guard = self.locks.lock(session_key).await;
        let mut session = self.store.load(session_key).await;
        delta.apply(&mut session);
        self.store.save(session_key, &session).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::ScriptedBackend;
    use crate::state::MemoryStore;

    fn executor(backend: ScriptedBackend, store: Arc<MemoryStore>) -> StatefulExecutor {
        StatefulExecutor::new(
            Arc::new(backend),
            store,
            SessionLocks::default(),
            "/tmp",
            Duration::from_secs(5),
        )
    }

    #[test]
    fn trailing_ampersand_marks_background() {
        assert_eq!(split_background("sleep 5 &"), ("sleep 5".to_string(), true));
        assert_eq!(split_background("sleep 5&  "), ("sleep 5".to_string(), true));
        assert_eq!(split_background("make && make test"), ("make && make test".to_string(), false));
        assert_eq!(split_background("true &&"), ("true &&".to_string(), false));
        assert_eq!(split_background("&"), ("&".to_string(), false));
    }

    #[test]
    fn script_restores_state_with_quoting() {
        let mut session = Session::new("/srv/my app");
        session.env.insert("GREETING".into(), "hello world".into());
        session.env.insert("bad name".into(), "x".into());
        let script = build_script(&session, "echo $GREETING", false, "/tmp");

        assert!(script.contains("cd '/srv/my app' 2>/dev/null || true\n"));
        assert!(script.contains("export GREETING='hello world'\n"));
        assert!(!script.contains("bad name"));
        assert!(script.contains("trap __sandbox_finish EXIT"));
        assert!(script.ends_with("echo $GREETING\n"));
    }

    #[test]
    fn background_script_names_capture_file_from_pid() {
        let script = build_script(&Session::new("/workspace"), "python3 -m http.server 8000", true, "/tmp/");
        assert!(script.contains("setsid nohup python3 -m http.server 8000 > \"$__sandbox_bg_log\" 2>&1 < /dev/null &"));
        assert!(script.contains("mv -f \"$__sandbox_bg_log\" /tmp/\"bg_${__sandbox_bg_pid}.out\""));
        assert!(script.contains(PID_MARKER));

        let compound = build_script(&Session::new("/workspace"), "cd app && npm start", true, "/tmp");
        assert!(compound.contains("nohup sh -c 'cd app && npm start' >"));
    }

    #[test]
    fn parse_strips_markers_and_injected_newline() {
        let raw = format!("hello\n\n{}/tmp\n", CWD_MARKER);
        let parsed = parse_output(&raw);
        assert_eq!(parsed.stdout, "hello\n");
        assert_eq!(parsed.cwd.as_deref(), Some("/tmp"));
        assert_eq!(parsed.pid, None);

        // Output without a trailing newline is returned untouched.
        let parsed = parse_output(&format!("no-newline\n{}/srv\n", CWD_MARKER));
        assert_eq!(parsed.stdout, "no-newline");
        assert_eq!(parsed.cwd.as_deref(), Some("/srv"));

        let parsed = parse_output(&format!("{}4242\n\n{}/workspace\n", PID_MARKER, CWD_MARKER));
        assert_eq!(parsed.stdout, "");
        assert_eq!(parsed.pid, Some(4242));
    }

    #[test]
    fn parse_without_marker_keeps_everything() {
        let parsed = parse_output("partial output");
        assert_eq!(parsed.stdout, "partial output");
        assert_eq!(parsed.cwd, None);
    }

    #[test]
    fn env_mutations_capture_multiple_statements() {
        let m = env_mutations("export A=1; export B='two words' && export C=\"3\"");
        assert_eq!(
            m.set,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "two words".to_string()),
                ("C".to_string(), "3".to_string()),
            ]
        );

        let m = env_mutations("export X=1 Y=2\nunset X");
        assert_eq!(m.set, vec![("Y".to_string(), "2".to_string())]);
        assert_eq!(m.unset, vec!["X".to_string()]);
    }

    #[test]
    fn env_mutations_skip_expansions_and_quoted_separators() {
        let m = env_mutations("export PATH=$PATH:/opt/bin; export MSG='a;b'");
        assert_eq!(m.set, vec![("MSG".to_string(), "a;b".to_string())]);
        assert!(env_mutations("echo export A=1").set.is_empty());
        assert!(env_mutations("export 1BAD=x").set.is_empty());
    }

    #[tokio::test]
    async fn execute_updates_cwd_env_and_registry() {
        let store = Arc::new(MemoryStore::new("/workspace"));
        let backend = ScriptedBackend::new(|req| {
            let cwd = req.snapshot.as_ref().map(|s| s.cwd.clone()).unwrap_or_default();
            if req.script.contains("nohup") {
                RawOutput::ok(format!("{}777\n\n{}{}\n", PID_MARKER, CWD_MARKER, cwd))
            } else if req.script.ends_with("cd /tmp\n") {
                RawOutput::ok(format!("\n{}/tmp\n", CWD_MARKER))
            } else {
                RawOutput::ok(format!("\n{}{}\n", CWD_MARKER, cwd))
            }
        });
        let exec = executor(backend.clone(), store.clone());

        let result = exec.execute("s1", "cd /tmp", None).await;
        assert_eq!(result.cwd, "/tmp");
        assert!(result.success());

        exec.execute("s1", "export A=1", None).await;
        let session = store.load("s1").await;
        assert_eq!(session.cwd, "/tmp");
        assert_eq!(session.env.get("A").map(String::as_str), Some("1"));

        let result = exec.execute("s1", "sleep 5 &", None).await;
        assert_eq!(result.background_pid, Some(777));
        let session = store.load("s1").await;
        let record = session.background.get(&777).unwrap();
        assert_eq!(record.command, "sleep 5");
        assert_eq!(record.log_path, "/tmp/bg_777.out");

        // The next script restores what the previous ones left behind.
        exec.execute("s1", "echo $A", None).await;
        let last = backend.last_script().unwrap();
        assert!(last.contains("export A=1\n"));

        // Another session is untouched.
        assert_eq!(store.load("s2").await.cwd, "/workspace");
    }

    #[tokio::test]
    async fn backend_failure_becomes_minus_one() {
        let store = Arc::new(MemoryStore::new("/workspace"));
        let backend = ScriptedBackend::failing("connection refused");
        let result = executor(backend, store).execute("s1", "ls", None).await;
        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("connection refused"));
        assert_eq!(result.cwd, "/workspace");
    }

    #[tokio::test]
    async fn timeout_becomes_minus_one() {
        let store = Arc::new(MemoryStore::new("/workspace"));
        let backend = ScriptedBackend::new(|_| RawOutput::ok(String::new())).with_delay(Duration::from_secs(30));
        let result = executor(backend, store)
            .execute("s1", "sleep 100", Some(Duration::from_millis(10)))
            .await;
        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn invalid_session_key_is_reported_not_raised() {
        let store = Arc::new(MemoryStore::new("/workspace"));
        let backend = ScriptedBackend::new(|_| RawOutput::ok(String::new()));
        let result = executor(backend, store).execute("../etc", "ls", None).await;
        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("invalid session key"));
    }

    #[tokio::test]
    async fn snapshot_overrides_parsed_state() {
        let store = Arc::new(MemoryStore::new("/workspace"));
        let backend = ScriptedBackend::new(|req| {
            let mut snapshot = req.snapshot.clone().unwrap();
            snapshot.cwd = "/data".into();
            snapshot.env.insert("FROM_JOB".into(), "yes".into());
            RawOutput {
                exit_code: 0,
                stdout: format!("\n{}/ignored\n", CWD_MARKER),
                stderr: String::new(),
                snapshot: Some(snapshot),
            }
        });
        let result = executor(backend, store.clone()).execute("s1", "true", None).await;
        assert_eq!(result.cwd, "/data");
        let session = store.load("s1").await;
        assert_eq!(session.cwd, "/data");
        assert_eq!(session.env.get("FROM_JOB").map(String::as_str), Some("yes"));
    }
}
