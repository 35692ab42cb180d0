//! The sandbox facade: one backend, its session store and the managers
//! built on top of them, exposed as tool-style operations.

use crate::background::{BackgroundManager, KillSelector};
use crate::backend::ExecutionBackend;
use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::probe::{ProcessProbe, ShellProbe};
use crate::selector::Selection;
use crate::servers::ServerSupervisor;
use crate::state::{validate_session_key, SessionLocks, SessionStore};
use crate::wrapper::{ExecutionResult, StatefulExecutor};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Uniform result shape for every facade operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolResult {
    pub success: bool,
    pub message: String,
    pub data: Value,
}

impl ToolResult {
    pub fn ok(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
        }
    }

    pub fn fail(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: false,
            message: message.into(),
            data,
        }
    }

    pub fn from_error(error: &SandboxError) -> Self {
        let mut data = json!({ "error_kind": error.kind() });
        match error {
            SandboxError::SecurityAlert { pid, .. } => {
                data["security_alert"] = json!(true);
                data["pid"] = json!(pid);
            }
            SandboxError::UntrackedProcess(pid) => {
                data["tracked"] = json!(false);
                data["pid"] = json!(pid);
            }
            _ => {}
        }
        Self::fail(error.to_string(), data)
    }
}

/// Lexically resolve `path` against `cwd`.
pub fn resolve_path(cwd: &str, path: &str) -> String {
    let joined = if Path::new(path).is_absolute() {
        PathBuf::from(path)
    } else {
        Path::new(cwd).join(path)
    };
    let mut parts: Vec<Component> = Vec::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(parts.last(), Some(Component::Normal(_))) {
                    parts.pop();
                }
            }
            other => parts.push(other),
        }
    }
    let normalized: PathBuf = parts.iter().collect();
    if normalized.as_os_str().is_empty() {
        "/".to_string()
    } else {
        normalized.display().to_string()
    }
}

/// Keep lines `start..=end` (1-based) of `content`.
fn slice_lines(content: &str, start: Option<usize>, end: Option<usize>) -> String {
    if start.is_none() && end.is_none() {
        return content.to_string();
    }
    let start = start.unwrap_or(1).max(1);
    let end = end.unwrap_or(usize::MAX);
    content
        .split_inclusive('\n')
        .enumerate()
        .filter(|(idx, _)| (start..=end).contains(&(idx + 1)))
        .map(|(_, line)| line)
        .collect()
}

pub struct Sandbox {
    config: SandboxConfig,
    selection: Selection,
    backend: Arc<dyn ExecutionBackend>,
    store: Arc<dyn SessionStore>,
    locks: SessionLocks,
    executor: StatefulExecutor,
    background: BackgroundManager,
    servers: ServerSupervisor,
}

impl Sandbox {
    pub fn new(
        config: SandboxConfig,
        selection: Selection,
        backend: Arc<dyn ExecutionBackend>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let probe: Arc<dyn ProcessProbe> = Arc::new(ShellProbe::new(backend.clone()));
        Self::with_probe(config, selection, backend, store, probe)
    }

    pub fn with_probe(
        config: SandboxConfig,
        selection: Selection,
        backend: Arc<dyn ExecutionBackend>,
        store: Arc<dyn SessionStore>,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        let locks = SessionLocks::default();
        let executor = StatefulExecutor::new(
            backend.clone(),
            store.clone(),
            locks.clone(),
            config.capture_dir.clone(),
            config.default_timeout(),
        );
        let background = BackgroundManager::new(
            store.clone(),
            locks.clone(),
            probe,
            Duration::from_millis(config.background.kill_grace_ms),
            config.background.max_log_read_bytes,
            config.capture_dir.clone(),
        );
        let servers = ServerSupervisor::new(executor.clone(), background.clone(), &config.launch);
        Self {
            config,
            selection,
            backend,
            store,
            locks,
            executor,
            background,
            servers,
        }
    }

    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        &self.backend
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    async fn resolve(&self, session: &str, path: &str) -> Result<String> {
        validate_session_key(session)?;
        if Path::new(path).is_absolute() {
            return Ok(resolve_path("/", path));
        }
        let cwd = self.store.load(session).await.cwd;
        Ok(resolve_path(&cwd, path))
    }

    /// Run a command and return the raw execution result.
    pub async fn execute(&self, session: &str, command: &str, timeout: Option<Duration>) -> ExecutionResult {
        self.executor.execute(session, command, timeout).await
    }

    pub async fn exec_command(&self, session: &str, command: &str, timeout_secs: Option<u64>) -> ToolResult {
        let result = self.execute(session, command, timeout_secs.map(Duration::from_secs)).await;
        let message = match (result.background_pid, result.exit_code) {
            (Some(pid), _) => format!("Started background process {}", pid),
            (None, 0) => "Command completed".to_string(),
            (None, code) => format!("Command failed with exit code {}", code),
        };
        let success = result.success();
        let data = serde_json::to_value(&result).unwrap_or(Value::Null);
        if success {
            ToolResult::ok(message, data)
        } else {
            ToolResult::fail(message, data)
        }
    }

    pub async fn file_read(
        &self,
        session: &str,
        path: &str,
        start_line: Option<usize>,
        end_line: Option<usize>,
    ) -> ToolResult {
        let outcome = async {
            let path = self.resolve(session, path).await?;
            let content = self.backend.read_file(&path).await?;
            Ok::<_, SandboxError>((path, slice_lines(&content, start_line, end_line)))
        };
        match outcome.await {
            Ok((path, content)) => ToolResult::ok(format!("Read {}", path), json!({ "path": path, "content": content })),
            Err(e) => ToolResult::from_error(&e),
        }
    }

    pub async fn file_write(&self, session: &str, path: &str, content: &str, append: bool) -> ToolResult {
        let outcome = async {
            let path = self.resolve(session, path).await?;
            let bytes = self.backend.write_file(&path, content, append).await?;
            Ok::<_, SandboxError>((path, bytes))
        };
        match outcome.await {
            Ok((path, bytes)) => ToolResult::ok(
                format!("Wrote {} bytes to {}", bytes, path),
                json!({ "path": path, "bytes": bytes, "append": append }),
            ),
            Err(e) => ToolResult::from_error(&e),
        }
    }

    pub async fn file_replace(&self, session: &str, path: &str, old: &str, new: &str) -> ToolResult {
        let outcome = async {
            let path = self.resolve(session, path).await?;
            let count = self.backend.replace_in_file(&path, old, new).await?;
            Ok::<_, SandboxError>((path, count))
        };
        match outcome.await {
            Ok((path, 0)) => ToolResult::fail(
                format!("No occurrences found in {}", path),
                json!({ "path": path, "replacements": 0 }),
            ),
            Ok((path, count)) => ToolResult::ok(
                format!("Replaced {} occurrence(s) in {}", count, path),
                json!({ "path": path, "replacements": count }),
            ),
            Err(e) => ToolResult::from_error(&e),
        }
    }

    pub async fn file_search(&self, session: &str, path: &str, pattern: &str) -> ToolResult {
        let outcome = async {
            let path = self.resolve(session, path).await?;
            let matches = self.backend.search_file(&path, pattern).await?;
            Ok::<_, SandboxError>((path, matches))
        };
        match outcome.await {
            Ok((path, matches)) => ToolResult::ok(
                format!("{} matching line(s)", matches.len()),
                json!({ "path": path, "matches": matches }),
            ),
            Err(e) => ToolResult::from_error(&e),
        }
    }

    pub async fn file_find(&self, session: &str, dir: &str, glob: &str) -> ToolResult {
        let outcome = async {
            let dir = self.resolve(session, dir).await?;
            let files = self.backend.find_files(&dir, glob).await?;
            Ok::<_, SandboxError>((dir, files))
        };
        match outcome.await {
            Ok((dir, files)) => ToolResult::ok(
                format!("Found {} file(s)", files.len()),
                json!({ "path": dir, "files": files }),
            ),
            Err(e) => ToolResult::from_error(&e),
        }
    }

    pub async fn file_list(&self, session: &str, path: &str) -> ToolResult {
        let outcome = async {
            let path = self.resolve(session, path).await?;
            let entries = self.backend.list_dir(&path).await?;
            Ok::<_, SandboxError>((path, entries))
        };
        match outcome.await {
            Ok((path, entries)) => ToolResult::ok(
                format!("{} entries", entries.len()),
                json!({ "path": path, "entries": entries }),
            ),
            Err(e) => ToolResult::from_error(&e),
        }
    }

    pub async fn file_delete(&self, session: &str, path: &str) -> ToolResult {
        let outcome = async {
            let path = self.resolve(session, path).await?;
            self.backend.delete_path(&path).await?;
            Ok::<_, SandboxError>(path)
        };
        match outcome.await {
            Ok(path) => ToolResult::ok(format!("Deleted {}", path), json!({ "path": path })),
            Err(e) => ToolResult::from_error(&e),
        }
    }

    pub async fn file_upload(&self, session: &str, path: &str, data: &[u8]) -> ToolResult {
        let outcome = async {
            let path = self.resolve(session, path).await?;
            let bytes = self.backend.upload(&path, data).await?;
            Ok::<_, SandboxError>((path, bytes))
        };
        match outcome.await {
            Ok((path, bytes)) => ToolResult::ok(
                format!("Uploaded {} bytes to {}", bytes, path),
                json!({ "path": path, "bytes": bytes }),
            ),
            Err(e) => ToolResult::from_error(&e),
        }
    }

    pub async fn file_download(&self, session: &str, path: &str) -> ToolResult {
        let outcome = async {
            let path = self.resolve(session, path).await?;
            let data = self.backend.download(&path).await?;
            Ok::<_, SandboxError>((path, data))
        };
        match outcome.await {
            Ok((path, data)) => ToolResult::ok(
                format!("Downloaded {} bytes from {}", data.len(), path),
                json!({ "path": path, "size": data.len(), "data": STANDARD.encode(&data) }),
            ),
            Err(e) => ToolResult::from_error(&e),
        }
    }

    pub async fn list_background_processes(&self, session: Option<&str>) -> ToolResult {
        match self.background.list(session).await {
            Ok(processes) => {
                let running = processes.iter().filter(|p| p.running).count();
                ToolResult::ok(
                    format!("{} tracked, {} running", processes.len(), running),
                    json!({ "processes": processes }),
                )
            }
            Err(e) => ToolResult::from_error(&e),
        }
    }

    /// Kill tracked processes. Tracked servers among the targets go through
    /// the start-time check before any signal.
    pub async fn kill_background_process(&self, selector: KillSelector) -> ToolResult {
        match self.servers.kill(selector).await {
            Ok(report) => ToolResult::ok(
                format!("Killed {} process(es)", report.killed_count),
                serde_json::to_value(&report).unwrap_or(Value::Null),
            ),
            Err(e) => ToolResult::from_error(&e),
        }
    }

    pub async fn get_background_logs(&self, pid: u32) -> ToolResult {
        match self.background.logs(pid).await {
            Ok(Some(logs)) => ToolResult::ok(format!("Logs for {}", pid), json!({ "pid": pid, "logs": logs })),
            Ok(None) => ToolResult::fail(
                format!("No log file for process {}", pid),
                json!({ "pid": pid, "error_kind": "not_found" }),
            ),
            Err(e) => ToolResult::from_error(&e),
        }
    }

    pub async fn ensure_ready(&self) -> ToolResult {
        match self.backend.ensure_ready().await {
            Ok(()) => ToolResult::ok("Sandbox ready", json!({ "id": self.backend.id() })),
            Err(e) => ToolResult::from_error(&e),
        }
    }

    pub async fn destroy(&self) -> ToolResult {
        match self.backend.destroy().await {
            Ok(()) => ToolResult::ok("Sandbox destroyed", json!({ "id": self.backend.id() })),
            Err(e) => ToolResult::from_error(&e),
        }
    }

    /// Kill a session's background processes and forget its state.
    pub async fn close_session(&self, session: &str) -> ToolResult {
        let outcome = async {
            validate_session_key(session)?;
            let report = self.servers.kill(KillSelector::Session(session.to_string())).await?;
            if !report.survivors.is_empty() {
                warn!(session, survivors = ?report.survivors, "Processes survived session close");
            }
            self.store.delete(session).await?;
            self.locks.forget(session).await;
            info!(session, killed = report.killed_count, "Closed session");
            Ok::<_, SandboxError>(report)
        };
        match outcome.await {
            Ok(report) => ToolResult::ok(
                format!("Closed session {}", session),
                json!({ "session": session, "killed_pids": report.killed_pids }),
            ),
            Err(e) => ToolResult::from_error(&e),
        }
    }

    /// Close every session not named in `exclude`.
    pub async fn cleanup_sessions(&self, exclude: &[String]) -> ToolResult {
        let keys = match self.store.keys().await {
            Ok(keys) => keys,
            Err(e) => return ToolResult::from_error(&e),
        };
        let mut closed = Vec::new();
        let mut failed = Vec::new();
        for key in keys.into_iter().filter(|k| !exclude.contains(k)) {
            let result = self.close_session(&key).await;
            if result.success {
                closed.push(key);
            } else {
                warn!(session = %key, error = %result.message, "Failed to close session");
                failed.push(key);
            }
        }
        let data = json!({ "closed": closed, "failed": failed });
        if failed.is_empty() {
            ToolResult::ok(format!("Closed {} session(s)", closed.len()), data)
        } else {
            ToolResult::fail(format!("{} session(s) could not be closed", failed.len()), data)
        }
    }

    pub async fn session_info(&self, session: &str) -> ToolResult {
        if let Err(e) = validate_session_key(session) {
            return ToolResult::from_error(&e);
        }
        let state = self.store.load(session).await;
        ToolResult::ok(
            format!("Session {}", session),
            json!({
                "session": session,
                "cwd": state.cwd,
                "env": state.env,
                "background_pids": state.background.keys().collect::<Vec<_>>(),
            }),
        )
    }

    pub fn remote_control(&self) -> ToolResult {
        match self.backend.remote_control() {
            Some(remote) => ToolResult::ok(
                "Remote control available",
                serde_json::to_value(&remote).unwrap_or(Value::Null),
            ),
            None => ToolResult::from_error(&SandboxError::Unsupported("remote control")),
        }
    }

    pub fn info(&self) -> ToolResult {
        ToolResult::ok(
            format!("{} backend", self.backend.kind()),
            json!({
                "id": self.backend.id(),
                "backend": self.backend.kind().to_string(),
                "requested": self.selection.requested.to_string(),
                "reason": self.selection.reason,
                "workspace_root": self.config.workspace_root,
                "capture_dir": self.config.capture_dir,
                "remote_control": self.backend.remote_control().is_some(),
            }),
        )
    }

    pub async fn start_server(&self, session: &str, command: &str) -> ToolResult {
        match self.servers.start(session, command).await {
            Ok(started) => {
                let message = match (&started.server.url, started.server.verified) {
                    (Some(url), true) => format!("Server started and verified at {}", url),
                    (Some(url), false) => format!("Server started at {} (unverified)", url),
                    (None, _) => format!("Server started with pid {} (no port detected)", started.server.pid),
                };
                ToolResult::ok(message, serde_json::to_value(&started).unwrap_or(Value::Null))
            }
            Err(e) => ToolResult::from_error(&e),
        }
    }

    pub async fn stop_server(&self, pid: u32) -> ToolResult {
        match self.servers.stop(pid).await {
            Ok(report) if report.already_stopped => ToolResult::ok(
                format!("Server {} had already stopped", pid),
                serde_json::to_value(&report).unwrap_or(Value::Null),
            ),
            Ok(report) => ToolResult::ok(
                format!("Server {} stopped", pid),
                serde_json::to_value(&report).unwrap_or(Value::Null),
            ),
            Err(e) => ToolResult::from_error(&e),
        }
    }

    pub async fn list_servers(&self, session: Option<&str>) -> ToolResult {
        let servers = self.servers.list(session).await;
        ToolResult::ok(format!("{} server(s)", servers.len()), json!({ "servers": servers }))
    }

    pub async fn server_logs(&self, pid: u32, tail_lines: Option<usize>) -> ToolResult {
        match self.servers.logs(pid, tail_lines.unwrap_or(50)).await {
            Ok(Some(logs)) => ToolResult::ok(format!("Logs for server {}", pid), json!({ "pid": pid, "logs": logs })),
            Ok(None) => ToolResult::fail(
                format!("No log file for server {}", pid),
                json!({ "pid": pid, "error_kind": "not_found" }),
            ),
            Err(e) => ToolResult::from_error(&e),
        }
    }

    /// Validate a launch command without running it.
    pub fn check_launch(&self, command: &str) -> ToolResult {
        match self.servers.validator().validate(command) {
            Ok(validated) => ToolResult::ok(
                format!("'{}' may be launched", validated.program),
                json!({ "program": validated.program, "args": validated.args }),
            ),
            Err(rejection) => ToolResult::from_error(&rejection.into()),
        }
    }
}
