//! Local execution: runs scripts and file operations on this machine.
//!
//! Used by the in-container agent and the job executor, i.e. the side that
//! lives inside the isolated environment.

use crate::api::SearchMatch;
use crate::error::{Result, SandboxError};
use globset::{Glob, GlobMatcher};
use regex::Regex;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};
use walkdir::WalkDir;

const MAX_FIND_RESULTS: usize = 10_000;

/// Configuration for running one script.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub script: String,
    pub timeout: Duration,
    pub nofile: u64,
    /// Where the script file is written before it is handed to `sh`.
    pub scratch_dir: PathBuf,
}

/// Result of running a script.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub timed_out: bool,
}

impl RunResult {
    /// Shell-style status: the exit code, 128+signal, or -1 on timeout.
    pub fn status(&self) -> i32 {
        if self.timed_out {
            return -1;
        }
        match (self.exit_code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => -1,
        }
    }
}

/// Run `config.script` with `sh`. The script goes through a file rather
/// than `-c` so large payloads are not bound by argument limits, and stdin
/// is closed so commands cannot read the rest of the script.
pub async fn run_script(config: &RunConfig) -> Result<RunResult> {
    let script_path = config
        .scratch_dir
        .join(format!(".sandbox-{}.sh", uuid::Uuid::new_v4()));
    tokio::fs::write(&script_path, &config.script)
        .await
        .map_err(|e| SandboxError::Backend(format!("write script {}: {}", script_path.display(), e)))?;

    let result = execute(&script_path, config).await;

    if let Err(e) = tokio::fs::remove_file(&script_path).await {
        warn!(path = %script_path.display(), error = %e, "Failed to remove script file");
    }
    result
}

async fn execute(script_path: &Path, config: &RunConfig) -> Result<RunResult> {
    let mut command = Command::new("sh");
    command
        .arg(script_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(target_os = "linux")]
    {
        let nofile = config.nofile;
        // SAFETY: only async-signal-safe setrlimit/getrlimit calls run in the child.
        unsafe {
            command.pre_exec(move || set_resource_limits(nofile));
        }
    }

    let child = command
        .spawn()
        .map_err(|e| SandboxError::Backend(format!("spawn sh: {}", e)))?;

    match tokio::time::timeout(config.timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output.map_err(|e| SandboxError::Backend(format!("wait: {}", e)))?;
            let result = RunResult {
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code: output.status.code(),
                signal: output.status.signal(),
                timed_out: false,
            };
            info!(exit = ?result.exit_code, signal = ?result.signal, stdout_len = result.stdout.len(), "Script finished");
            Ok(result)
        }
        Err(_) => {
            warn!(timeout = ?config.timeout, "Script timed out, killed");
            Ok(RunResult {
                stdout: String::new(),
                stderr: format!("Command timed out after {}s", config.timeout.as_secs()),
                exit_code: None,
                signal: None,
                timed_out: true,
            })
        }
    }
}

#[cfg(target_os = "linux")]
fn set_resource_limits(nofile: u64) -> std::io::Result<()> {
    use nix::sys::resource::{getrlimit, setrlimit, Resource};

    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    let (_, hard) = getrlimit(Resource::RLIMIT_NOFILE)?;
    let soft = nofile.min(hard);
    setrlimit(Resource::RLIMIT_NOFILE, soft, hard)?;
    Ok(())
}

pub fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| SandboxError::Backend(format!("read {}: {}", path.display(), e)))
}

pub fn read_bytes(path: &Path, limit: u64) -> Result<Vec<u8>> {
    let size = fs::metadata(path)
        .map_err(|e| SandboxError::Backend(format!("stat {}: {}", path.display(), e)))?
        .len();
    if size > limit {
        return Err(SandboxError::Backend(format!(
            "file is {} bytes, limit is {}",
            size, limit
        )));
    }
    fs::read(path).map_err(|e| SandboxError::Backend(format!("read {}: {}", path.display(), e)))
}

/// Write (or append) `content`, creating parent directories as needed.
pub fn write_file(path: &Path, content: &[u8], append: bool) -> Result<u64> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| SandboxError::Backend(format!("mkdir parent: {}", e)))?;
    }
    let existed = path.exists();
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(append)
        .truncate(!append)
        .open(path)
        .map_err(|e| SandboxError::Backend(format!("open {}: {}", path.display(), e)))?;
    file.write_all(content)
        .map_err(|e| SandboxError::Backend(format!("write file: {}", e)))?;

    if !existed {
        fs::set_permissions(path, fs::Permissions::from_mode(0o644))
            .map_err(|e| SandboxError::Backend(format!("chmod: {}", e)))?;
    }
    Ok(content.len() as u64)
}

/// Replace every occurrence of `old`, returning the new text and the count.
pub fn replace_all(content: &str, old: &str, new: &str) -> Result<(String, usize)> {
    if old.is_empty() {
        return Err(SandboxError::Backend("search text must not be empty".to_string()));
    }
    let count = content.matches(old).count();
    Ok((content.replace(old, new), count))
}

pub fn search_lines(content: &str, pattern: &str) -> Result<Vec<SearchMatch>> {
    let regex = Regex::new(pattern).map_err(|e| SandboxError::Backend(format!("invalid pattern: {}", e)))?;
    Ok(content
        .lines()
        .enumerate()
        .filter(|(_, line)| regex.is_match(line))
        .map(|(idx, line)| SearchMatch {
            line: idx + 1,
            text: line.to_string(),
        })
        .collect())
}

fn glob_matcher(glob: &str) -> Result<GlobMatcher> {
    Glob::new(glob)
        .map(|g| g.compile_matcher())
        .map_err(|e| SandboxError::Backend(format!("invalid glob: {}", e)))
}

/// Keep the paths under `dir` whose relative form matches `glob`.
pub fn filter_glob<'a>(dir: &str, paths: impl Iterator<Item = &'a str>, glob: &str) -> Result<Vec<String>> {
    let matcher = glob_matcher(glob)?;
    let base = Path::new(dir);
    Ok(paths
        .filter(|p| !p.is_empty())
        .filter(|p| {
            let path = Path::new(p);
            let relative = path.strip_prefix(base).unwrap_or(path);
            matcher.is_match(relative)
        })
        .map(str::to_string)
        .collect())
}

pub fn find_files(dir: &Path, glob: &str) -> Result<Vec<String>> {
    let matcher = glob_matcher(glob)?;
    let mut found = Vec::new();
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        if matcher.is_match(relative) {
            found.push(entry.path().display().to_string());
            if found.len() >= MAX_FIND_RESULTS {
                break;
            }
        }
    }
    Ok(found)
}

/// Directory entries, sorted, with a trailing `/` on directories.
pub fn list_dir(path: &Path) -> Result<Vec<String>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path).map_err(|e| SandboxError::Backend(format!("read dir {}: {}", path.display(), e)))? {
        let entry = entry?;
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() {
            name.push('/');
        }
        entries.push(name);
    }
    entries.sort();
    Ok(entries)
}

pub fn delete_path(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}
