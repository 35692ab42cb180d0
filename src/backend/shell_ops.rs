//! File operations expressed as shell scripts, for backends without a
//! native file API.

use super::{ExecutionBackend, ScriptRequest, MAX_TRANSFER_BYTES};
use crate::api::SearchMatch;
use crate::error::{Result, SandboxError};
use crate::local;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::time::Duration;

const OP_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_FIND_RESULTS: usize = 10_000;

fn quote(path: &str) -> String {
    shell_words::quote(path).into_owned()
}

async fn run_checked<B: ExecutionBackend + ?Sized>(backend: &B, script: String) -> Result<String> {
    let out = backend.run_script(ScriptRequest::raw(script, OP_TIMEOUT)).await?;
    if out.exit_code != 0 {
        let reason = out.stderr.trim();
        return Err(SandboxError::Backend(if reason.is_empty() {
            format!("file operation exited with code {}", out.exit_code)
        } else {
            reason.to_string()
        }));
    }
    Ok(out.stdout)
}

pub(super) async fn read_file<B: ExecutionBackend + ?Sized>(backend: &B, path: &str) -> Result<String> {
    run_checked(backend, format!("cat {}", quote(path))).await
}

pub(super) async fn write_bytes<B: ExecutionBackend + ?Sized>(
    backend: &B,
    path: &str,
    data: &[u8],
    append: bool,
) -> Result<u64> {
    let redirect = if append { ">>" } else { ">" };
    let script = format!(
        "mkdir -p \"$(dirname {path})\" && printf '%s' '{data}' | base64 -d {redirect} {path}",
        path = quote(path),
        data = STANDARD.encode(data),
        redirect = redirect,
    );
    run_checked(backend, script).await?;
    Ok(data.len() as u64)
}

pub(super) async fn replace_in_file<B: ExecutionBackend + ?Sized>(
    backend: &B,
    path: &str,
    old: &str,
    new: &str,
) -> Result<usize> {
    let content = read_file(backend, path).await?;
    let (updated, count) = local::replace_all(&content, old, new)?;
    if count > 0 {
        write_bytes(backend, path, updated.as_bytes(), false).await?;
    }
    Ok(count)
}

pub(super) async fn search_file<B: ExecutionBackend + ?Sized>(
    backend: &B,
    path: &str,
    pattern: &str,
) -> Result<Vec<SearchMatch>> {
    let content = read_file(backend, path).await?;
    local::search_lines(&content, pattern)
}

pub(super) async fn find_files<B: ExecutionBackend + ?Sized>(
    backend: &B,
    dir: &str,
    glob: &str,
) -> Result<Vec<String>> {
    let listing = run_checked(
        backend,
        format!("find {} -type f 2>/dev/null | head -n {}", quote(dir), MAX_FIND_RESULTS),
    )
    .await?;
    local::filter_glob(dir, listing.lines(), glob)
}

pub(super) async fn delete_path<B: ExecutionBackend + ?Sized>(backend: &B, path: &str) -> Result<()> {
    run_checked(backend, format!("rm -rf {}", quote(path))).await?;
    Ok(())
}

pub(super) async fn list_dir<B: ExecutionBackend + ?Sized>(backend: &B, path: &str) -> Result<Vec<String>> {
    let listing = run_checked(backend, format!("ls -1Ap {}", quote(path))).await?;
    Ok(listing.lines().map(str::to_string).collect())
}

pub(super) async fn download<B: ExecutionBackend + ?Sized>(backend: &B, path: &str) -> Result<Vec<u8>> {
    let script = format!(
        "size=$(wc -c < {path}) || exit 1\n\
         if [ \"$size\" -gt {max} ]; then echo \"file is $size bytes, limit is {max}\" >&2; exit 3; fi\n\
         base64 < {path}",
        path = quote(path),
        max = MAX_TRANSFER_BYTES,
    );
    let encoded = run_checked(backend, script).await?;
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|e| SandboxError::Backend(format!("invalid download payload: {}", e)))
}
