//! Side-effecting adapters: files, processes, git, agent sessions.
//!
//! Each collaborator the controller depends on sits behind a trait here so tests
//! can swap in scripted fakes.

pub mod agent;
pub mod config;
pub mod git;
pub mod lock;
pub mod memory;
pub mod process;
pub mod progress;
pub mod task_store;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};

/// Write `contents` to a sibling temp file and rename it over `path`.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("path has no file name: {}", path.display()))?;
    let tmp_path = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Run blocking work (subprocesses, git, file scans) off the async runtime.
pub async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .context("blocking task panicked")?
}
