//! Version-control adapter used for rollback, commits and review diffs.
//!
//! The controller only needs four operations, so git is wrapped behind the
//! small [`VersionControl`] trait and every subprocess call is bounded by a
//! timeout.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::process::{CommandOutput, run_command_with_timeout};

const GIT_OUTPUT_LIMIT: usize = 4 * 1024 * 1024;

/// Working-tree operations the controller relies on.
pub trait VersionControl: Send + Sync {
    /// Paths (relative to the project root) with uncommitted changes,
    /// including untracked files.
    fn changed_files(&self) -> Result<Vec<String>>;

    /// Stage everything and commit. Returns the new commit hash, or `None`
    /// when there was nothing to commit.
    fn commit_all(&self, message: &str) -> Result<Option<String>>;

    /// Restore the given paths to `HEAD`, deleting files `HEAD` does not know.
    fn discard_paths(&self, paths: &[String]) -> Result<()>;

    /// Unified diff of the working tree against `HEAD`, capped at `max_chars`.
    fn diff_text(&self, max_chars: usize) -> Result<String>;
}

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            timeout,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True when the working directory is inside a git work tree.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .is_ok_and(|out| out.status.success())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    fn exists_in_head(&self, path: &str) -> Result<bool> {
        let spec = format!("HEAD:{path}");
        Ok(self.run(&["cat-file", "-e", &spec])?.status.success())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        let output = run_command_with_timeout(cmd, None, self.timeout, GIT_OUTPUT_LIMIT)
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if output.timed_out {
            return Err(anyhow!(
                "git {} timed out after {}s",
                args.join(" "),
                self.timeout.as_secs()
            ));
        }
        Ok(output)
    }
}

impl VersionControl for Git {
    fn changed_files(&self) -> Result<Vec<String>> {
        let paths: BTreeSet<String> = self
            .status_porcelain()?
            .into_iter()
            .map(|entry| entry.path)
            .collect();
        Ok(paths.into_iter().collect())
    }

    #[instrument(skip_all)]
    fn commit_all(&self, message: &str) -> Result<Option<String>> {
        self.run_checked(&["add", "-A"])?;
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(None);
        }
        self.run_checked(&["commit", "-q", "-m", message])?;
        let hash = self.run_capture(&["rev-parse", "HEAD"])?.trim().to_string();
        debug!(commit = %hash, "committed");
        Ok(Some(hash))
    }

    #[instrument(skip_all, fields(paths = paths.len()))]
    fn discard_paths(&self, paths: &[String]) -> Result<()> {
        for path in paths {
            if self.exists_in_head(path)? {
                self.run_checked(&["checkout", "HEAD", "--", path])?;
                continue;
            }
            self.run_checked(&["rm", "-q", "--cached", "--ignore-unmatch", "--", path])?;
            let full = self.workdir.join(path);
            if full.is_file() {
                fs::remove_file(&full).with_context(|| format!("remove {}", full.display()))?;
            } else if full.is_dir() {
                fs::remove_dir_all(&full).with_context(|| format!("remove {}", full.display()))?;
            }
        }
        debug!("discarded attempt changes");
        Ok(())
    }

    fn diff_text(&self, max_chars: usize) -> Result<String> {
        let mut diff = self.run_capture(&["diff", "HEAD", "--no-color"])?;
        let untracked: Vec<String> = self
            .status_porcelain()?
            .into_iter()
            .filter(|entry| entry.code == "??")
            .map(|entry| entry.path)
            .collect();
        for path in untracked {
            match fs::read_to_string(self.workdir.join(&path)) {
                Ok(contents) => {
                    diff.push_str(&format!("--- /dev/null\n+++ b/{path}\n"));
                    for line in contents.lines() {
                        diff.push('+');
                        diff.push_str(line);
                        diff.push('\n');
                    }
                }
                Err(err) => warn!(path = %path, err = %err, "skipping unreadable untracked file"),
            }
        }
        Ok(truncate_chars(&diff, max_chars))
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}\n[diff truncated]\n", &text[..idx]),
        None => text.to_string(),
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: unquote(path.trim()),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry {
        code,
        path: unquote(&path),
    })
}

fn unquote(path: &str) -> String {
    path.strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .unwrap_or(path)
        .to_string()
}
