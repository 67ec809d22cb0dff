//! Advisory machine-wide run lock.
//!
//! The lock is a JSON file, not an OS lock: it records who holds it so a
//! crashed run can be detected and reclaimed. A lock is stale when it is older
//! than [`STALE_AFTER`], its PID is no longer running, or it cannot be parsed.
//!
//! The record is written to a temp file and linked into place without
//! clobbering, so the lock path never holds a partial record.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};

use crate::error::LockError;

/// Age after which a lock is reclaimed regardless of its PID.
pub const STALE_AFTER: chrono::TimeDelta = chrono::TimeDelta::hours(6);

/// An unparsable lock file younger than this is left alone.
pub const CORRUPT_GRACE: Duration = Duration::from_secs(5);

/// Creation attempts; each retry follows a reclaim or a vanished holder.
const ACQUIRE_TRIES: usize = 3;

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    /// RFC 3339 timestamp.
    pub started_at: String,
    pub label: String,
}

impl LockRecord {
    fn current(label: &str) -> Self {
        Self {
            pid: std::process::id(),
            started_at: Utc::now().to_rfc3339(),
            label: label.to_string(),
        }
    }

    /// Why this lock may be reclaimed, if it may.
    pub fn stale_reason(&self, now: DateTime<Utc>) -> Option<&'static str> {
        match DateTime::parse_from_rfc3339(&self.started_at) {
            Ok(started) if now.signed_duration_since(started) > STALE_AFTER => Some("expired"),
            Ok(_) if !is_pid_alive(self.pid) => Some("owner not running"),
            Ok(_) => None,
            Err(_) => Some("unreadable start time"),
        }
    }
}

/// What `inspect` found at the lock path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Free,
    Held(LockRecord),
    Stale {
        record: Option<LockRecord>,
        reason: String,
    },
}

/// Owns the single lock file for this machine.
#[derive(Debug, Clone)]
pub struct LockManager {
    path: PathBuf,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(default_lock_path())
    }
}

/// `$TMPDIR/taskloop/run.lock`.
pub fn default_lock_path() -> PathBuf {
    std::env::temp_dir().join("taskloop").join("run.lock")
}

impl LockManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock, reclaiming a stale one.
    #[instrument(skip_all, fields(path = %self.path.display(), label))]
    pub fn acquire(&self, label: &str) -> Result<LockGuard, LockError> {
        let record = LockRecord::current(label);
        let body = serde_json::to_string(&record).unwrap_or_default();

        for _ in 0..ACQUIRE_TRIES {
            match self.create(&body) {
                Ok(()) => {
                    debug!(pid = record.pid, "lock acquired");
                    return Ok(LockGuard {
                        manager: self.clone(),
                        record: Some(record),
                    });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
                Err(source) => return Err(self.io_error(source)),
            }
            let Some(seen) = self.read_raw().map_err(|source| self.io_error(source))? else {
                continue;
            };
            match classify(&seen, Utc::now()) {
                LockState::Held(holder) => {
                    return Err(LockError::Held {
                        pid: holder.pid,
                        started_at: holder.started_at,
                    });
                }
                LockState::Stale { record: None, .. } if self.modified_within(CORRUPT_GRACE) => {
                    return Err(LockError::Contended);
                }
                LockState::Stale { reason, .. } => {
                    if self.remove_if_unchanged(&seen)? {
                        warn!(reason = %reason, "reclaimed stale lock");
                    }
                }
                LockState::Free => {}
            }
        }
        match self.inspect()? {
            LockState::Held(holder) => Err(LockError::Held {
                pid: holder.pid,
                started_at: holder.started_at,
            }),
            _ => Err(LockError::Contended),
        }
    }

    /// Publish `body` at the lock path, failing with `AlreadyExists` if taken.
    fn create(&self, body: &str) -> io::Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let mut temp = NamedTempFile::new_in(dir)?;
        temp.write_all(body.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist_noclobber(&self.path)
            .map(drop)
            .map_err(|err| err.error)
    }

    /// Remove the lock only if it still holds `seen`; a lock re-created by
    /// another run in the meantime is left alone.
    fn remove_if_unchanged(&self, seen: &str) -> Result<bool, LockError> {
        match self.read_raw().map_err(|source| self.io_error(source))? {
            Some(current) if current == seen => {
                self.remove_file()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn modified_within(&self, window: Duration) -> bool {
        fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age < window)
    }

    /// Remove the lock if `record` still describes its holder. Idempotent.
    pub fn release(&self, record: &LockRecord) -> Result<(), LockError> {
        match self.read_record() {
            Ok(Some(current)) if &current == record => {
                self.remove_file()?;
                debug!("lock released");
            }
            Ok(Some(current)) => {
                warn!(holder_pid = current.pid, "lock owned by another run, leaving it");
            }
            Ok(None) | Err(_) => {}
        }
        Ok(())
    }

    /// Report the current holder without modifying anything.
    pub fn inspect(&self) -> Result<LockState, LockError> {
        match self.read_raw().map_err(|source| self.io_error(source))? {
            None => Ok(LockState::Free),
            Some(contents) => Ok(classify(&contents, Utc::now())),
        }
    }

    /// Delete the lock whoever holds it. Returns the removed record, if any.
    pub fn force_release(&self) -> Result<Option<LockRecord>, LockError> {
        let previous = self
            .read_raw()
            .ok()
            .flatten()
            .and_then(|contents| serde_json::from_str(&contents).ok());
        self.remove_file()?;
        info!(path = %self.path.display(), "lock force-released");
        Ok(previous)
    }

    fn read_record(&self) -> io::Result<Option<LockRecord>> {
        Ok(self
            .read_raw()?
            .and_then(|contents| serde_json::from_str(&contents).ok()))
    }

    fn read_raw(&self) -> io::Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn remove_file(&self) -> Result<(), LockError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(self.io_error(source)),
        }
    }

    fn io_error(&self, source: io::Error) -> LockError {
        LockError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

fn classify(contents: &str, now: DateTime<Utc>) -> LockState {
    match serde_json::from_str::<LockRecord>(contents) {
        Ok(record) => match record.stale_reason(now) {
            Some(reason) => LockState::Stale {
                record: Some(record),
                reason: reason.to_string(),
            },
            None => LockState::Held(record),
        },
        Err(err) => LockState::Stale {
            record: None,
            reason: format!("corrupt lock file: {err}"),
        },
    }
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    manager: LockManager,
    record: Option<LockRecord>,
}

impl LockGuard {
    pub fn record(&self) -> Option<&LockRecord> {
        self.record.as_ref()
    }

    /// Release now instead of waiting for drop.
    pub fn release(mut self) -> Result<(), LockError> {
        match self.record.take() {
            Some(record) => self.manager.release(&record),
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(record) = self.record.take()
            && let Err(err) = self.manager.release(&record)
        {
            warn!(err = %err, "failed to release lock on drop");
        }
    }
}

fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn age(path: &Path, by: Duration) {
        fs::File::options()
            .write(true)
            .open(path)
            .expect("open")
            .set_modified(SystemTime::now() - by)
            .expect("set mtime");
    }

    fn manager() -> (tempfile::TempDir, LockManager) {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = LockManager::new(temp.path().join("locks").join("run.lock"));
        (temp, manager)
    }

    #[test]
    fn second_acquire_reports_holder() {
        let (_temp, manager) = manager();
        let _guard = manager.acquire("first").expect("acquire");
        let err = manager.acquire("second").expect_err("held");
        match err {
            LockError::Held { pid, .. } => assert_eq!(pid, std::process::id()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn drop_releases_and_release_is_idempotent() {
        let (_temp, manager) = manager();
        {
            let _guard = manager.acquire("run").expect("acquire");
            assert!(manager.path().exists());
        }
        assert!(!manager.path().exists());

        let guard = manager.acquire("run").expect("reacquire");
        let record = guard.record().cloned().expect("record");
        guard.release().expect("release");
        manager.release(&record).expect("second release");
        assert_eq!(manager.inspect().expect("inspect"), LockState::Free);
    }

    #[test]
    fn expired_lock_is_reclaimed() {
        let (_temp, manager) = manager();
        fs::create_dir_all(manager.path().parent().expect("parent")).expect("mkdir");
        let old = LockRecord {
            pid: std::process::id(),
            started_at: (Utc::now() - chrono::TimeDelta::hours(7)).to_rfc3339(),
            label: "old".to_string(),
        };
        fs::write(manager.path(), serde_json::to_string(&old).expect("json")).expect("write");
        assert!(matches!(
            manager.inspect().expect("inspect"),
            LockState::Stale { .. }
        ));
        let guard = manager.acquire("new").expect("reclaim");
        assert_eq!(guard.record().expect("record").label, "new");
    }

    #[test]
    fn dead_owner_and_corrupt_lock_are_stale() {
        let (_temp, manager) = manager();
        fs::create_dir_all(manager.path().parent().expect("parent")).expect("mkdir");
        let dead = LockRecord {
            pid: 0,
            started_at: Utc::now().to_rfc3339(),
            label: "dead".to_string(),
        };
        assert_eq!(dead.stale_reason(Utc::now()), Some("owner not running"));

        fs::write(manager.path(), "{not json").expect("write");
        age(manager.path(), Duration::from_secs(60));
        assert!(manager.acquire("fresh").is_ok());
    }

    #[test]
    fn fresh_unreadable_lock_is_not_reclaimed() {
        let (_temp, manager) = manager();
        fs::create_dir_all(manager.path().parent().expect("parent")).expect("mkdir");
        fs::write(manager.path(), "").expect("write");

        let err = manager.acquire("second").expect_err("contended");
        assert!(matches!(err, LockError::Contended));
        assert!(manager.path().exists());
    }

    #[test]
    fn stale_lock_replaced_before_removal_is_kept() {
        let (_temp, manager) = manager();
        fs::create_dir_all(manager.path().parent().expect("parent")).expect("mkdir");
        let dead = LockRecord {
            pid: 0,
            started_at: Utc::now().to_rfc3339(),
            label: "dead".to_string(),
        };
        let seen = serde_json::to_string(&dead).expect("json");
        fs::write(manager.path(), &seen).expect("write");
        let live = serde_json::to_string(&LockRecord::current("new owner")).expect("json");
        fs::write(manager.path(), &live).expect("rewrite");

        assert!(!manager.remove_if_unchanged(&seen).expect("remove"));
        assert_eq!(fs::read_to_string(manager.path()).expect("read"), live);
        assert!(manager.remove_if_unchanged(&live).expect("remove"));
        assert!(!manager.path().exists());
    }

    #[test]
    fn acquire_leaves_only_the_lock_file() {
        let (_temp, manager) = manager();
        let guard = manager.acquire("run").expect("acquire");
        let names: Vec<_> = fs::read_dir(manager.path().parent().expect("parent"))
            .expect("read_dir")
            .map(|entry| entry.expect("entry").file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("run.lock")]);
        let on_disk: LockRecord =
            serde_json::from_str(&fs::read_to_string(manager.path()).expect("read")).expect("json");
        assert_eq!(Some(&on_disk), guard.record());
    }

    #[test]
    fn current_process_is_alive() {
        assert!(is_pid_alive(std::process::id()));
        assert!(!is_pid_alive(0));
    }

    #[test]
    fn release_leaves_foreign_lock() {
        let (_temp, manager) = manager();
        let guard = manager.acquire("mine").expect("acquire");
        let mut foreign = guard.record().cloned().expect("record");
        foreign.label = "someone else".to_string();
        manager.release(&foreign).expect("release");
        assert!(manager.path().exists());

        let removed = manager.force_release().expect("force");
        assert_eq!(removed.expect("record").label, "mine");
        assert!(!manager.path().exists());
        drop(guard);
    }
}
