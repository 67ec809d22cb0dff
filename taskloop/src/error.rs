//! Typed errors that escape the crate boundary.
//!
//! Everything below the boundary uses `anyhow`; these enums exist so callers can
//! tell "the run never started" apart from an ordinary failed run.

use std::path::PathBuf;

use thiserror::Error;

/// The task file could not be read or its structure is ambiguous.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("read task file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: {reason}")]
    Ambiguous {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// Failure to take or release the machine-wide run lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("another run holds the lock (pid {pid}, started {started_at})")]
    Held { pid: u32, started_at: String },
    #[error("another run is taking the lock right now")]
    Contended,
    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Conditions under which starting a run would be meaningless.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("invalid run config: {0}")]
    Config(String),
}
