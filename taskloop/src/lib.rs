//! Unattended task-runner for coding agents.
//!
//! Works through a markdown checklist one task at a time: every attempt gets a
//! fresh agent session, its result is verified (self-report, build/test/lint,
//! optional AI review) and the checkbox is flipped only when verification
//! passes. The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (parsing, selection, budgets,
//!   failure signatures). No I/O.
//! - **[`io`]**: Side-effecting collaborators (agent sessions, git, shell
//!   commands, the lock file, the task file on disk) behind traits so tests can
//!   swap them out.
//!
//! [`prompt`] and [`verify`] build on both, and [`controller`] drives the run.

pub mod controller;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod prompt;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod verify;
