//! Stable exit codes for taskloop CLI commands.

/// Every task is checked off, or the command succeeded.
pub const OK: i32 = 0;
/// Invalid config or task file, or any other error before a run started.
pub const INVALID: i32 = 1;
/// The run stopped with unchecked tasks left.
pub const INCOMPLETE: i32 = 2;
/// Another run holds the lock.
pub const LOCKED: i32 = 3;
