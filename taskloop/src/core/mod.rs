//! Deterministic, pure logic shared by the runner core.
//!
//! Core modules must be free of I/O side effects (the parser's file read is
//! the single entry point that touches disk). They operate on in-memory data
//! structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod parser;
pub mod selector;
pub mod signature;
pub mod task;
pub mod types;
