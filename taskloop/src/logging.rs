//! Tracing setup for the `taskloop` binary.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Diagnostics and progress via `RUST_LOG`, output
//!   to stderr. Not persisted.
//!
//! - **Run summary**: the `RunResult` JSON printed to stdout when a run ends.
//!   Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `default_directive` if unset, which the binary
/// sets to `taskloop=info` for `run` so progress events are visible.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=taskloop=debug taskloop run TASKS.md
/// ```
pub fn init(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
