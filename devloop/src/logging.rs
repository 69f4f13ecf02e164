//! Diagnostic tracing for the engine and CLI.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of devloop's product output.
//!
//! - **Iteration logging (`io/iteration_log`)**: Product artifacts in
//!   `.devloop/iterations/`. Always written, unaffected by `RUST_LOG`.
//!
//! Per-iteration summaries use the `devloop::iteration` target, so
//! `RUST_LOG=devloop::iteration=info` follows a run without the rest.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG` env var. Defaults to `warn` if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=devloop=debug devloop run add-retry
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
