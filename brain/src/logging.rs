//! Development-time tracing for debugging the agent.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, not part of the product output.
//!
//! - **Session files (`io/session_store`)**: The audit trail in
//!   `~/.brain/sessions/`. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`; when unset the filter is `warn`, or `brain=debug` with
/// `--verbose`. Output goes to stderr so it never mixes with model responses
/// on stdout.
///
/// # Example
/// ```bash
/// RUST_LOG=brain=debug brain run "list the files"
/// ```
pub fn init(verbose: bool) {
    let fallback = if verbose { "warn,brain=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
