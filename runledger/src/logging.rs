//! Diagnostic tracing for the runledger CLI.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Diagnostics via `RUST_LOG`, output to stderr.
//!   Not persisted, never read back by the engine.
//!
//! - **Journal (`io/journal`)**: The product record under `.runledger/runs/`.
//!   Always written, unaffected by `RUST_LOG`. Hook logs land next to it
//!   under `.runledger/artifacts/`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG` env var. Defaults to `warn` if unset.
/// Output: stderr, compact format, so stdout stays machine-readable JSON.
///
/// # Example
/// ```bash
/// RUST_LOG=runledger=debug runledger run tick 01J...
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
