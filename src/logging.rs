//! Development-time tracing for debugging the engine.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: host-facing diagnostics via `RUST_LOG`,
//!   output to stderr. Not persisted, not part of the engine's product
//!   output. The engine itself reads no environment variables; hosts opt
//!   into this explicitly.
//!
//! - **Event logs (`io/event_log`)**: product output under
//!   `.aiplatform/logs/`. Always written, unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber for development logging.
///
/// Reads `RUST_LOG`; defaults to `warn` when unset. Output goes to stderr
/// in compact format.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
