//! Tracing/logging initialization.
//!
//! The resilience components emit structured events (`tracing` macros) and
//! leave subscriber wiring to the process edge. This can evolve into layered
//! exporters, correlation IDs, etc.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process at the `info` level.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with_default("info");
}

/// Initialize tracing/logging with a fallback filter used when `RUST_LOG`
/// is not set.
pub fn init_with_default(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    // JSON logs + timestamps, configurable via RUST_LOG.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}
