//! Diagnostic tracing for kci.
//!
//! Tracing is for debugging the tool itself (`RUST_LOG`, stderr). Operator
//! progress such as poll reports and bisection steps is printed by the binary
//! on stdout and does not depend on the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=kci=debug kci watch --treeid 65f1c0ffee
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
