//! Diagnostic tracing for the engine.
//!
//! Scope lifecycle, termination decisions and advisory resource violations are
//! logged through `tracing`. Nothing here is part of a scope's result; the
//! structured [`SubAgentResult`](crate::scope::SubAgentResult) is the product
//! output.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `warn` if unset.
/// Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=subagent=debug subagent run scope.toml --replay transcript.json
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
