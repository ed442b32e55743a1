//! Opt-in structured logging bootstrap built on `tracing_subscriber`.
//! Embedding applications call this once at startup; nothing in this
//! workspace installs a global subscriber on its own.

use tracing_subscriber::EnvFilter;

/// Installs a `tracing_subscriber::fmt` subscriber driven by `RUST_LOG`
/// (falling back to `info`). Safe to call more than once; later calls are
/// no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
