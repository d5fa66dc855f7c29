//! Process-wide `tracing` initialization, shared by the binary that
//! embeds the replication manager and by integration tests that want
//! readable output.

use tracing_subscriber::EnvFilter;

/// Install a `tracing_subscriber` that honors `RUST_LOG`, defaulting to
/// `info`. Safe to call more than once; subsequent calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
