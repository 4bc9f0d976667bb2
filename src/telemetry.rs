//! Shared tracing bootstrap for Granary embedders.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Initializes a formatted tracing subscriber.
///
/// `RUST_LOG` overrides the default level. Safe to call more than once;
/// later calls are no-ops.
pub fn init_tracing(default_level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
