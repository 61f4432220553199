//! Log subscriber setup for the binary
//!
//! Library code only emits `tracing` events; installing a subscriber is left
//! to the process entry point.

use crate::config::Config;
use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber; `RUST_LOG` overrides the configured level
pub fn init(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()));

    // A subscriber may already be installed (tests, embedding hosts)
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}
