//! `tracing` initialisation for the engine's binaries.
//!
//! An `EnvFilter` seeded from `RUST_LOG` when set, falling back to a
//! caller-supplied default, feeding a compact `fmt` subscriber.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

/// Installs the global `tracing` subscriber. `default_level` is used only
/// when `RUST_LOG` is unset, e.g. `"info"` or `"conduit=debug,warn"`.
///
/// Panics if a subscriber is already installed — call this once, at
/// process start.
pub fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_level(true)
        .compact()
        .init();
}
