//! Logging setup for the routing engine.
//!
//! Components log through the `tracing` macros with key/value fields:
//! - WARN: recoverable failures (step failed, circuit opened, request rejected)
//! - INFO: decisions (registration, strategy chosen, plan finished)
//! - DEBUG: detailed traces (candidates ranked, dispatch, backoff)
//!
//! Debug mode can be enabled with `init_with_debug(true)` or `SWARM_DEBUG=1`.
//! `RUST_LOG` overrides both.

use crate::error::Result;
use std::fs::File;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Log file name used by `init_to_file`.
pub const LOG_FILE: &str = "swarm.log";

fn env_debug() -> bool {
    std::env::var("SWARM_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn filter(debug: bool) -> EnvFilter {
    let default = if debug || env_debug() { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install a stderr subscriber at the default level.
pub fn init() {
    init_with_debug(false);
}

/// Install a stderr subscriber with explicit debug mode.
///
/// A second call, or a call after another subscriber was installed, is a no-op.
pub fn init_with_debug(debug: bool) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(debug))
        .with_target(false)
        .try_init();
}

/// Install a subscriber writing to `<dir>/swarm.log`, truncated on start.
pub fn init_to_file(dir: &Path, debug: bool) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let file = File::create(dir.join(LOG_FILE))?;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(debug))
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init();
    Ok(())
}
