//! Logging initialization for hosts embedding the cache

use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG`, or `default_filter` when unset.
///
/// Returns `false` when a global subscriber was already installed by the host.
pub fn init_logging(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok();

    if installed {
        debug!("mediaflow logging initialized");
    }
    installed
}

/// Initialize logging from a verbosity count (0 = info, 1 = debug, 2+ = trace)
pub fn init_tracing(verbose: u8) -> bool {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    init_logging(level)
}
