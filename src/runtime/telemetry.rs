//! Tracing subscriber setup for embedders and tests

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Install a formatting subscriber filtered by `RUST_LOG`
///
/// The default level is `info`, or `debug` when `debug` is set. Returns
/// `false` if a global subscriber was already installed.
pub fn init_tracing(debug: bool) -> bool {
    let level = if debug { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .try_init()
        .is_ok()
}
