//! Subscriber installation for the server and the hook binary.

use tracing_subscriber::EnvFilter;

use crate::hooks::env::HOOK_LOG;

/// Log to stdout with the level taken from `RUST_LOG`, `info` if unset.
///
/// Installing twice is harmless; the second call keeps the first subscriber.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Log to stderr with the level taken from `FORGE_HOOK_LOG`, silent if unset.
///
/// The hook's stderr ends up on the pushing user's terminal.
pub fn init_hook() {
    let filter = EnvFilter::try_from_env(HOOK_LOG).unwrap_or_else(|_| EnvFilter::new("off"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .try_init();
}
