//! Process bootstrap helpers.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LOG_ENV_VAR;

fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new(default))
}

/// Initialize tracing with the ANNALS_LOG environment variable.
///
/// Defaults to "info" level if ANNALS_LOG is not set. Panics if a global
/// subscriber is already installed, like `SubscriberInitExt::init`.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(env_filter("info"))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Tracing for test binaries: output captured per test, quiet by default.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::registry()
        .with(env_filter("warn"))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
