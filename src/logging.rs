//! Subscriber setup for the headless binary. Library crates log through
//! the `log` facade; those records are bridged into `tracing` here.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Preferred filter variable; `RUST_LOG` is honoured as a fallback.
pub const LOG_ENV: &str = "RELAYBAR_LOG";
pub const DEFAULT_FILTER: &str = "info";

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init() -> Result<(), String> {
    let registry = tracing_subscriber::registry().with(env_filter());

    #[cfg(feature = "logs-json")]
    let result = registry
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .try_init();
    #[cfg(not(feature = "logs-json"))]
    let result = registry
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init();

    result.map_err(|e| format!("failed to initialise logging: {}", e))
}
