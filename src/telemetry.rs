//! Tracing subscriber setup.

use crate::config::ApplicationConfig;
use tracing_subscriber::EnvFilter;

/// Error returned when a global subscriber is already installed.
pub type InitError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Build the filter: `RUST_LOG` wins, otherwise the configured level.
pub fn env_filter(config: &ApplicationConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
}

/// Install the global `tracing` subscriber.
pub fn init(config: &ApplicationConfig) -> Result<(), InitError> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_target(true);

    if config.json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    }
}
