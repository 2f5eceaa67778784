//! # Logging
//!
//! Installs a `tracing-subscriber` formatter for the whole process.
//!
//! The crate itself only emits `tracing` events; calling [`init_logging`] is up to
//! the embedding application (tests usually skip it).

use crate::config::LoggingConfig;
use crate::error::{NetworkError, Result};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let default_directive = config.log_level.to_string().to_lowercase();
    let filter = if config.env_filter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_directive))
    } else {
        EnvFilter::new(&default_directive)
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| NetworkError::ConfigError(format!("Failed to install logger: {e}")))?;
    tracing::info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    Ok(())
}
