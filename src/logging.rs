//! Tracing subscriber setup.
//!
//! `RUST_LOG` wins over the configured level when set. Installing twice is
//! harmless (the second call is ignored), which keeps tests and the binary
//! from fighting over the global subscriber.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{AppResult, OctError};

/// Install the global tracing subscriber described by `config`.
pub fn init(config: &LoggingConfig) -> AppResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            OctError::Configuration(format!("invalid log level '{}': {e}", config.level))
        })?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi)
        .with_thread_names(true)
        .with_target(true);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_ok() {
        let config = LoggingConfig::default();
        init(&config).unwrap();
        init(&config).unwrap();
    }
}
