//! Tracing subscriber setup.
//!
//! The library itself only emits `tracing` events. Applications that want
//! them printed call [`init_tracing`] once at startup.

use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{ReteError, ReteResult};

/// Build the filter: `RUST_LOG` when set, the configured level otherwise.
pub fn env_filter(config: &LoggingConfig) -> ReteResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level)
        .map_err(|e| ReteError::Config(format!("invalid log level '{}': {}", config.level, e)))
}

/// Install a global fmt subscriber.
///
/// Fails with [`ReteError::Config`] when a global subscriber is already set.
pub fn init_tracing(config: &LoggingConfig) -> ReteResult<()> {
    let filter = env_filter(config)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match config.format {
        LogFormat::Full => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
    };
    installed.map_err(|e| ReteError::Config(format!("tracing already initialised: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            level: "rete_xuples=loud".into(),
            format: LogFormat::Compact,
        };
        assert!(matches!(env_filter(&config), Err(ReteError::Config(_))));
    }

    #[test]
    fn test_second_install_is_an_error() {
        let config = LoggingConfig::default();
        let _ = init_tracing(&config);
        assert!(matches!(init_tracing(&config), Err(ReteError::Config(_))));
    }
}
