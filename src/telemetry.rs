use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{RbError, Result};

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
///
/// Calling this again after a subscriber is installed is a no-op.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = env_filter(config)?;
    let builder = fmt().with_env_filter(filter).with_writer(std::io::stderr);
    let installed = match config.format {
        LogFormat::Text => builder.with_target(false).try_init(),
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
    };
    if let Err(err) = installed {
        tracing::debug!("tracing subscriber already installed: {err}");
    }
    Ok(())
}

fn env_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level).map_err(|err| {
            RbError::Telemetry(format!("invalid log level '{}': {err}", config.level))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_level() {
        if std::env::var("RUST_LOG").is_ok() {
            eprintln!("RUST_LOG set; skipping level parsing test");
            return;
        }
        let config = LoggingConfig {
            level: "rb_deployer=loudest".to_string(),
            ..LoggingConfig::default()
        };
        assert!(matches!(env_filter(&config), Err(RbError::Telemetry(_))));
    }

    #[test]
    fn init_twice_is_harmless() {
        let config = LoggingConfig::default();
        init(&config).expect("first init");
        init(&config).expect("second init");
    }
}
