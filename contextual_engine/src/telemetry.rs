//! Logging initialization.

use crate::settings::{LogFormat, LoggingConfig};
use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

/// Installs the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("Invalid log level '{}'", config.level))?;

    match config.format {
        LogFormat::Json => {
            let subscriber = Registry::default().with(filter).with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(config.enable_target)
                    .with_writer(std::io::stderr),
            );
            tracing::subscriber::set_global_default(subscriber)
                .context("Failed to install JSON logger")?;
        }
        LogFormat::Text => {
            let subscriber = Registry::default().with(filter).with(
                tracing_subscriber::fmt::layer()
                    .with_target(config.enable_target)
                    .with_writer(std::io::stderr),
            );
            tracing::subscriber::set_global_default(subscriber)
                .context("Failed to install console logger")?;
        }
    }

    tracing::debug!(format = ?config.format, "Logging initialized");
    Ok(())
}
