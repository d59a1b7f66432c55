//! Tracing subscriber setup

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{CoreError, Result};

/// Default filter directive: `verbose` forces debug for this crate,
/// otherwise the configured level applies.
pub fn filter_directive(config: &LoggingConfig, verbose: bool) -> String {
    if verbose {
        "hezardastan_core=debug,hezardastan=debug".to_string()
    } else {
        config.level.clone()
    }
}

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn init(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config, verbose)));

    let layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layer)
        .try_init()
        .map_err(|e| CoreError::configuration(format!("Failed to initialize logging: {}", e)))?;

    info!(format = ?config.format, "Logging initialized");
    Ok(())
}
