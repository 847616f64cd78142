//! Log subscriber initialization.
//!
//! `RUST_LOG` takes precedence over the configured level so individual
//! targets can be raised without editing the config file.

use embedserve_service::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Installs the global `fmt` subscriber described by `config`.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}
