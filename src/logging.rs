//! Subscriber setup for the binary.
//!
//! Library crates log through the `log` facade; the subscriber's
//! `tracing-log` bridge picks those records up.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

use crate::config::LogSettings;

/// Install the global subscriber. `RUST_LOG` wins over the configured
/// level. JSON output comes from `log.json` or the `logs-json` feature.
pub fn init(settings: &LogSettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.level))
        .map_err(|e| anyhow!("Invalid log level {:?}: {}", settings.level, e))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let result = if settings.json || cfg!(feature = "logs-json") {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| anyhow!("Failed to install log subscriber: {}", e))
}
