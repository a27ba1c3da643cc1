use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.level.to_string()))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(config.include_target)
        .with_thread_ids(false)
        .with_line_number(config.include_file_line)
        .with_file(config.include_file_line)
        .with_ansi(config.enable_colors);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    tracing::debug!(level = %config.level, "Logging initialized");
    Ok(())
}
