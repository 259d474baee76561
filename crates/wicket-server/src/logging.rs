//! tracing subscriber setup

use anyhow::Context;
use tracing_subscriber::{
    filter::Directive, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::config::LoggingConfig;

/// Install the global subscriber described by `config`
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = build_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    if config.json_format {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(config.include_target)
            .with_line_number(config.include_line_number);
        registry
            .with(layer)
            .try_init()
            .context("Failed to install logger")?;
    } else {
        let layer = tracing_subscriber::fmt::layer()
            .with_target(config.include_target)
            .with_line_number(config.include_line_number)
            .with_ansi(config.ansi_colors);
        registry
            .with(layer)
            .try_init()
            .context("Failed to install logger")?;
    }

    tracing::info!("Logging initialized with level: {}", config.level);
    Ok(())
}

fn build_filter(config: &LoggingConfig) -> anyhow::Result<EnvFilter> {
    let mut filter = EnvFilter::try_new(&config.level)
        .with_context(|| format!("Invalid log level: {}", config.level))?;

    for (module, level) in &config.module_levels {
        let directive: Directive = format!("{}={}", module, level)
            .parse()
            .with_context(|| format!("Invalid log directive: {}={}", module, level))?;
        filter = filter.add_directive(directive);
    }

    Ok(filter)
}
