//! Tracing subscriber initialisation.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{LogConfig, LogFormat, LogLevel};

/// Filter from `RUST_LOG` when set, otherwise from the configured level.
pub fn env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()))
}

/// Install the global subscriber. Call once, at startup.
pub fn init(config: &LogConfig) {
    let text = (config.format == LogFormat::Text).then(tracing_subscriber::fmt::layer);
    let json = (config.format == LogFormat::Json).then(|| tracing_subscriber::fmt::layer().json());

    tracing_subscriber::registry()
        .with(env_filter(config.level))
        .with(text)
        .with(json)
        .init();
}
