//! Tracing subscriber setup
//!
//! Logs go to stderr so stdout carries only the engine's response.

use clap::ValueEnum;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable, multi-line
    Pretty,
    /// One line per event
    Compact,
    /// JSON lines
    Json,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive; falls back to `RUST_LOG`, then `warn`
    pub level: Option<String>,
    pub format: LogFormat,
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: None,
            format: LogFormat::Compact,
            timestamps: true,
        }
    }
}

fn filter(level: Option<&str>) -> EnvFilter {
    match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    }
}

/// Install the global subscriber
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
    let filter = filter(config.level.as_deref());
    let registry = tracing_subscriber::registry().with(filter);
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    match (config.format, config.timestamps) {
        (LogFormat::Pretty, true) => registry.with(layer.pretty()).try_init()?,
        (LogFormat::Pretty, false) => registry.with(layer.pretty().without_time()).try_init()?,
        (LogFormat::Compact, true) => registry.with(layer.compact()).try_init()?,
        (LogFormat::Compact, false) => registry.with(layer.compact().without_time()).try_init()?,
        (LogFormat::Json, true) => registry.with(layer.json()).try_init()?,
        (LogFormat::Json, false) => registry.with(layer.json().without_time()).try_init()?,
    }
    Ok(())
}
