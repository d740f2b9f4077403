//! Logging initialization using tracing.

use std::str::FromStr;

use anyhow::{bail, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable, one event per line.
    #[default]
    Pretty,
    /// One JSON object per line, for log aggregation.
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => bail!("Unknown log format '{}'. Use 'pretty' or 'json'", other),
        }
    }
}

/// Initialize the tracing subscriber with the given level and format.
///
/// `RUST_LOG` takes precedence over `level` when set.
pub fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    match format {
        LogFormat::Pretty => init_logging_pretty(level),
        LogFormat::Json => init_logging_json(level),
    }
}

/// Initialize human readable logging.
pub fn init_logging_pretty(level: &str) -> Result<()> {
    let filter = build_filter(level);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()?;

    Ok(())
}

/// Initialize logging with JSON output format.
/// Suitable for production hosts with log aggregation.
pub fn init_logging_json(level: &str) -> Result<()> {
    let filter = build_filter(level);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_target(true).with_current_span(true))
        .try_init()?;

    Ok(())
}

fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}
