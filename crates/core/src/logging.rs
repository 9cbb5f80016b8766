//! Subscriber setup for the `tracing` events the engine emits.
//!
//! - `RUST_LOG` controls levels (default: `info`).
//! - `TOKENGEN_LOG_FORMAT=json` switches to JSON lines; anything else is
//!   pretty-printed.
//!
//! Embedders with their own subscriber should skip this module; all library
//! code only emits events.

use thiserror::Error;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

pub const LOG_FORMAT_ENV: &str = "TOKENGEN_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable (default).
    Pretty,
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }

    pub fn from_env() -> Self {
        Self::parse(&std::env::var(LOG_FORMAT_ENV).unwrap_or_default())
    }
}

#[derive(Error, Debug)]
#[error("logging subscriber init failed: {0}")]
pub struct LoggingError(#[from] TryInitError);

/// Install a global subscriber using the environment's format.
pub fn init() -> Result<(), LoggingError> {
    init_with_level_and_format(None, LogFormat::from_env())
}

/// `level` is used when `RUST_LOG` is unset or invalid.
pub fn init_with_level(level: &str) -> Result<(), LoggingError> {
    init_with_level_and_format(Some(level), LogFormat::from_env())
}

/// Fails if a global subscriber is already installed.
pub fn init_with_level_and_format(
    level: Option<&str>,
    format: LogFormat,
) -> Result<(), LoggingError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));

    match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init()?,
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init()?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parsing() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse(" JSON "), LogFormat::Json);
        assert_eq!(LogFormat::parse(""), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
    }

    #[test]
    fn second_init_is_an_error_not_a_panic() {
        // Another test may already have installed a subscriber.
        let _ = init_with_level_and_format(Some("warn"), LogFormat::Pretty);
        assert!(init_with_level_and_format(Some("warn"), LogFormat::Json).is_err());
    }
}
