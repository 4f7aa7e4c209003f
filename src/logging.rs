//! Log output setup
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and a fmt
//! layer. `RUST_LOG` wins over the configured level when it is set.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{DEFAULT_LOG_FILTER, DEFAULT_LOG_LEVEL};
use crate::error::{ConfigError, StreamlineError};

/// Line format of emitted log records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Plain => write!(f, "plain"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = StreamlineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" | "text" => Ok(LogFormat::Plain),
            "json" => Ok(LogFormat::Json),
            other => Err(ConfigError::invalid_setting(
                "logging.format",
                format!("unknown format '{}', expected plain or json", other),
            )
            .into()),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base level ("trace", "debug", "info", "warn", "error")
    pub level: String,

    /// Output format
    pub format: LogFormat,

    /// Include the module path of each record
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            format: LogFormat::Plain,
            with_target: true,
        }
    }
}

impl LoggingConfig {
    /// Filter directives derived from the configured level
    pub fn filter_directives(&self) -> String {
        if self.level == DEFAULT_LOG_LEVEL {
            DEFAULT_LOG_FILTER.to_string()
        } else {
            self.level.clone()
        }
    }
}

/// Initialize the global subscriber
///
/// Returns false if a global subscriber was already installed, which is the
/// normal case when several tests in one binary call this.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let result = match config.format {
        LogFormat::Plain => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(config.with_target))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(config.with_target),
            )
            .try_init(),
    };

    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parse() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("TEXT".parse::<LogFormat>().unwrap(), LogFormat::Plain);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_filter_directives() {
        let config = LoggingConfig::default();
        assert_eq!(config.filter_directives(), "info,streamline_txn=debug");

        let config = LoggingConfig {
            level: "warn".to_string(),
            ..Default::default()
        };
        assert_eq!(config.filter_directives(), "warn");
    }

    #[test]
    fn test_init_twice() {
        let config = LoggingConfig::default();
        let _ = init_logging(&config);
        assert!(!init_logging(&config));
    }
}
