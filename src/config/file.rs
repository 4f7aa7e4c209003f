//! Configuration file support
//!
//! ## Example Configuration
//!
//! ```toml
//! # streamline-txn.toml
//!
//! [storage]
//! data_dir = "/var/lib/streamline"
//! in_memory = false
//! sync_mode = "every_write"
//!
//! [transaction]
//! coordinator_partitions = 4
//! default_timeout_ms = 60000
//! snapshot_min_interval_ms = 5000
//! snapshot_max_entries = 1000
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```

use std::path::Path;

use super::BrokerConfig;
use crate::error::{ConfigError, Result};

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "STREAMLINE_TXN_";

impl BrokerConfig {
    /// Load configuration from a TOML file, apply environment overrides and validate
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Unreadable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let mut config = Self::from_toml_str(&contents)?;
        config.apply_env_overrides_from(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text without environment overrides
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| ConfigError::Message(format!("Failed to parse config: {}", e)).into())
    }

    /// Apply `STREAMLINE_TXN_*` overrides read through `lookup`
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = get("DATA_DIR") {
            self.storage.data_dir = v.into();
        }
        if let Some(v) = get("IN_MEMORY") {
            self.storage.in_memory = parse_bool("IN_MEMORY", &v)?;
        }
        if let Some(v) = get("SYNC_MODE") {
            self.storage.sync_mode = v;
        }
        if let Some(v) = get("COORDINATOR_PARTITIONS") {
            self.transaction.coordinator_partitions = parse_num("COORDINATOR_PARTITIONS", &v)?;
        }
        if let Some(v) = get("DEFAULT_TIMEOUT_MS") {
            self.transaction.default_timeout_ms = parse_num("DEFAULT_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("SNAPSHOT_MIN_INTERVAL_MS") {
            self.transaction.snapshot_min_interval_ms =
                parse_num("SNAPSHOT_MIN_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("SNAPSHOT_MAX_ENTRIES") {
            self.transaction.snapshot_max_entries = parse_num("SNAPSHOT_MAX_ENTRIES", &v)?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = get("LOG_FORMAT") {
            self.logging.format = v.parse()?;
        }
        Ok(())
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "true" | "TRUE" | "yes" => Ok(true),
        "0" | "false" | "FALSE" | "no" => Ok(false),
        other => Err(ConfigError::invalid_setting(
            format!("{}{}", ENV_PREFIX, name),
            format!("expected a boolean, got '{}'", other),
        )
        .into()),
    }
}

fn parse_num<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        ConfigError::invalid_setting(
            format!("{}{}", ENV_PREFIX, name),
            format!("expected a number, got '{}'", value),
        )
        .into()
    })
}
