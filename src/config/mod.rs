//! Configuration module for the transactional broker core
//!
//! - `defaults` - Default constants and values
//! - `storage` - Managed ledger storage configuration
//! - `transaction` - Coordinator, buffer snapshot and notification settings
//! - `file` - TOML file loading and environment overrides
//!
//! # Configuration Sources
//!
//! Configuration is loaded with this precedence (highest first):
//! 1. **Environment variables** - `STREAMLINE_TXN_*` prefix
//! 2. **Config file** - TOML configuration file
//! 3. **Built-in defaults**

mod defaults;
pub mod file;
mod storage;
mod transaction;

pub use defaults::*;
pub use storage::StorageConfig;
pub use transaction::TransactionConfig;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::logging::LoggingConfig;

/// Complete configuration of the transactional broker core
///
/// # Example
///
/// ```rust,ignore
/// use streamline_txn::config::BrokerConfig;
///
/// let config = BrokerConfig::from_file("streamline-txn.toml")?;
/// let broker = BrokerService::start(config).await?;
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Managed ledger storage
    pub storage: StorageConfig,

    /// Transaction coordinator and buffer settings
    pub transaction: TransactionConfig,

    /// Log output
    pub logging: LoggingConfig,
}

impl BrokerConfig {
    /// Everything in memory, used by tests and embedded setups
    pub fn in_memory() -> Self {
        Self {
            storage: StorageConfig::in_memory(),
            ..Self::default()
        }
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        let txn = &self.transaction;
        if txn.coordinator_partitions == 0 {
            return Err(ConfigError::invalid_setting(
                "transaction.coordinator_partitions",
                "must be at least 1",
            )
            .into());
        }
        if txn.min_timeout_ms <= 0 || txn.min_timeout_ms > txn.max_timeout_ms {
            return Err(ConfigError::invalid_setting(
                "transaction.min_timeout_ms",
                format!(
                    "must be positive and not above max_timeout_ms ({})",
                    txn.max_timeout_ms
                ),
            )
            .into());
        }
        if txn.notify_min_backoff_ms == 0 || txn.notify_min_backoff_ms > txn.notify_max_backoff_ms
        {
            return Err(ConfigError::invalid_setting(
                "transaction.notify_min_backoff_ms",
                "must be positive and not above notify_max_backoff_ms",
            )
            .into());
        }
        if txn.timeout_check_interval_ms == 0 || txn.snapshot_min_interval_ms == 0 {
            return Err(ConfigError::invalid_setting(
                "transaction",
                "check and snapshot intervals must be positive",
            )
            .into());
        }
        if !matches!(
            self.storage.sync_mode.as_str(),
            "every_write" | "os_default"
        ) {
            return Err(ConfigError::invalid_setting(
                "storage.sync_mode",
                format!(
                    "unknown mode '{}', expected every_write or os_default",
                    self.storage.sync_mode
                ),
            )
            .into());
        }
        if self.storage.replay_batch_size == 0 {
            return Err(
                ConfigError::invalid_setting("storage.replay_batch_size", "must be positive")
                    .into(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        BrokerConfig::default().validate().unwrap();
        BrokerConfig::in_memory().validate().unwrap();
    }

    #[test]
    fn test_zero_partitions_rejected() {
        let mut config = BrokerConfig::in_memory();
        config.transaction.coordinator_partitions = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("coordinator_partitions"));
    }

    #[test]
    fn test_unknown_sync_mode_rejected() {
        let mut config = BrokerConfig::in_memory();
        config.storage.sync_mode = "sometimes".to_string();
        assert!(config.validate().is_err());
    }
}
