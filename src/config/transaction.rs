//! Transaction coordinator, buffer snapshot and notification settings

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::defaults::{
    DEFAULT_COORDINATOR_PARTITIONS, DEFAULT_MAX_TRANSACTION_TIMEOUT_MS,
    DEFAULT_MIN_TRANSACTION_TIMEOUT_MS, DEFAULT_NOTIFY_MAX_BACKOFF_MS,
    DEFAULT_NOTIFY_MIN_BACKOFF_MS, DEFAULT_SNAPSHOT_MAX_ENTRIES, DEFAULT_SNAPSHOT_MIN_INTERVAL_MS,
    DEFAULT_TIMEOUT_CHECK_INTERVAL_MS, DEFAULT_TRANSACTION_TIMEOUT_MS,
};

/// Transaction subsystem configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Number of independently sequenced coordinator partitions
    pub coordinator_partitions: u64,

    /// Timeout applied when a client does not request one (in ms)
    pub default_timeout_ms: i64,

    /// Minimum transaction timeout that can be set by clients (in ms)
    pub min_timeout_ms: i64,

    /// Maximum transaction timeout that can be set by clients (in ms)
    pub max_timeout_ms: i64,

    /// Check interval for expired transactions (in ms)
    pub timeout_check_interval_ms: u64,

    /// First retry delay for participant outcome notifications (in ms)
    pub notify_min_backoff_ms: u64,

    /// Retry delay ceiling for participant outcome notifications (in ms)
    pub notify_max_backoff_ms: u64,

    /// Minimum time between timer-driven buffer snapshots (in ms)
    pub snapshot_min_interval_ms: u64,

    /// Appended entries since the last snapshot that force a new one
    pub snapshot_max_entries: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            coordinator_partitions: DEFAULT_COORDINATOR_PARTITIONS,
            default_timeout_ms: DEFAULT_TRANSACTION_TIMEOUT_MS,
            min_timeout_ms: DEFAULT_MIN_TRANSACTION_TIMEOUT_MS,
            max_timeout_ms: DEFAULT_MAX_TRANSACTION_TIMEOUT_MS,
            timeout_check_interval_ms: DEFAULT_TIMEOUT_CHECK_INTERVAL_MS,
            notify_min_backoff_ms: DEFAULT_NOTIFY_MIN_BACKOFF_MS,
            notify_max_backoff_ms: DEFAULT_NOTIFY_MAX_BACKOFF_MS,
            snapshot_min_interval_ms: DEFAULT_SNAPSHOT_MIN_INTERVAL_MS,
            snapshot_max_entries: DEFAULT_SNAPSHOT_MAX_ENTRIES,
        }
    }
}

impl TransactionConfig {
    /// Clamp a requested timeout into the allowed range
    pub fn clamp_timeout_ms(&self, requested: Option<i64>) -> i64 {
        requested
            .unwrap_or(self.default_timeout_ms)
            .max(self.min_timeout_ms)
            .min(self.max_timeout_ms)
    }

    pub fn timeout_check_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_check_interval_ms)
    }

    pub fn snapshot_min_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_min_interval_ms)
    }

    pub fn notify_min_backoff(&self) -> Duration {
        Duration::from_millis(self.notify_min_backoff_ms)
    }

    pub fn notify_max_backoff(&self) -> Duration {
        Duration::from_millis(self.notify_max_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_clamping() {
        let config = TransactionConfig {
            min_timeout_ms: 10_000,
            max_timeout_ms: 60_000,
            ..Default::default()
        };

        assert_eq!(config.clamp_timeout_ms(Some(1_000)), 10_000);
        assert_eq!(config.clamp_timeout_ms(Some(600_000)), 60_000);
        assert_eq!(config.clamp_timeout_ms(Some(30_000)), 30_000);
        assert_eq!(config.clamp_timeout_ms(None), 60_000);
    }

    #[test]
    fn test_defaults() {
        let config = TransactionConfig::default();
        assert_eq!(config.coordinator_partitions, 1);
        assert_eq!(config.timeout_check_interval(), Duration::from_secs(1));
        assert!(config.notify_min_backoff() < config.notify_max_backoff());
    }
}
