//! Storage configuration for the managed ledgers backing every store

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::defaults::{
    DEFAULT_DATA_DIR, DEFAULT_LEDGER_SYNC_MODE, DEFAULT_REPLAY_BATCH_SIZE,
    DEFAULT_RETENTION_SIZE_MB, DEFAULT_RETENTION_TIME_MINUTES,
};
use crate::storage::RetentionPolicy;

/// Managed ledger storage configuration
///
/// | Field | Default | Description |
/// |-------|---------|-------------|
/// | `data_dir` | `./data` | Root directory for file-backed ledgers |
/// | `in_memory` | `false` | Keep ledgers in process memory only |
/// | `sync_mode` | `every_write` | `every_write` fsyncs each append, `os_default` leaves it to the OS |
/// | `replay_batch_size` | `100` | Entries read per batch while recovering |
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for file-backed ledgers
    pub data_dir: PathBuf,

    /// Keep all ledgers in memory (tests, development)
    pub in_memory: bool,

    /// Sync mode: "every_write" or "os_default"
    pub sync_mode: String,

    /// Entries fetched per read batch during recovery replay
    pub replay_batch_size: usize,

    /// Retention applied to a logical name that has no explicit policy
    pub default_retention_time_minutes: i64,

    /// Retention size applied to a logical name that has no explicit policy
    pub default_retention_size_mb: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            in_memory: false,
            sync_mode: DEFAULT_LEDGER_SYNC_MODE.to_string(),
            replay_batch_size: DEFAULT_REPLAY_BATCH_SIZE,
            default_retention_time_minutes: DEFAULT_RETENTION_TIME_MINUTES,
            default_retention_size_mb: DEFAULT_RETENTION_SIZE_MB,
        }
    }
}

impl StorageConfig {
    /// In-memory storage, used by tests and embedded setups
    pub fn in_memory() -> Self {
        Self {
            in_memory: true,
            ..Self::default()
        }
    }

    /// File-backed storage rooted at `data_dir`
    pub fn on_disk(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Whether every append is fsynced before it is acknowledged
    pub fn sync_every_write(&self) -> bool {
        self.sync_mode == "every_write"
    }

    /// Broker-wide fallback retention
    pub fn default_retention(&self) -> RetentionPolicy {
        RetentionPolicy::new(
            self.default_retention_time_minutes,
            self.default_retention_size_mb,
        )
    }
}
