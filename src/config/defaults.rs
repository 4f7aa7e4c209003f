//! Default constants for broker configuration
//!
//! These constants define the default values used throughout the configuration
//! system when no explicit value is provided.

/// Default data directory
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Default log level
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default log filter when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "info,streamline_txn=debug";

/// Default ledger sync mode ("every_write" or "os_default")
pub const DEFAULT_LEDGER_SYNC_MODE: &str = "every_write";

/// Default number of transaction coordinator partitions
pub const DEFAULT_COORDINATOR_PARTITIONS: u64 = 1;

/// Default transaction timeout in milliseconds (1 minute)
pub const DEFAULT_TRANSACTION_TIMEOUT_MS: i64 = 60_000;

/// Minimum transaction timeout that can be requested (in ms)
pub const DEFAULT_MIN_TRANSACTION_TIMEOUT_MS: i64 = 1_000;

/// Maximum transaction timeout that can be requested (in ms, 15 minutes)
pub const DEFAULT_MAX_TRANSACTION_TIMEOUT_MS: i64 = 900_000;

/// Interval between transaction timeout sweeps (in ms)
pub const DEFAULT_TIMEOUT_CHECK_INTERVAL_MS: u64 = 1_000;

/// First delay when retrying an outcome notification (in ms)
pub const DEFAULT_NOTIFY_MIN_BACKOFF_MS: u64 = 50;

/// Ceiling for the outcome notification backoff (in ms)
pub const DEFAULT_NOTIFY_MAX_BACKOFF_MS: u64 = 30_000;

/// Minimum time between two timer-driven buffer snapshots (in ms)
pub const DEFAULT_SNAPSHOT_MIN_INTERVAL_MS: u64 = 5_000;

/// Entries appended since the last snapshot that force a new one
pub const DEFAULT_SNAPSHOT_MAX_ENTRIES: u64 = 1_000;

/// Default retention time for internal stores (minutes, -1 = infinite)
pub const DEFAULT_RETENTION_TIME_MINUTES: i64 = 0;

/// Default retention size for internal stores (MB, -1 = infinite)
pub const DEFAULT_RETENTION_SIZE_MB: i64 = 0;

/// Entries fetched per read batch during recovery replay
pub const DEFAULT_REPLAY_BATCH_SIZE: usize = 100;
