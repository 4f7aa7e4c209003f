//! Error types for the transactional core
//!
//! This module defines the main error type used throughout the crate, the
//! structured error domains of the ledger and configuration layers, and the
//! mapping to broker error codes that clients use to decide whether to retry.

use thiserror::Error;

/// Result type alias for transactional core operations
pub type Result<T> = std::result::Result<T, StreamlineError>;

/// Broker error codes surfaced to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum ServerErrorCode {
    /// No error
    None = 0,
    /// Unknown server error
    UnknownError = 1,
    /// Error while persisting or reading data
    PersistenceError = 2,
    /// Topic not found
    TopicNotFound = 3,
    /// Resource already exists or was claimed concurrently
    Conflict = 4,
    /// Broker is shutting down or the resource is being unloaded
    ServiceNotReady = 5,
    /// Transaction coordinator not loaded or not recovered
    TransactionCoordinatorNotFound = 6,
    /// Operation not valid for the transaction's current status
    InvalidTxnStatus = 7,
    /// Transaction id unknown to the coordinator
    TransactionNotFound = 8,
    /// Two transactions claimed the same message
    TransactionConflict = 9,
    /// Invalid configuration
    InvalidConfig = 10,
    /// Corrupted data read back from a ledger
    ChecksumError = 11,
}

impl ServerErrorCode {
    /// Returns true if a client may retry the request as-is
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ServerErrorCode::PersistenceError
                | ServerErrorCode::ServiceNotReady
                | ServerErrorCode::TransactionCoordinatorNotFound
        )
    }

    /// Convert to the numeric code carried on the wire
    pub fn as_i16(&self) -> i16 {
        *self as i16
    }
}

/// Failures reported by the append-log collaborator
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The ledger was closed; no further appends are accepted
    #[error("managed ledger {name} is already closed")]
    AlreadyClosed { name: String },
    /// Another writer took ownership of the ledger
    #[error("managed ledger {name} is fenced")]
    Fenced { name: String },
    /// The ledger has no storage entry
    #[error("managed ledger {name} not found")]
    NotFound { name: String },
    /// Stored bytes failed validation
    #[error("managed ledger {name} is corrupted: {detail}")]
    Corrupted { name: String, detail: String },
    /// Underlying storage I/O failed
    #[error("managed ledger {name}: {operation}: {detail}")]
    Io {
        name: String,
        operation: String,
        detail: String,
    },
}

impl LedgerError {
    pub fn closed(name: impl Into<String>) -> Self {
        Self::AlreadyClosed { name: name.into() }
    }

    pub fn io(name: impl Into<String>, operation: &str, detail: impl ToString) -> Self {
        Self::Io {
            name: name.into(),
            operation: operation.to_string(),
            detail: detail.to_string(),
        }
    }

    pub fn corrupted(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Corrupted {
            name: name.into(),
            detail: detail.into(),
        }
    }

    /// Returns true for the closed-ledger signal
    pub fn is_closed(&self) -> bool {
        matches!(self, LedgerError::AlreadyClosed { .. })
    }
}

/// Structured configuration error domain
#[derive(Debug, Error, Clone)]
pub enum ConfigError {
    #[error("{setting}: {reason}")]
    InvalidSetting { setting: String, reason: String },
    #[error("failed to read {path}: {reason}")]
    Unreadable { path: String, reason: String },
    #[error("{0}")]
    Message(String),
}

impl ConfigError {
    pub fn invalid_setting(setting: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            setting: setting.into(),
            reason: reason.into(),
        }
    }
}

impl From<String> for ConfigError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

/// Main error type for the transactional core
#[derive(Error, Debug)]
pub enum StreamlineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Transaction coordinator {partition} unavailable: {reason}")]
    CoordinatorUnavailable { partition: u64, reason: String },

    #[error("Transaction {txn_id} is in {actual} status, expected {expected}")]
    InvalidTxnState {
        txn_id: String,
        expected: String,
        actual: String,
    },

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    #[error("Transaction buffer unavailable for {topic}")]
    BufferUnavailable {
        topic: String,
        #[source]
        source: LedgerError,
    },

    #[error("Pending ack store unavailable for {store}")]
    StoreUnavailable {
        store: String,
        #[source]
        source: LedgerError,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    #[error("Invalid topic name: {0}")]
    InvalidTopicName(String),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    #[error("Service not ready: {0}")]
    NotReady(String),

    #[error("Broker is shutting down")]
    ShuttingDown,
}

impl StreamlineError {
    /// Coordinator cannot serve the request (not loaded, recovering, or log write failed)
    pub fn coordinator_unavailable(partition: u64, reason: impl Into<String>) -> Self {
        StreamlineError::CoordinatorUnavailable {
            partition,
            reason: reason.into(),
        }
    }

    /// Operation attempted on a transaction in the wrong status
    pub fn invalid_txn_state(
        txn_id: impl ToString,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        StreamlineError::InvalidTxnState {
            txn_id: txn_id.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Wrap a ledger failure observed by a topic's transaction buffer
    pub fn buffer_unavailable(topic: impl Into<String>, source: LedgerError) -> Self {
        StreamlineError::BufferUnavailable {
            topic: topic.into(),
            source,
        }
    }

    /// Wrap a ledger failure observed by a pending-ack store
    pub fn store_unavailable(store: impl Into<String>, source: LedgerError) -> Self {
        StreamlineError::StoreUnavailable {
            store: store.into(),
            source,
        }
    }

    /// Create a corrupted data error with context
    pub fn corrupted(location: &str, detail: impl Into<String>) -> Self {
        StreamlineError::CorruptedData(format!("{}: {}", location, detail.into()))
    }

    /// The ledger failure this error wraps, if any
    pub fn ledger_cause(&self) -> Option<&LedgerError> {
        match self {
            StreamlineError::Ledger(e)
            | StreamlineError::BufferUnavailable { source: e, .. }
            | StreamlineError::StoreUnavailable { source: e, .. } => Some(e),
            _ => None,
        }
    }

    /// Returns true when the root cause is an already-closed ledger
    pub fn is_ledger_closed(&self) -> bool {
        self.ledger_cause().is_some_and(LedgerError::is_closed)
    }

    /// Convert this error to the error code reported to clients
    pub fn error_code(&self) -> ServerErrorCode {
        match self {
            StreamlineError::Io(_) | StreamlineError::Ledger(_) => {
                ServerErrorCode::PersistenceError
            }
            StreamlineError::Serialization(_) => ServerErrorCode::UnknownError,
            StreamlineError::Config(_) => ServerErrorCode::InvalidConfig,
            StreamlineError::CoordinatorUnavailable { .. } => {
                ServerErrorCode::TransactionCoordinatorNotFound
            }
            StreamlineError::InvalidTxnState { .. } => ServerErrorCode::InvalidTxnStatus,
            StreamlineError::TransactionNotFound(_) => ServerErrorCode::TransactionNotFound,
            StreamlineError::TransactionConflict(_) => ServerErrorCode::TransactionConflict,
            StreamlineError::BufferUnavailable { .. } | StreamlineError::StoreUnavailable { .. } => {
                ServerErrorCode::PersistenceError
            }
            StreamlineError::Conflict(_) => ServerErrorCode::Conflict,
            StreamlineError::TopicNotFound(_) | StreamlineError::InvalidTopicName(_) => {
                ServerErrorCode::TopicNotFound
            }
            StreamlineError::CorruptedData(_) => ServerErrorCode::ChecksumError,
            StreamlineError::NotReady(_) | StreamlineError::ShuttingDown => {
                ServerErrorCode::ServiceNotReady
            }
        }
    }

    /// Returns true if this error is retriable by clients
    ///
    /// A closed ledger is never retriable against the same instance: the
    /// topic has to be reloaded first.
    pub fn is_retriable(&self) -> bool {
        !self.is_ledger_closed() && self.error_code().is_retriable()
    }
}

impl From<&StreamlineError> for i16 {
    fn from(err: &StreamlineError) -> i16 {
        err.error_code().as_i16()
    }
}
