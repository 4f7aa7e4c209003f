//! Transaction coordination
//!
//! - `id` - Transaction ids
//! - `state` - Status machine, participants and per-transaction metadata
//! - `log` - Durable transaction log and its replay
//! - `coordinator` - One coordinator partition
//! - `registry` - Loaded coordinator partitions of a broker

pub mod coordinator;
pub mod id;
pub mod log;
pub mod registry;
pub mod state;

pub use coordinator::{
    TransactionCoordinator, TransactionCoordinatorStats, TransactionOutcomeHandler,
};
pub use id::TxnId;
pub use log::{RecoveredTransactions, TransactionLogEntry, TransactionLogStore};
pub use registry::TransactionMetadataStoreService;
pub use state::{TxnAction, TxnMeta, TxnParticipant, TxnStatus};
