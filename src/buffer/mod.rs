//! Transaction buffer
//!
//! - `envelope` - Binary framing of topic ledger entries and markers
//! - `snapshot` - Per-namespace snapshot ledger
//! - `topic_buffer` - Visibility of transactional messages on one topic

pub mod envelope;
pub mod snapshot;
pub mod topic_buffer;

pub use envelope::{EntryKind, MessageEnvelope};
pub use snapshot::{AbortTxnMetadata, TransactionBufferSnapshot, TransactionBufferSnapshotStore};
pub use topic_buffer::{CommittedEntry, TopicTransactionBuffer, TransactionBufferStats};
