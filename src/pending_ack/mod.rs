//! Pending acknowledgments
//!
//! - `store` - Ledger-backed log of transactional acks
//! - `handle` - In-memory pending set, conflict checks and cursor updates

pub mod handle;
pub mod store;

pub use handle::{PendingAckHandle, PendingAckHandleState};
pub use store::{AckKind, PendingAckLogEntry, PendingAckStore};
