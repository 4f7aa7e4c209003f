//! Storage layer
//!
//! Managed ledgers are the only persistence primitive of the transactional
//! core. Topics, the transaction log, pending-ack stores and buffer
//! snapshots are all ledgers addressed by name.
//!
//! - `ledger` - Positions, the ledger traits and the batched reader
//! - `memory` - Process-local ledgers for tests and embedded use
//! - `file` - CRC-framed segment files under the data directory
//! - `policies` - Retention policies keyed by logical name

pub mod file;
pub mod ledger;
pub mod memory;
pub mod policies;

pub use file::FileLedgerFactory;
pub use ledger::{
    LedgerConfig, LedgerEntry, LedgerReader, ManagedLedger, ManagedLedgerFactory, Position,
};
pub use memory::MemoryLedgerFactory;
pub use policies::{RetentionPolicy, TopicPolicies};

use std::sync::Arc;

use crate::config::StorageConfig;
use crate::error::Result;

/// Build the ledger factory selected by the storage configuration
pub fn create_ledger_factory(config: &StorageConfig) -> Result<Arc<dyn ManagedLedgerFactory>> {
    if config.in_memory {
        return Ok(Arc::new(MemoryLedgerFactory::new()));
    }
    let factory = FileLedgerFactory::new(&config.data_dir, config.sync_every_write())?;
    Ok(Arc::new(factory))
}
