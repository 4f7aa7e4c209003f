//! Durable log of transactional acknowledgments
//!
//! Every subscription that received a transactional ack owns one ledger named
//! after `TopicName::pending_ack_store`. Entries are JSON records; replaying
//! them in order yields the pending set and the acks already committed.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{Result, StreamlineError};
use crate::storage::{LedgerReader, ManagedLedger, Position, RetentionPolicy};
use crate::transaction::TxnId;

/// How an acknowledgment moves the cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckKind {
    /// Acknowledges exactly the given positions
    Individual,
    /// Acknowledges everything up to and including the position
    Cumulative,
}

impl fmt::Display for AckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckKind::Individual => write!(f, "individual"),
            AckKind::Cumulative => write!(f, "cumulative"),
        }
    }
}

/// Record of the pending-ack log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PendingAckLogEntry {
    Ack {
        txn_id: TxnId,
        kind: AckKind,
        positions: Vec<Position>,
    },
    Commit {
        txn_id: TxnId,
    },
    Abort {
        txn_id: TxnId,
    },
}

impl PendingAckLogEntry {
    pub fn txn_id(&self) -> TxnId {
        match self {
            PendingAckLogEntry::Ack { txn_id, .. }
            | PendingAckLogEntry::Commit { txn_id }
            | PendingAckLogEntry::Abort { txn_id } => *txn_id,
        }
    }
}

/// Ledger-backed pending-ack log of one subscription
#[derive(Debug)]
pub struct PendingAckStore {
    name: String,
    ledger: Arc<dyn ManagedLedger>,
    replay_batch_size: usize,
}

impl PendingAckStore {
    pub fn new(name: impl Into<String>, ledger: Arc<dyn ManagedLedger>, replay_batch_size: usize) -> Self {
        Self {
            name: name.into(),
            ledger,
            replay_batch_size,
        }
    }

    /// Logical name of the store
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ledger(&self) -> &Arc<dyn ManagedLedger> {
        &self.ledger
    }

    /// Retention currently configured for the store
    pub fn retention(&self) -> RetentionPolicy {
        self.ledger.config().retention()
    }

    pub async fn append(&self, entry: &PendingAckLogEntry) -> Result<Position> {
        let data = serde_json::to_vec(entry)?;
        self.ledger
            .append(Bytes::from(data))
            .await
            .map_err(|e| StreamlineError::store_unavailable(&self.name, e))
    }

    /// Read every record in log order
    pub async fn replay(&self) -> Result<Vec<PendingAckLogEntry>> {
        let mut entries = Vec::new();
        let mut reader = LedgerReader::from_start(self.ledger.clone(), self.replay_batch_size);
        while let Some(batch) = reader
            .next_batch()
            .await
            .map_err(|e| StreamlineError::store_unavailable(&self.name, e))?
        {
            for entry in batch {
                let record = serde_json::from_slice(&entry.data).map_err(|e| {
                    StreamlineError::corrupted(
                        &format!("{}@{}", self.name, entry.position),
                        e.to_string(),
                    )
                })?;
                entries.push(record);
            }
        }
        Ok(entries)
    }

    pub async fn close(&self) -> Result<()> {
        self.ledger
            .close()
            .await
            .map_err(|e| StreamlineError::store_unavailable(&self.name, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LedgerConfig, ManagedLedgerFactory, MemoryLedgerFactory};

    #[tokio::test]
    async fn test_append_and_replay() {
        let factory = MemoryLedgerFactory::new();
        let ledger = factory
            .open("tnx/ns1/persistent/t-sub__transaction_pending_ack", LedgerConfig::standalone("p"))
            .await
            .unwrap();
        let store = PendingAckStore::new("p", ledger, 2);

        let txn = TxnId::new(0, 3);
        let records = vec![
            PendingAckLogEntry::Ack {
                txn_id: txn,
                kind: AckKind::Individual,
                positions: vec![Position::new(0, 1), Position::new(0, 2)],
            },
            PendingAckLogEntry::Ack {
                txn_id: txn,
                kind: AckKind::Cumulative,
                positions: vec![Position::new(0, 4)],
            },
            PendingAckLogEntry::Commit { txn_id: txn },
        ];
        for r in &records {
            store.append(r).await.unwrap();
        }
        assert_eq!(store.replay().await.unwrap(), records);
    }

    #[tokio::test]
    async fn test_closed_ledger_is_store_unavailable() {
        let factory = MemoryLedgerFactory::new();
        let ledger = factory
            .open("x", LedgerConfig::standalone("x"))
            .await
            .unwrap();
        let store = PendingAckStore::new("x", ledger, 2);
        store.close().await.unwrap();

        let err = store
            .append(&PendingAckLogEntry::Abort {
                txn_id: TxnId::new(0, 0),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StreamlineError::StoreUnavailable { .. }));
        assert!(err.is_ledger_closed());
    }

    #[test]
    fn test_record_json_shape() {
        let json = serde_json::to_value(PendingAckLogEntry::Commit {
            txn_id: TxnId::new(1, 2),
        })
        .unwrap();
        assert_eq!(json["type"], "commit");
        assert_eq!(json["txn_id"]["least_sig_bits"], 2);
    }
}
