//! Transaction buffer snapshots
//!
//! Each namespace has one snapshot ledger shared by all its topics. A
//! snapshot records how far a topic's buffer had made entries visible and
//! which transactions were aborted, so that recovery only replays the tail of
//! the topic ledger. The most recent snapshot of a topic supersedes all
//! earlier ones.

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Result, StreamlineError};
use crate::naming::NamespaceName;
use crate::storage::{LedgerReader, ManagedLedger, Position};
use crate::transaction::TxnId;

/// Aborted transaction and the position of its abort marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortTxnMetadata {
    pub txn_id_most_bits: u64,
    pub txn_id_least_bits: u64,
    pub ledger_id: i64,
    pub entry_id: i64,
}

impl AbortTxnMetadata {
    pub fn new(txn_id: TxnId, position: Position) -> Self {
        Self {
            txn_id_most_bits: txn_id.most_sig_bits,
            txn_id_least_bits: txn_id.least_sig_bits,
            ledger_id: position.ledger_id,
            entry_id: position.entry_id,
        }
    }

    pub fn txn_id(&self) -> TxnId {
        TxnId::new(self.txn_id_most_bits, self.txn_id_least_bits)
    }

    pub fn position(&self) -> Position {
        Position::new(self.ledger_id, self.entry_id)
    }
}

/// Persisted state of one topic's transaction buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionBufferSnapshot {
    pub topic_name: String,
    /// Increases with every snapshot of the topic
    pub sequence_id: u64,
    pub max_read_position_ledger_id: i64,
    pub max_read_position_entry_id: i64,
    pub aborts: Vec<AbortTxnMetadata>,
}

impl TransactionBufferSnapshot {
    pub fn max_read_position(&self) -> Position {
        Position::new(
            self.max_read_position_ledger_id,
            self.max_read_position_entry_id,
        )
    }
}

/// Snapshot ledger of one namespace
pub struct TransactionBufferSnapshotStore {
    namespace: NamespaceName,
    ledger: Arc<dyn ManagedLedger>,
    latest: DashMap<String, TransactionBufferSnapshot>,
}

impl TransactionBufferSnapshotStore {
    /// Open the store and index the latest snapshot of every topic
    pub async fn open(
        namespace: NamespaceName,
        ledger: Arc<dyn ManagedLedger>,
        replay_batch_size: usize,
    ) -> Result<Self> {
        let latest: DashMap<String, TransactionBufferSnapshot> = DashMap::new();
        let mut reader = LedgerReader::from_start(ledger.clone(), replay_batch_size);
        let mut count = 0u64;
        while let Some(batch) = reader.next_batch().await? {
            for entry in batch {
                let snapshot: TransactionBufferSnapshot = serde_json::from_slice(&entry.data)
                    .map_err(|e| {
                        StreamlineError::corrupted(
                            &format!("{}@{}", ledger.name(), entry.position),
                            e.to_string(),
                        )
                    })?;
                count += 1;
                latest.insert(snapshot.topic_name.clone(), snapshot);
            }
        }
        info!(
            namespace = %namespace,
            snapshots = count,
            topics = latest.len(),
            "Transaction buffer snapshot store opened"
        );
        Ok(Self {
            namespace,
            ledger,
            latest,
        })
    }

    pub fn namespace(&self) -> &NamespaceName {
        &self.namespace
    }

    pub fn ledger(&self) -> &Arc<dyn ManagedLedger> {
        &self.ledger
    }

    /// Latest snapshot written for `topic`
    pub fn latest(&self, topic: &str) -> Option<TransactionBufferSnapshot> {
        self.latest.get(topic).map(|s| s.clone())
    }

    /// Persist a snapshot; it becomes the topic's latest once durable
    pub async fn write(&self, snapshot: TransactionBufferSnapshot) -> Result<Position> {
        let data = serde_json::to_vec(&snapshot)?;
        let position = self.ledger.append(Bytes::from(data)).await?;
        debug!(
            topic = %snapshot.topic_name,
            sequence_id = snapshot.sequence_id,
            max_read_position = %snapshot.max_read_position(),
            aborts = snapshot.aborts.len(),
            position = %position,
            "Transaction buffer snapshot written"
        );
        let mut current = self
            .latest
            .entry(snapshot.topic_name.clone())
            .or_insert_with(|| snapshot.clone());
        if current.sequence_id <= snapshot.sequence_id {
            *current = snapshot;
        }
        Ok(position)
    }

    /// Drop the in-memory index entry of a deleted topic
    pub fn forget(&self, topic: &str) {
        self.latest.remove(topic);
    }

    pub async fn close(&self) -> Result<()> {
        self.ledger.close().await?;
        Ok(())
    }
}
