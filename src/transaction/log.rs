//! Transaction log for coordinator recovery
//!
//! Every coordinator partition owns one managed ledger. Each state change of
//! a transaction is appended as a JSON entry before it takes effect in
//! memory, so replaying the ledger from the start rebuilds every transaction
//! that had not finished when the coordinator went away.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::id::TxnId;
use super::state::{TxnMeta, TxnParticipant, TxnStatus};
use crate::error::{Result, StreamlineError};
use crate::storage::{LedgerReader, ManagedLedger, Position};

/// Entry types in the transaction log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransactionLogEntry {
    /// Transaction opened
    New {
        txn_id: TxnId,
        timeout_ms: i64,
        opened_at_ms: i64,
        owner: Option<String>,
    },
    /// Topic or subscription joined the transaction
    AddParticipant {
        txn_id: TxnId,
        participant: TxnParticipant,
    },
    /// Status moved forward
    StatusChange { txn_id: TxnId, status: TxnStatus },
}

impl TransactionLogEntry {
    pub fn txn_id(&self) -> TxnId {
        match self {
            TransactionLogEntry::New { txn_id, .. }
            | TransactionLogEntry::AddParticipant { txn_id, .. }
            | TransactionLogEntry::StatusChange { txn_id, .. } => *txn_id,
        }
    }
}

/// Result of replaying a transaction log
#[derive(Debug, Default)]
pub struct RecoveredTransactions {
    /// Transactions that were not finished, ordered by id
    pub active: Vec<TxnMeta>,
    /// Highest sequence number ever allocated, finished or not
    pub highest_sequence: Option<u64>,
    /// Number of entries replayed
    pub entries_replayed: u64,
}

impl RecoveredTransactions {
    /// Sequence the next allocation must use
    pub fn next_sequence(&self) -> u64 {
        self.highest_sequence.map_or(0, |s| s + 1)
    }
}

/// Durable log of one coordinator partition
pub struct TransactionLogStore {
    partition: u64,
    ledger: Arc<dyn ManagedLedger>,
    replay_batch_size: usize,
}

impl TransactionLogStore {
    pub fn new(partition: u64, ledger: Arc<dyn ManagedLedger>, replay_batch_size: usize) -> Self {
        Self {
            partition,
            ledger,
            replay_batch_size,
        }
    }

    pub fn partition(&self) -> u64 {
        self.partition
    }

    pub fn ledger(&self) -> &Arc<dyn ManagedLedger> {
        &self.ledger
    }

    /// Append an entry; the entry is durable once this returns
    pub async fn append(&self, entry: &TransactionLogEntry) -> Result<Position> {
        let data = serde_json::to_vec(entry)?;
        let position = self.ledger.append(Bytes::from(data)).await?;
        debug!(
            partition = self.partition,
            txn_id = %entry.txn_id(),
            position = %position,
            "Appended transaction log entry"
        );
        Ok(position)
    }

    /// Rebuild transaction state from the whole log
    ///
    /// An entry that cannot be decoded aborts recovery.
    pub async fn replay(&self) -> Result<RecoveredTransactions> {
        let mut reader = LedgerReader::from_start(self.ledger.clone(), self.replay_batch_size);
        let mut active: BTreeMap<TxnId, TxnMeta> = BTreeMap::new();
        let mut highest: Option<u64> = None;
        let mut replayed = 0u64;

        while let Some(batch) = reader.next_batch().await? {
            for entry in batch {
                let decoded: TransactionLogEntry =
                    serde_json::from_slice(&entry.data).map_err(|e| {
                        StreamlineError::corrupted(
                            &format!("{}@{}", self.ledger.name(), entry.position),
                            e.to_string(),
                        )
                    })?;
                replayed += 1;
                let txn_id = decoded.txn_id();
                highest = Some(highest.map_or(txn_id.sequence(), |h| h.max(txn_id.sequence())));
                apply(&mut active, decoded);
            }
        }

        info!(
            partition = self.partition,
            entries = replayed,
            active = active.len(),
            highest_sequence = ?highest,
            "Transaction log replayed"
        );

        Ok(RecoveredTransactions {
            active: active.into_values().collect(),
            highest_sequence: highest,
            entries_replayed: replayed,
        })
    }

    pub async fn close(&self) -> Result<()> {
        self.ledger.close().await?;
        Ok(())
    }
}

fn apply(active: &mut BTreeMap<TxnId, TxnMeta>, entry: TransactionLogEntry) {
    match entry {
        TransactionLogEntry::New {
            txn_id,
            timeout_ms,
            opened_at_ms,
            owner,
        } => {
            active.insert(
                txn_id,
                TxnMeta::new(txn_id, timeout_ms, opened_at_ms, owner),
            );
        }
        TransactionLogEntry::AddParticipant {
            txn_id,
            participant,
        } => match active.get_mut(&txn_id) {
            Some(meta) => {
                meta.add_participant(&participant);
            }
            None => warn!(txn_id = %txn_id, "Participant logged for unknown transaction"),
        },
        TransactionLogEntry::StatusChange { txn_id, status } => {
            if status.is_terminal() {
                active.remove(&txn_id);
            } else if let Some(meta) = active.get_mut(&txn_id) {
                meta.status = status;
            } else {
                warn!(txn_id = %txn_id, status = %status, "Status logged for unknown transaction");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LedgerConfig, ManagedLedgerFactory, MemoryLedgerFactory};

    async fn store(factory: &MemoryLedgerFactory) -> TransactionLogStore {
        let ledger = factory
            .open(
                "pulsar/system/persistent/__transaction_log_0",
                LedgerConfig::standalone("persistent://pulsar/system/__transaction_log_0"),
            )
            .await
            .unwrap();
        TransactionLogStore::new(0, ledger, 2)
    }

    fn new_entry(seq: u64) -> TransactionLogEntry {
        TransactionLogEntry::New {
            txn_id: TxnId::new(0, seq),
            timeout_ms: 10_000,
            opened_at_ms: 1,
            owner: None,
        }
    }

    #[tokio::test]
    async fn test_replay_keeps_unfinished_transactions() {
        let factory = MemoryLedgerFactory::new();
        let log = store(&factory).await;

        log.append(&new_entry(0)).await.unwrap();
        log.append(&new_entry(1)).await.unwrap();
        log.append(&new_entry(2)).await.unwrap();
        log.append(&TransactionLogEntry::AddParticipant {
            txn_id: TxnId::new(0, 1),
            participant: TxnParticipant::topic("persistent://a/b/t"),
        })
        .await
        .unwrap();
        for status in [TxnStatus::Aborting, TxnStatus::Aborted] {
            log.append(&TransactionLogEntry::StatusChange {
                txn_id: TxnId::new(0, 2),
                status,
            })
            .await
            .unwrap();
        }
        log.append(&TransactionLogEntry::StatusChange {
            txn_id: TxnId::new(0, 1),
            status: TxnStatus::Committing,
        })
        .await
        .unwrap();
        log.close().await.unwrap();

        let log = store(&factory).await;
        let recovered = log.replay().await.unwrap();
        assert_eq!(recovered.entries_replayed, 7);
        assert_eq!(recovered.highest_sequence, Some(2));
        assert_eq!(recovered.next_sequence(), 3);

        let ids: Vec<_> = recovered.active.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![TxnId::new(0, 0), TxnId::new(0, 1)]);
        assert_eq!(recovered.active[1].status, TxnStatus::Committing);
        assert!(recovered.active[1]
            .has_participant(&TxnParticipant::topic("persistent://a/b/t")));
    }

    #[tokio::test]
    async fn test_empty_log() {
        let factory = MemoryLedgerFactory::new();
        let recovered = store(&factory).await.replay().await.unwrap();
        assert!(recovered.active.is_empty());
        assert_eq!(recovered.next_sequence(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_entry_fails_replay() {
        let factory = MemoryLedgerFactory::new();
        let log = store(&factory).await;
        log.append(&new_entry(0)).await.unwrap();
        log.ledger()
            .append(Bytes::from_static(b"not json"))
            .await
            .unwrap();

        let err = log.replay().await.unwrap_err();
        assert!(matches!(err, StreamlineError::CorruptedData(_)));
    }

    #[tokio::test]
    async fn test_closed_log_rejects_appends() {
        let factory = MemoryLedgerFactory::new();
        let log = store(&factory).await;
        log.close().await.unwrap();
        let err = log.append(&new_entry(0)).await.unwrap_err();
        assert!(err.is_ledger_closed());
    }
}
