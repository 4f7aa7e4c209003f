//! Pending acknowledgments of one subscription
//!
//! A transactional ack is logged and kept aside until the transaction ends.
//! Commit applies it to the subscription cursor; abort drops it and the
//! messages stay eligible for redelivery. While an ack is pending no other
//! transaction may claim the same messages and no plain ack may move the
//! cursor over them.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

#[cfg(feature = "metrics")]
use metrics::counter;

use super::store::{AckKind, PendingAckLogEntry, PendingAckStore};
use crate::error::{LedgerError, Result, StreamlineError};
use crate::storage::{Position, RetentionPolicy};
use crate::topic::SubscriptionCursor;
use crate::transaction::TxnId;

/// Lifecycle of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAckHandleState {
    /// Replaying the log; commands are not accepted yet
    Initializing,
    Ready,
    Closed,
}

impl fmt::Display for PendingAckHandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PendingAckHandleState::Initializing => write!(f, "Initializing"),
            PendingAckHandleState::Ready => write!(f, "Ready"),
            PendingAckHandleState::Closed => write!(f, "Closed"),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct TxnAcks {
    individual: BTreeSet<Position>,
    cumulative: Option<Position>,
}

#[derive(Debug, Default)]
struct AckState {
    txns: BTreeMap<TxnId, TxnAcks>,
    /// Owner of every individually acked position
    individual: BTreeMap<Position, TxnId>,
    cumulative: Option<(TxnId, Position)>,
}

impl AckState {
    fn insert(&mut self, txn_id: TxnId, kind: AckKind, positions: &[Position]) {
        let acks = self.txns.entry(txn_id).or_default();
        match kind {
            AckKind::Individual => {
                for p in positions {
                    acks.individual.insert(*p);
                    self.individual.insert(*p, txn_id);
                }
            }
            AckKind::Cumulative => {
                if let Some(p) = positions.iter().max().copied() {
                    let mark = acks.cumulative.map_or(p, |c| c.max(p));
                    acks.cumulative = Some(mark);
                    self.cumulative = Some((txn_id, mark));
                }
            }
        }
    }

    fn remove(&mut self, txn_id: TxnId) -> Option<TxnAcks> {
        let acks = self.txns.remove(&txn_id)?;
        for p in &acks.individual {
            self.individual.remove(p);
        }
        if self.cumulative.is_some_and(|(owner, _)| owner == txn_id) {
            self.cumulative = None;
        }
        Some(acks)
    }

    fn pending_below(&self, bound: Position, except: Option<TxnId>) -> Option<(Position, TxnId)> {
        self.individual
            .range(..=bound)
            .find(|(_, owner)| Some(**owner) != except)
            .map(|(p, owner)| (*p, *owner))
    }
}

fn conflict(message: String) -> StreamlineError {
    StreamlineError::TransactionConflict(message)
}

/// Pending-ack state of one (topic, subscription)
pub struct PendingAckHandle {
    topic: String,
    subscription: String,
    store: PendingAckStore,
    cursor: Arc<SubscriptionCursor>,
    /// Serializes log appends with the state changes they imply
    write_lock: AsyncMutex<()>,
    acks: Mutex<AckState>,
    state: RwLock<PendingAckHandleState>,
}

impl PendingAckHandle {
    /// Replay the store and return a ready handle
    pub async fn recover(
        topic: impl Into<String>,
        subscription: impl Into<String>,
        store: PendingAckStore,
        cursor: Arc<SubscriptionCursor>,
    ) -> Result<Arc<Self>> {
        let handle = Self {
            topic: topic.into(),
            subscription: subscription.into(),
            store,
            cursor,
            write_lock: AsyncMutex::new(()),
            acks: Mutex::new(AckState::default()),
            state: RwLock::new(PendingAckHandleState::Initializing),
        };

        let records = handle.store.replay().await?;
        let replayed = records.len();
        let mut committed = 0usize;
        {
            let mut acks = handle.acks.lock();
            for record in records {
                match record {
                    PendingAckLogEntry::Ack {
                        txn_id,
                        kind,
                        positions,
                    } => acks.insert(txn_id, kind, &positions),
                    PendingAckLogEntry::Commit { txn_id } => {
                        if let Some(done) = acks.remove(txn_id) {
                            handle.apply_to_cursor(&done);
                            committed += 1;
                        }
                    }
                    PendingAckLogEntry::Abort { txn_id } => {
                        acks.remove(txn_id);
                    }
                }
            }
        }
        *handle.state.write() = PendingAckHandleState::Ready;

        info!(
            topic = %handle.topic,
            subscription = %handle.subscription,
            replayed,
            committed,
            pending = handle.acks.lock().txns.len(),
            "Pending ack handle recovered"
        );
        Ok(Arc::new(handle))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn state(&self) -> PendingAckHandleState {
        *self.state.read()
    }

    pub fn store(&self) -> &PendingAckStore {
        &self.store
    }

    /// Retention of the underlying store, resolved live
    pub fn retention(&self) -> RetentionPolicy {
        self.store.retention()
    }

    /// Transactions with pending acks, in id order
    pub fn pending_transactions(&self) -> Vec<TxnId> {
        self.acks.lock().txns.keys().copied().collect()
    }

    /// Whether a transaction holds a pending ack on `position`
    pub fn is_pending(&self, position: Position) -> bool {
        let acks = self.acks.lock();
        acks.individual.contains_key(&position)
            || acks.cumulative.is_some_and(|(_, mark)| position <= mark)
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state() {
            PendingAckHandleState::Ready => Ok(()),
            PendingAckHandleState::Initializing => Err(StreamlineError::NotReady(format!(
                "pending ack store {} is initializing",
                self.store.name()
            ))),
            PendingAckHandleState::Closed => Err(StreamlineError::store_unavailable(
                self.store.name(),
                LedgerError::closed(self.store.ledger().name()),
            )),
        }
    }

    fn check_txn_ack(
        &self,
        acks: &AckState,
        txn_id: TxnId,
        kind: AckKind,
        positions: &[Position],
    ) -> Result<()> {
        match kind {
            AckKind::Individual => {
                for p in positions {
                    if self.cursor.is_acknowledged(*p) {
                        return Err(conflict(format!(
                            "{} is already acknowledged on {}",
                            p, self.subscription
                        )));
                    }
                    if let Some(owner) = acks.individual.get(p).filter(|o| **o != txn_id) {
                        return Err(conflict(format!(
                            "{} is pending in transaction {}",
                            p, owner
                        )));
                    }
                    if let Some((owner, mark)) = acks.cumulative {
                        if owner != txn_id && *p <= mark {
                            return Err(conflict(format!(
                                "{} is covered by the cumulative ack of transaction {}",
                                p, owner
                            )));
                        }
                    }
                }
            }
            AckKind::Cumulative => {
                let Some(p) = positions.iter().max().copied() else {
                    return Ok(());
                };
                if p <= self.cursor.mark_delete_position() {
                    return Err(conflict(format!(
                        "{} is behind the mark-delete position of {}",
                        p, self.subscription
                    )));
                }
                if let Some((owner, _)) = acks.cumulative.filter(|(o, _)| *o != txn_id) {
                    return Err(conflict(format!(
                        "transaction {} holds a pending cumulative ack",
                        owner
                    )));
                }
                if let Some((pending, owner)) = acks.pending_below(p, Some(txn_id)) {
                    return Err(conflict(format!(
                        "{} is pending in transaction {}",
                        pending, owner
                    )));
                }
            }
        }
        Ok(())
    }

    /// Record an acknowledgment made inside `txn_id`
    pub async fn record_ack(
        &self,
        txn_id: TxnId,
        positions: Vec<Position>,
        kind: AckKind,
    ) -> Result<()> {
        self.ensure_ready()?;
        if positions.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        self.ensure_ready()?;
        {
            let acks = self.acks.lock();
            self.check_txn_ack(&acks, txn_id, kind, &positions)?;
        }

        let entry = PendingAckLogEntry::Ack {
            txn_id,
            kind,
            positions,
        };
        self.store.append(&entry).await?;
        if let PendingAckLogEntry::Ack { positions, .. } = &entry {
            self.acks.lock().insert(txn_id, kind, positions);
            debug!(
                subscription = %self.subscription,
                txn_id = %txn_id,
                kind = %kind,
                positions = positions.len(),
                "Pending ack recorded"
            );
        }
        Ok(())
    }

    /// Reject a plain ack that would move the cursor over a pending one
    pub fn check_non_txn_ack(&self, kind: AckKind, positions: &[Position]) -> Result<()> {
        let acks = self.acks.lock();
        match kind {
            AckKind::Individual => {
                for p in positions {
                    if let Some(owner) = acks.individual.get(p) {
                        return Err(conflict(format!(
                            "{} is pending in transaction {}",
                            p, owner
                        )));
                    }
                    if let Some((owner, mark)) = acks.cumulative {
                        if *p <= mark {
                            return Err(conflict(format!(
                                "{} is covered by the cumulative ack of transaction {}",
                                p, owner
                            )));
                        }
                    }
                }
            }
            AckKind::Cumulative => {
                let Some(p) = positions.iter().max().copied() else {
                    return Ok(());
                };
                if let Some((pending, owner)) = acks.pending_below(p, None) {
                    return Err(conflict(format!(
                        "{} is pending in transaction {}",
                        pending, owner
                    )));
                }
                if let Some((owner, mark)) = acks.cumulative {
                    if mark <= p {
                        return Err(conflict(format!(
                            "transaction {} holds a pending cumulative ack at {}",
                            owner, mark
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_to_cursor(&self, acks: &TxnAcks) {
        if let Some(mark) = acks.cumulative {
            self.cursor.acknowledge_cumulative(mark);
        }
        if !acks.individual.is_empty() {
            let positions: Vec<Position> = acks.individual.iter().copied().collect();
            self.cursor.acknowledge_individual(&positions);
        }
    }

    /// Apply the pending acks of `txn_id` to the cursor
    ///
    /// A transaction without pending acks on this subscription is ignored.
    pub async fn materialize_commit(&self, txn_id: TxnId) -> Result<()> {
        self.end(txn_id, true).await
    }

    /// Drop the pending acks of `txn_id`
    pub async fn materialize_abort(&self, txn_id: TxnId) -> Result<()> {
        self.end(txn_id, false).await
    }

    async fn end(&self, txn_id: TxnId, commit: bool) -> Result<()> {
        self.ensure_ready()?;
        let _guard = self.write_lock.lock().await;
        if !self.acks.lock().txns.contains_key(&txn_id) {
            return Ok(());
        }
        let entry = if commit {
            PendingAckLogEntry::Commit { txn_id }
        } else {
            PendingAckLogEntry::Abort { txn_id }
        };
        self.store.append(&entry).await?;

        let removed = self.acks.lock().remove(txn_id);
        if let Some(acks) = removed {
            if commit {
                self.apply_to_cursor(&acks);
                #[cfg(feature = "metrics")]
                counter!("streamline_pending_ack_committed_total").increment(1);
            } else {
                #[cfg(feature = "metrics")]
                counter!("streamline_pending_ack_aborted_total").increment(1);
            }
            debug!(
                subscription = %self.subscription,
                txn_id = %txn_id,
                commit,
                individual = acks.individual.len(),
                cumulative = acks.cumulative.is_some(),
                "Pending acks materialized"
            );
        }
        Ok(())
    }

    /// Stop accepting commands and close the store's ledger
    pub async fn close(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        {
            let mut state = self.state.write();
            if *state == PendingAckHandleState::Closed {
                return Ok(());
            }
            *state = PendingAckHandleState::Closed;
        }
        self.store.close().await?;
        debug!(
            topic = %self.topic,
            subscription = %self.subscription,
            "Pending ack handle closed"
        );
        Ok(())
    }
}
