//! Per-topic transaction buffer
//!
//! Transactional messages are appended to the topic ledger as soon as they
//! are published, tagged with their transaction id. The buffer keeps readers
//! from seeing them until the transaction commits:
//!
//! - `max_read_position` is the last position readers may consume. While no
//!   transaction is open on the topic it follows the ledger's last entry;
//!   otherwise it stops right before the first entry of the oldest open
//!   transaction.
//! - Commit and abort write a marker entry. A commit releases the
//!   transaction's entries; an abort turns them into holes and remembers the
//!   transaction as aborted.
//! - Recently committed transactions are remembered too, so an abort that
//!   arrives after the commit cannot hide entries readers already saw. The
//!   opposite outcome of an ended transaction is ignored.
//!
//! Recovery starts from the latest snapshot and replays only the entries
//! after its max read position.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, info, warn};

use super::envelope::{EntryKind, MessageEnvelope};
use super::snapshot::{AbortTxnMetadata, TransactionBufferSnapshot, TransactionBufferSnapshotStore};
use crate::config::TransactionConfig;
use crate::error::{LedgerError, Result, StreamlineError};
use crate::naming::TopicName;
use crate::storage::{LedgerReader, ManagedLedger, Position};
use crate::transaction::{TxnId, TxnStatus};

/// Upper bound on remembered committed transactions
const MAX_COMMITTED_TRACKED: usize = 10_000;

/// Entry handed to readers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedEntry {
    pub position: Position,
    pub txn_id: Option<TxnId>,
    pub payload: Bytes,
}

/// Entries of one transaction that has not ended
#[derive(Debug, Clone)]
struct OngoingTxn {
    /// Last ledger entry before the transaction's first one
    before_first: Position,
    positions: Vec<Position>,
}

#[derive(Debug)]
struct BufferState {
    ongoing: BTreeMap<TxnId, OngoingTxn>,
    aborted: BTreeMap<TxnId, Position>,
    committed: BTreeMap<TxnId, Position>,
    max_read_position: Position,
    snapshot_sequence: u64,
    entries_since_snapshot: u64,
    dirty: bool,
}

impl BufferState {
    fn update_max_read_position(&mut self, last_confirmed: Position) {
        self.max_read_position = self
            .ongoing
            .values()
            .map(|t| t.before_first)
            .min()
            .unwrap_or(last_confirmed);
    }

    fn touch(&mut self) {
        self.entries_since_snapshot += 1;
        self.dirty = true;
    }

    fn record_committed(&mut self, txn_id: TxnId, position: Position) {
        self.committed.insert(txn_id, position);
        while self.committed.len() > MAX_COMMITTED_TRACKED {
            self.committed.pop_first();
        }
    }

    /// Final status of `txn_id` if the buffer knows it ended
    fn ended_status(&self, txn_id: TxnId) -> Option<TxnStatus> {
        if self.aborted.contains_key(&txn_id) {
            Some(TxnStatus::Aborted)
        } else if self.committed.contains_key(&txn_id) {
            Some(TxnStatus::Committed)
        } else {
            None
        }
    }

    fn apply_replayed(&mut self, position: Position, envelope: &MessageEnvelope, previous: Position) {
        let Some(txn_id) = envelope.txn_id else {
            return;
        };
        match envelope.kind {
            EntryKind::Data => {
                if self.ended_status(txn_id).is_none() {
                    self.ongoing
                        .entry(txn_id)
                        .or_insert_with(|| OngoingTxn {
                            before_first: previous,
                            positions: Vec::new(),
                        })
                        .positions
                        .push(position);
                }
            }
            EntryKind::CommitMarker => {
                if !self.aborted.contains_key(&txn_id) {
                    self.ongoing.remove(&txn_id);
                    self.record_committed(txn_id, position);
                }
            }
            EntryKind::AbortMarker => {
                if !self.committed.contains_key(&txn_id) {
                    self.ongoing.remove(&txn_id);
                    self.aborted.insert(txn_id, position);
                }
            }
        }
    }
}

/// Point-in-time view of a buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionBufferStats {
    pub ongoing_txns: usize,
    pub aborted_txns: usize,
    pub max_read_position: Position,
    pub snapshot_sequence: u64,
}

/// Transaction buffer of one topic
pub struct TopicTransactionBuffer {
    topic: TopicName,
    ledger: Arc<dyn ManagedLedger>,
    snapshots: Arc<TransactionBufferSnapshotStore>,
    config: TransactionConfig,
    replay_batch_size: usize,

    /// Serializes ledger appends with the state changes they imply
    write_lock: AsyncMutex<()>,
    state: Mutex<BufferState>,

    closed: AtomicBool,
    close_notify: Arc<Notify>,
    snapshots_taken: AtomicU64,
}

impl TopicTransactionBuffer {
    /// Rebuild the buffer from its latest snapshot plus the ledger tail
    pub async fn recover(
        topic: TopicName,
        ledger: Arc<dyn ManagedLedger>,
        snapshots: Arc<TransactionBufferSnapshotStore>,
        config: TransactionConfig,
        replay_batch_size: usize,
    ) -> Result<Arc<Self>> {
        let topic_name = topic.to_string();
        let last_confirmed = ledger.last_confirmed_position();
        let snapshot = snapshots.latest(&topic_name).filter(|s| {
            // Left behind by an earlier ledger of the same name
            let stale = s.max_read_position() > last_confirmed;
            if stale {
                warn!(
                    topic = %topic,
                    snapshot_position = %s.max_read_position(),
                    last_confirmed = %last_confirmed,
                    "Ignoring snapshot beyond the end of the topic ledger"
                );
            }
            !stale
        });

        let mut state = BufferState {
            ongoing: BTreeMap::new(),
            aborted: BTreeMap::new(),
            committed: BTreeMap::new(),
            max_read_position: Position::EARLIEST,
            snapshot_sequence: 0,
            entries_since_snapshot: 0,
            dirty: false,
        };
        let start = match &snapshot {
            Some(s) => {
                state.aborted = s.aborts.iter().map(|a| (a.txn_id(), a.position())).collect();
                state.snapshot_sequence = s.sequence_id + 1;
                s.max_read_position().next()
            }
            None => Position::EARLIEST,
        };
        let mut previous = snapshot
            .as_ref()
            .map_or(Position::EARLIEST, |s| s.max_read_position());

        let mut reader = LedgerReader::new(ledger.clone(), start, replay_batch_size);
        let mut replayed = 0u64;
        while let Some(batch) = reader
            .next_batch()
            .await
            .map_err(|e| StreamlineError::buffer_unavailable(&topic_name, e))?
        {
            for entry in batch {
                let envelope = MessageEnvelope::decode(entry.data)?;
                state.apply_replayed(entry.position, &envelope, previous);
                previous = entry.position;
                replayed += 1;
            }
        }
        state.update_max_read_position(ledger.last_confirmed_position());

        info!(
            topic = %topic,
            from_snapshot = snapshot.is_some(),
            replayed,
            ongoing = state.ongoing.len(),
            aborted = state.aborted.len(),
            max_read_position = %state.max_read_position,
            "Transaction buffer recovered"
        );

        let buffer = Arc::new(Self {
            topic,
            ledger,
            snapshots,
            config,
            replay_batch_size,
            write_lock: AsyncMutex::new(()),
            state: Mutex::new(state),
            closed: AtomicBool::new(false),
            close_notify: Arc::new(Notify::new()),
            snapshots_taken: AtomicU64::new(0),
        });
        buffer.start_snapshot_timer();
        Ok(buffer)
    }

    pub fn topic(&self) -> &TopicName {
        &self.topic
    }

    pub fn ledger(&self) -> &Arc<dyn ManagedLedger> {
        &self.ledger
    }

    pub fn max_read_position(&self) -> Position {
        self.state.lock().max_read_position
    }

    pub fn is_aborted(&self, txn_id: TxnId) -> bool {
        self.state.lock().aborted.contains_key(&txn_id)
    }

    pub fn is_committed(&self, txn_id: TxnId) -> bool {
        self.state.lock().committed.contains_key(&txn_id)
    }

    pub fn is_ongoing(&self, txn_id: TxnId) -> bool {
        self.state.lock().ongoing.contains_key(&txn_id)
    }

    pub fn stats(&self) -> TransactionBufferStats {
        let state = self.state.lock();
        TransactionBufferStats {
            ongoing_txns: state.ongoing.len(),
            aborted_txns: state.aborted.len(),
            max_read_position: state.max_read_position,
            snapshot_sequence: state.snapshot_sequence,
        }
    }

    pub fn snapshots_taken(&self) -> u64 {
        self.snapshots_taken.load(Ordering::Relaxed)
    }

    fn unavailable(&self, error: LedgerError) -> StreamlineError {
        StreamlineError::buffer_unavailable(self.topic.to_string(), error)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(self.unavailable(LedgerError::closed(self.ledger.name())));
        }
        Ok(())
    }

    /// Append an ordinary message
    pub async fn append_normal(&self, payload: Bytes) -> Result<Position> {
        self.ensure_open()?;
        let should_snapshot = {
            let _guard = self.write_lock.lock().await;
            let position = self
                .ledger
                .append(MessageEnvelope::data(payload).encode())
                .await
                .map_err(|e| self.unavailable(e))?;
            let mut state = self.state.lock();
            state.update_max_read_position(position);
            state.touch();
            (position, self.snapshot_due(&state))
        };
        self.maybe_snapshot(should_snapshot.1).await;
        Ok(should_snapshot.0)
    }

    /// Append a message that stays hidden until `txn_id` commits
    pub async fn append_pending(&self, txn_id: TxnId, payload: Bytes) -> Result<Position> {
        self.ensure_open()?;
        let (position, due) = {
            let _guard = self.write_lock.lock().await;
            let ended = self.state.lock().ended_status(txn_id);
            if let Some(status) = ended {
                return Err(StreamlineError::invalid_txn_state(
                    txn_id,
                    TxnStatus::Open,
                    status,
                ));
            }
            let before = self.ledger.last_confirmed_position();
            let position = self
                .ledger
                .append(MessageEnvelope::txn_data(txn_id, payload).encode())
                .await
                .map_err(|e| self.unavailable(e))?;
            let mut state = self.state.lock();
            state
                .ongoing
                .entry(txn_id)
                .or_insert_with(|| OngoingTxn {
                    before_first: before,
                    positions: Vec::new(),
                })
                .positions
                .push(position);
            state.update_max_read_position(position);
            state.touch();
            (position, self.snapshot_due(&state))
        };
        debug!(topic = %self.topic, txn_id = %txn_id, position = %position, "Appended pending entry");
        self.maybe_snapshot(due).await;
        Ok(position)
    }

    /// Make the entries of `txn_id` visible
    ///
    /// Committing a transaction the buffer has no pending entries for writes
    /// nothing, which makes repeated deliveries harmless. A commit after an
    /// abort of the same transaction is ignored.
    pub async fn materialize_commit(&self, txn_id: TxnId) -> Result<()> {
        self.ensure_open()?;
        let due = {
            let _guard = self.write_lock.lock().await;
            {
                let mut state = self.state.lock();
                if state.aborted.contains_key(&txn_id) {
                    warn!(topic = %self.topic, txn_id = %txn_id, "Commit after abort ignored");
                    return Ok(());
                }
                if !state.ongoing.contains_key(&txn_id) {
                    if !state.committed.contains_key(&txn_id) {
                        let last = self.ledger.last_confirmed_position();
                        state.record_committed(txn_id, last);
                    }
                    debug!(topic = %self.topic, txn_id = %txn_id, "Commit without pending entries");
                    return Ok(());
                }
            }
            let position = self
                .ledger
                .append(MessageEnvelope::commit_marker(txn_id).encode())
                .await
                .map_err(|e| self.unavailable(e))?;
            let mut state = self.state.lock();
            let entries = state.ongoing.remove(&txn_id).map_or(0, |t| t.positions.len());
            state.record_committed(txn_id, position);
            state.update_max_read_position(position);
            state.touch();
            debug!(
                topic = %self.topic,
                txn_id = %txn_id,
                entries,
                max_read_position = %state.max_read_position,
                "Transaction committed on topic"
            );
            self.snapshot_due(&state)
        };
        self.maybe_snapshot(due).await;
        Ok(())
    }

    /// Turn the entries of `txn_id` into holes
    ///
    /// An abort after a commit of the same transaction is ignored.
    pub async fn materialize_abort(&self, txn_id: TxnId) -> Result<()> {
        self.ensure_open()?;
        let due = {
            let _guard = self.write_lock.lock().await;
            match self.state.lock().ended_status(txn_id) {
                Some(TxnStatus::Committed) => {
                    warn!(topic = %self.topic, txn_id = %txn_id, "Abort after commit ignored");
                    return Ok(());
                }
                Some(_) => return Ok(()),
                None => {}
            }
            let position = self
                .ledger
                .append(MessageEnvelope::abort_marker(txn_id).encode())
                .await
                .map_err(|e| self.unavailable(e))?;
            let mut state = self.state.lock();
            let entries = state.ongoing.remove(&txn_id).map_or(0, |t| t.positions.len());
            state.aborted.insert(txn_id, position);
            state.update_max_read_position(position);
            state.touch();
            debug!(
                topic = %self.topic,
                txn_id = %txn_id,
                entries,
                "Transaction aborted on topic"
            );
            self.snapshot_due(&state)
        };
        self.maybe_snapshot(due).await;
        Ok(())
    }

    /// Read visible data entries at or after `from`
    ///
    /// Markers, entries of aborted transactions and everything past the max
    /// read position are skipped.
    pub async fn read_committed(&self, from: Position, max: usize) -> Result<Vec<CommittedEntry>> {
        let limit = self.max_read_position();
        let mut out = Vec::new();
        let mut reader = LedgerReader::new(self.ledger.clone(), from, self.replay_batch_size);
        'read: while let Some(batch) = reader
            .next_batch()
            .await
            .map_err(|e| self.unavailable(e))?
        {
            for entry in batch {
                if entry.position > limit || out.len() >= max {
                    break 'read;
                }
                let envelope = MessageEnvelope::decode(entry.data)?;
                if envelope.is_marker() {
                    continue;
                }
                if let Some(txn_id) = envelope.txn_id {
                    if self.is_aborted(txn_id) {
                        continue;
                    }
                }
                out.push(CommittedEntry {
                    position: entry.position,
                    txn_id: envelope.txn_id,
                    payload: envelope.payload,
                });
            }
        }
        Ok(out)
    }

    fn snapshot_due(&self, state: &BufferState) -> bool {
        state.entries_since_snapshot >= self.config.snapshot_max_entries
    }

    async fn maybe_snapshot(&self, due: bool) {
        if due {
            if let Err(e) = self.take_snapshot().await {
                warn!(topic = %self.topic, error = %e, "Failed to take transaction buffer snapshot");
            }
        }
    }

    /// Called when a producer attaches; writes the first snapshot if none exists
    pub async fn on_producer_attached(&self) -> Result<()> {
        if self.snapshots.latest(&self.topic.to_string()).is_none() {
            self.take_snapshot().await?;
        }
        Ok(())
    }

    /// Persist the current state
    ///
    /// Aborted transactions whose marker lies in a ledger that is no longer
    /// retained are dropped first.
    pub async fn take_snapshot(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let first_retained = self.ledger.first_position();
        let snapshot = {
            let mut state = self.state.lock();
            let before = state.aborted.len();
            match first_retained {
                Some(first) => {
                    state
                        .aborted
                        .retain(|_, position| position.ledger_id >= first.ledger_id);
                    state
                        .committed
                        .retain(|_, position| position.ledger_id >= first.ledger_id);
                }
                None => {
                    state.aborted.clear();
                    state.committed.clear();
                }
            }
            let trimmed = before - state.aborted.len();
            if trimmed > 0 {
                debug!(topic = %self.topic, trimmed, "Trimmed aborted transactions below retained data");
            }
            TransactionBufferSnapshot {
                topic_name: self.topic.to_string(),
                sequence_id: state.snapshot_sequence,
                max_read_position_ledger_id: state.max_read_position.ledger_id,
                max_read_position_entry_id: state.max_read_position.entry_id,
                aborts: state
                    .aborted
                    .iter()
                    .map(|(txn_id, position)| AbortTxnMetadata::new(*txn_id, *position))
                    .collect(),
            }
        };

        let sequence_id = snapshot.sequence_id;
        self.snapshots.write(snapshot).await?;

        let mut state = self.state.lock();
        state.snapshot_sequence = sequence_id + 1;
        state.entries_since_snapshot = 0;
        state.dirty = false;
        self.snapshots_taken.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Snapshot on every tick of `snapshot_min_interval` if anything changed
    ///
    /// The task only holds a weak reference while waiting, so dropping the
    /// buffer ends it as well as closing it.
    fn start_snapshot_timer(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let close_notify = self.close_notify.clone();
        let period: Duration = self.config.snapshot_min_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = close_notify.notified() => break,
                }
                let Some(buffer) = weak.upgrade() else {
                    break;
                };
                if buffer.closed.load(Ordering::Acquire) {
                    break;
                }
                let dirty = buffer.state.lock().dirty;
                if dirty {
                    buffer.maybe_snapshot(true).await;
                }
            }
        });
    }

    /// Take a final snapshot if anything changed, then stop the buffer
    ///
    /// The topic ledger itself is owned by the topic and is not closed here.
    pub async fn close(&self) -> Result<()> {
        let dirty = self.state.lock().dirty;
        if dirty && !self.ledger.is_closed() && !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.take_snapshot().await {
                warn!(topic = %self.topic, error = %e, "Failed to take final snapshot");
            }
        }
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_notify.notify_waiters();
            debug!(topic = %self.topic, "Transaction buffer closed");
        }
        Ok(())
    }
}
