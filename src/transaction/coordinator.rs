//! Transaction coordinator for one coordinator partition
//!
//! The TransactionCoordinator is responsible for:
//! - Allocating transaction ids with contiguous sequence numbers
//! - Tracking participants of every open transaction
//! - Driving the Open -> Committing/Aborting -> Committed/Aborted machine
//! - Aborting transactions that outlive their timeout
//! - Resuming half-finished transactions after recovery
//!
//! # Concurrency
//!
//! Transaction metadata lives in a `DashMap`. Every status check and status
//! change happens while holding the entry's shard guard, which makes the
//! coordinator the single writer of each transaction: of two concurrent
//! `end_transaction` calls only one can move a transaction out of `Open`.
//! Allocation is serialized by an async mutex so that sequence numbers are
//! handed out in order and never reused.
//!
//! # Outcome delivery
//!
//! Once the ending status is durable, participants are told the outcome in
//! parallel. Each notification is retried with exponential backoff until it
//! succeeds or the coordinator is closed; a transaction with an unreachable
//! participant therefore stays in `Committing`/`Aborting`, where recovery
//! picks it up again.

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use futures_util::future::join_all;
#[cfg(feature = "metrics")]
use metrics::counter;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::id::TxnId;
use super::log::{TransactionLogEntry, TransactionLogStore};
use super::state::{TxnAction, TxnMeta, TxnParticipant, TxnStatus};
use crate::config::TransactionConfig;
use crate::error::{Result, StreamlineError};

/// Receives transaction outcomes for topics and subscriptions
///
/// Implementations must be idempotent: the same outcome can be delivered more
/// than once, for example after a coordinator restart.
#[async_trait]
pub trait TransactionOutcomeHandler: Send + Sync {
    async fn end_txn(
        &self,
        participant: &TxnParticipant,
        txn_id: TxnId,
        action: TxnAction,
    ) -> Result<()>;
}

/// Counters kept by a coordinator
#[derive(Debug, Default)]
pub struct TransactionCoordinatorStats {
    pub opened_total: AtomicU64,
    pub committed_total: AtomicU64,
    pub aborted_total: AtomicU64,
    pub timeouts_total: AtomicU64,
    pub notify_retries_total: AtomicU64,
    /// Last timeout check timestamp (unix ms)
    pub last_check_time_ms: AtomicU64,
}

impl TransactionCoordinatorStats {
    fn record_opened(&self) {
        self.opened_total.fetch_add(1, Ordering::Relaxed);
    }

    fn record_finished(&self, action: TxnAction) {
        match action {
            TxnAction::Commit => self.committed_total.fetch_add(1, Ordering::Relaxed),
            TxnAction::Abort => self.aborted_total.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn record_timeout(&self) {
        self.timeouts_total.fetch_add(1, Ordering::Relaxed);
    }

    fn record_retry(&self) {
        self.notify_retries_total.fetch_add(1, Ordering::Relaxed);
    }

    fn update_check_time(&self) {
        self.last_check_time_ms
            .store(now_ms().max(0) as u64, Ordering::Relaxed);
    }

    pub fn committed(&self) -> u64 {
        self.committed_total.load(Ordering::Relaxed)
    }

    pub fn aborted(&self) -> u64 {
        self.aborted_total.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts_total.load(Ordering::Relaxed)
    }

    pub fn notify_retries(&self) -> u64 {
        self.notify_retries_total.load(Ordering::Relaxed)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Coordinator of one partition of the transaction id space
pub struct TransactionCoordinator {
    partition: u64,

    /// Unfinished transactions
    transactions: DashMap<TxnId, TxnMeta>,

    log: TransactionLogStore,

    /// Next sequence number; held across the log append of a new transaction
    next_sequence: Mutex<u64>,

    handler: Arc<dyn TransactionOutcomeHandler>,

    config: TransactionConfig,

    stats: Arc<TransactionCoordinatorStats>,

    shutdown: AtomicBool,

    /// Wakes retry loops on close
    shutdown_notify: Notify,

    /// Wakes the timeout checker
    timeout_notify: Notify,
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("partition", &self.partition)
            .finish_non_exhaustive()
    }
}

impl TransactionCoordinator {
    /// Replay the log, resume half-finished transactions and start serving
    pub async fn recover(
        log: TransactionLogStore,
        handler: Arc<dyn TransactionOutcomeHandler>,
        config: TransactionConfig,
    ) -> Result<Arc<Self>> {
        let partition = log.partition();
        let recovered = log.replay().await?;
        let next_sequence = recovered.next_sequence();

        let coordinator = Arc::new(Self {
            partition,
            transactions: DashMap::new(),
            log,
            next_sequence: Mutex::new(next_sequence),
            handler,
            config,
            stats: Arc::new(TransactionCoordinatorStats::default()),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            timeout_notify: Notify::new(),
        });

        let mut resumed = Vec::new();
        for meta in recovered.active {
            if let Some(action) = TxnAction::resumed_from(meta.status) {
                resumed.push((meta.id, action, meta.participants()));
            }
            coordinator.transactions.insert(meta.id, meta);
        }

        for (txn_id, action, participants) in resumed {
            info!(
                partition,
                txn_id = %txn_id,
                action = %action,
                "Resuming transaction outcome after recovery"
            );
            let c = Arc::clone(&coordinator);
            tokio::spawn(async move {
                if let Err(e) = c.complete_end(txn_id, action, participants).await {
                    warn!(txn_id = %txn_id, error = %e, "Resumed transaction did not complete");
                }
            });
        }

        coordinator.start_timeout_checker();

        info!(
            partition,
            next_sequence,
            active = coordinator.transactions.len(),
            "Transaction coordinator recovered"
        );
        Ok(coordinator)
    }

    pub fn partition(&self) -> u64 {
        self.partition
    }

    pub fn stats(&self) -> Arc<TransactionCoordinatorStats> {
        Arc::clone(&self.stats)
    }

    pub fn log(&self) -> &TransactionLogStore {
        &self.log
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_closed() {
            return Err(StreamlineError::coordinator_unavailable(
                self.partition,
                "coordinator is closed",
            ));
        }
        Ok(())
    }

    fn log_failure(&self, error: StreamlineError) -> StreamlineError {
        StreamlineError::coordinator_unavailable(
            self.partition,
            format!("transaction log append failed: {}", error),
        )
    }

    fn lookup_mut(&self, txn_id: TxnId) -> Result<RefMut<'_, TxnId, TxnMeta>> {
        self.transactions
            .get_mut(&txn_id)
            .ok_or_else(|| StreamlineError::TransactionNotFound(txn_id.to_string()))
    }

    /// Open a new transaction
    ///
    /// The timeout is clamped into the configured range. The sequence number
    /// only advances once the `New` entry is durable, so a failed append
    /// hands the same number to the next caller.
    pub async fn new_transaction(
        &self,
        timeout_ms: Option<i64>,
        owner: Option<String>,
    ) -> Result<TxnId> {
        self.ensure_running()?;
        let timeout_ms = self.config.clamp_timeout_ms(timeout_ms);

        let mut next = self.next_sequence.lock().await;
        let txn_id = TxnId::new(self.partition, *next);

        let opened_at_ms = now_ms();
        self.log
            .append(&TransactionLogEntry::New {
                txn_id,
                timeout_ms,
                opened_at_ms,
                owner: owner.clone(),
            })
            .await
            .map_err(|e| self.log_failure(e))?;
        *next += 1;
        self.transactions.insert(
            txn_id,
            TxnMeta::new(txn_id, timeout_ms, opened_at_ms, owner),
        );
        drop(next);

        self.stats.record_opened();
        #[cfg(feature = "metrics")]
        counter!("streamline_transactions_opened_total").increment(1);

        info!(txn_id = %txn_id, timeout_ms, "Transaction opened");
        Ok(txn_id)
    }

    /// Register a topic or subscription with an open transaction
    pub async fn add_participant(&self, txn_id: TxnId, participant: TxnParticipant) -> Result<()> {
        self.ensure_running()?;
        {
            let mut meta = self.lookup_mut(txn_id)?;
            if !meta.status.can_add_participants() {
                return Err(StreamlineError::invalid_txn_state(
                    txn_id,
                    TxnStatus::Open,
                    meta.status,
                ));
            }
            if !meta.add_participant(&participant) {
                return Ok(());
            }
        }

        let entry = TransactionLogEntry::AddParticipant {
            txn_id,
            participant: participant.clone(),
        };
        if let Err(e) = self.log.append(&entry).await {
            if let Some(mut meta) = self.transactions.get_mut(&txn_id) {
                if meta.status == TxnStatus::Open {
                    meta.remove_participant(&participant);
                }
            }
            return Err(self.log_failure(e));
        }

        debug!(txn_id = %txn_id, participant = %participant, "Participant added");
        Ok(())
    }

    pub async fn commit(&self, txn_id: TxnId) -> Result<()> {
        self.end_transaction(txn_id, TxnAction::Commit).await
    }

    pub async fn abort(&self, txn_id: TxnId) -> Result<()> {
        self.end_transaction(txn_id, TxnAction::Abort).await
    }

    /// Commit or abort a transaction
    ///
    /// Returns once every participant applied the outcome. A second call for
    /// the same transaction fails with `InvalidTxnState` while the first is
    /// in progress and with `TransactionNotFound` after it finished.
    pub async fn end_transaction(&self, txn_id: TxnId, action: TxnAction) -> Result<()> {
        self.ensure_running()?;
        let ending = action.ending_status();
        let participants = {
            let mut meta = self.lookup_mut(txn_id)?;
            meta.transition(ending)?;
            meta.participants()
        };

        let entry = TransactionLogEntry::StatusChange {
            txn_id,
            status: ending,
        };
        if let Err(e) = self.log.append(&entry).await {
            if let Some(mut meta) = self.transactions.get_mut(&txn_id) {
                meta.status = TxnStatus::Open;
            }
            warn!(txn_id = %txn_id, status = %ending, error = %e, "Failed to log ending status");
            return Err(self.log_failure(e));
        }

        info!(
            txn_id = %txn_id,
            status = %ending,
            participants = participants.len(),
            "Transaction ending"
        );
        self.complete_end(txn_id, action, participants).await
    }

    /// Deliver the outcome, log the terminal status and forget the transaction
    async fn complete_end(
        &self,
        txn_id: TxnId,
        action: TxnAction,
        participants: Vec<TxnParticipant>,
    ) -> Result<()> {
        let notifications = participants.iter().map(|participant| {
            self.retry_until_closed(txn_id, "notify participant", move || {
                self.handler.end_txn(participant, txn_id, action)
            })
        });
        for result in join_all(notifications).await {
            result?;
        }

        let status = action.final_status();
        let entry = TransactionLogEntry::StatusChange { txn_id, status };
        self.retry_until_closed(txn_id, "log final status", || self.log.append(&entry))
            .await?;

        if let Some(mut meta) = self.transactions.get_mut(&txn_id) {
            meta.status = status;
        }
        self.transactions.remove(&txn_id);
        self.stats.record_finished(action);
        #[cfg(feature = "metrics")]
        match action {
            TxnAction::Commit => counter!("streamline_transactions_committed_total").increment(1),
            TxnAction::Abort => counter!("streamline_transactions_aborted_total").increment(1),
        }

        info!(txn_id = %txn_id, status = %status, "Transaction finished");
        Ok(())
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.config.notify_min_backoff())
            .with_max_delay(self.config.notify_max_backoff())
            .with_max_times(usize::MAX)
            .with_jitter()
    }

    /// Run `op` until it succeeds, backing off between attempts
    ///
    /// Only closing the coordinator stops the loop.
    async fn retry_until_closed<T, F, Fut>(
        &self,
        txn_id: TxnId,
        operation: &'static str,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delays = self.backoff().build();
        let mut attempt: u32 = 0;
        loop {
            let closed = self.shutdown_notify.notified();
            tokio::pin!(closed);
            closed.as_mut().enable();
            if self.is_closed() {
                return Err(StreamlineError::ShuttingDown);
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    let delay = delays
                        .next()
                        .unwrap_or(self.config.notify_max_backoff());
                    self.stats.record_retry();
                    warn!(
                        txn_id = %txn_id,
                        operation,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transaction outcome step failed, retrying after backoff"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = &mut closed => return Err(StreamlineError::ShuttingDown),
                    }
                }
            }
        }
    }

    /// Status of an unfinished transaction
    pub fn get_txn_status(&self, txn_id: TxnId) -> Result<TxnStatus> {
        self.transactions
            .get(&txn_id)
            .map(|m| m.status)
            .ok_or_else(|| StreamlineError::TransactionNotFound(txn_id.to_string()))
    }

    pub fn get_txn_meta(&self, txn_id: TxnId) -> Option<TxnMeta> {
        self.transactions.get(&txn_id).map(|m| m.clone())
    }

    /// Unfinished transactions ordered by id
    pub fn active_transactions(&self) -> Vec<TxnMeta> {
        let mut all: Vec<TxnMeta> = self.transactions.iter().map(|e| e.clone()).collect();
        all.sort_by_key(|m| m.id);
        all
    }

    pub fn remaining_timeout_ms(&self, txn_id: TxnId) -> Result<i64> {
        self.transactions
            .get(&txn_id)
            .map(|m| m.remaining_timeout_ms(now_ms()))
            .ok_or_else(|| StreamlineError::TransactionNotFound(txn_id.to_string()))
    }

    /// Abort every open transaction past its deadline
    ///
    /// Aborts run in background tasks; the number of expired transactions
    /// found is returned.
    pub fn check_transaction_timeouts(self: &Arc<Self>) -> usize {
        self.stats.update_check_time();
        let now = now_ms();

        let expired: Vec<(TxnId, i64)> = self
            .transactions
            .iter()
            .filter(|entry| entry.is_timed_out(now))
            .map(|entry| (entry.id, entry.timeout_ms))
            .collect();

        for &(txn_id, timeout_ms) in &expired {
            warn!(
                partition = self.partition,
                txn_id = %txn_id,
                timeout_ms,
                "Transaction timed out"
            );
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                match coordinator.end_transaction(txn_id, TxnAction::Abort).await {
                    Ok(()) => {
                        coordinator.stats.record_timeout();
                        #[cfg(feature = "metrics")]
                        counter!("streamline_transaction_timeouts_total").increment(1);
                    }
                    Err(StreamlineError::InvalidTxnState { .. })
                    | Err(StreamlineError::TransactionNotFound(_)) => {
                        debug!(txn_id = %txn_id, "Timed out transaction ended by its client first");
                    }
                    Err(e) => {
                        warn!(txn_id = %txn_id, error = %e, "Failed to abort timed out transaction");
                    }
                }
            });
        }

        expired.len()
    }

    /// Start the background timeout checker
    pub fn start_timeout_checker(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        let check_interval = coordinator.config.timeout_check_interval();

        tokio::spawn(async move {
            let mut ticker = interval(check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            debug!(
                partition = coordinator.partition,
                interval_ms = check_interval.as_millis() as u64,
                "Transaction timeout checker started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = coordinator.timeout_notify.notified() => {}
                }
                if coordinator.is_closed() {
                    break;
                }
                coordinator.check_transaction_timeouts();
            }

            debug!(
                partition = coordinator.partition,
                "Transaction timeout checker stopped"
            );
        });
    }

    /// Trigger an immediate timeout check
    pub fn trigger_timeout_check(&self) {
        self.timeout_notify.notify_one();
    }

    /// Stop background work and close the transaction log
    ///
    /// Transactions still being ended stay in the log with their ending
    /// status and are resumed by the next recovery.
    pub async fn close(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown_notify.notify_waiters();
        self.timeout_notify.notify_one();
        self.log.close().await?;
        info!(
            partition = self.partition,
            unfinished = self.transactions.len(),
            "Transaction coordinator closed"
        );
        Ok(())
    }
}
