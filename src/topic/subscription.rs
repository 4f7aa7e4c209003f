//! Persistent subscription
//!
//! A subscription owns its read cursor and, once it received a transactional
//! acknowledgment, a pending-ack handle. The handle is loaded at most once per
//! subscription instance; concurrent callers share the same load.

use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::cursor::SubscriptionCursor;
use super::TopicContext;
use crate::error::Result;
use crate::naming::TopicName;
use crate::pending_ack::{AckKind, PendingAckHandle, PendingAckStore};
use crate::storage::{LedgerConfig, Position};
use crate::transaction::{TxnId, TxnParticipant};

pub struct PersistentSubscription {
    topic: TopicName,
    name: String,
    cursor: Arc<SubscriptionCursor>,
    pending_ack: OnceCell<Arc<PendingAckHandle>>,
    ctx: Arc<TopicContext>,
}

impl PersistentSubscription {
    pub(crate) fn new(
        topic: TopicName,
        name: impl Into<String>,
        start: Position,
        ctx: Arc<TopicContext>,
    ) -> Self {
        Self {
            topic,
            name: name.into(),
            cursor: Arc::new(SubscriptionCursor::new(start)),
            pending_ack: OnceCell::new(),
            ctx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topic(&self) -> &TopicName {
        &self.topic
    }

    pub fn cursor(&self) -> &Arc<SubscriptionCursor> {
        &self.cursor
    }

    /// Name of the subscription's pending-ack store
    pub fn pending_ack_store_name(&self) -> TopicName {
        self.topic.pending_ack_store(&self.name)
    }

    /// The loaded pending-ack handle, if any
    pub fn pending_ack_if_loaded(&self) -> Option<Arc<PendingAckHandle>> {
        self.pending_ack.get().cloned()
    }

    /// Load the pending-ack handle, replaying its store on first use
    pub async fn pending_ack_handle(&self) -> Result<Arc<PendingAckHandle>> {
        self.pending_ack
            .get_or_try_init(|| self.open_pending_ack())
            .await
            .cloned()
    }

    async fn open_pending_ack(&self) -> Result<Arc<PendingAckHandle>> {
        let store_name = self.pending_ack_store_name();
        // The topic's retention at this point applies until the store gets its own
        let fallback = self
            .ctx
            .policies
            .get_retention(&self.topic.to_string())
            .unwrap_or_else(|| self.ctx.storage.default_retention());
        let config = LedgerConfig::new(self.ctx.policies.clone(), store_name.to_string(), fallback);
        let ledger = self
            .ctx
            .factory
            .open(&store_name.persistence_name(), config)
            .await?;
        let store = PendingAckStore::new(
            store_name.to_string(),
            ledger,
            self.ctx.storage.replay_batch_size,
        );
        PendingAckHandle::recover(
            self.topic.to_string(),
            self.name.clone(),
            store,
            self.cursor.clone(),
        )
        .await
    }

    /// Acknowledge outside any transaction
    ///
    /// Fails with `TransactionConflict` when the ack would cover a message
    /// that a transaction acknowledged and has not ended yet.
    pub async fn acknowledge(&self, positions: Vec<Position>, kind: AckKind) -> Result<()> {
        let store_exists = self
            .ctx
            .factory
            .exists(&self.pending_ack_store_name().persistence_name())
            .await;
        if self.pending_ack.initialized() || store_exists {
            self.pending_ack_handle()
                .await?
                .check_non_txn_ack(kind, &positions)?;
        }
        match kind {
            AckKind::Individual => self.cursor.acknowledge_individual(&positions),
            AckKind::Cumulative => {
                if let Some(p) = positions.iter().max() {
                    self.cursor.acknowledge_cumulative(*p);
                }
            }
        }
        debug!(
            topic = %self.topic,
            subscription = %self.name,
            kind = %kind,
            mark_delete = %self.cursor.mark_delete_position(),
            "Acknowledged"
        );
        Ok(())
    }

    /// Acknowledge inside `txn_id`; takes effect when the transaction commits
    pub async fn acknowledge_txn(
        &self,
        txn_id: TxnId,
        positions: Vec<Position>,
        kind: AckKind,
    ) -> Result<()> {
        self.ctx
            .coordinators
            .coordinator_for(txn_id)?
            .add_participant(
                txn_id,
                TxnParticipant::subscription(self.topic.to_string(), self.name.clone()),
            )
            .await?;
        self.pending_ack_handle()
            .await?
            .record_ack(txn_id, positions, kind)
            .await
    }

    pub(crate) async fn close(&self) {
        if let Some(handle) = self.pending_ack.get() {
            if let Err(e) = handle.close().await {
                warn!(
                    topic = %self.topic,
                    subscription = %self.name,
                    error = %e,
                    "Failed to close pending ack handle"
                );
            }
        }
    }
}
