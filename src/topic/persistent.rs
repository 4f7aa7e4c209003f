//! Persistent topic
//!
//! A topic owns its ledger, its transaction buffer and its subscriptions.
//! Every publish goes through the buffer so that the max read position
//! tracks ordinary and transactional messages alike.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[cfg(feature = "metrics")]
use metrics::counter;

use super::subscription::PersistentSubscription;
use super::TopicContext;
use crate::buffer::{CommittedEntry, TopicTransactionBuffer, TransactionBufferSnapshotStore};
use crate::error::{Result, StreamlineError};
use crate::naming::TopicName;
use crate::storage::{LedgerConfig, ManagedLedger, Position};
use crate::transaction::{TxnId, TxnParticipant};

/// Who published a message and with which sequence numbers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishContext {
    pub producer_name: String,
    pub sequence_id: i64,
    pub highest_sequence_id: i64,
    pub num_messages: u32,
}

impl PublishContext {
    /// Context of a single, unbatched message
    pub fn single(producer_name: impl Into<String>, sequence_id: i64) -> Self {
        Self {
            producer_name: producer_name.into(),
            sequence_id,
            highest_sequence_id: sequence_id,
            num_messages: 1,
        }
    }
}

/// Successful publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub position: Position,
    pub context: PublishContext,
}

/// Failed publish, carrying the context the producer sent
#[derive(Debug, Error)]
#[error("publish from {} (sequence {}) failed", context.producer_name, context.sequence_id)]
pub struct PublishFailure {
    pub context: PublishContext,
    #[source]
    pub error: StreamlineError,
}

impl PublishFailure {
    pub fn error(&self) -> &StreamlineError {
        &self.error
    }

    pub fn into_error(self) -> StreamlineError {
        self.error
    }
}

pub type PublishResult = std::result::Result<PublishReceipt, PublishFailure>;

pub struct PersistentTopic {
    name: TopicName,
    ledger: Arc<dyn ManagedLedger>,
    buffer: Arc<TopicTransactionBuffer>,
    subscriptions: DashMap<String, Arc<PersistentSubscription>>,
    producers: Mutex<BTreeSet<String>>,
    ctx: Arc<TopicContext>,
}

impl std::fmt::Debug for PersistentTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentTopic")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl PersistentTopic {
    /// Open the topic ledger and recover its transaction buffer
    pub(crate) async fn load(
        name: TopicName,
        snapshots: Arc<TransactionBufferSnapshotStore>,
        ctx: Arc<TopicContext>,
    ) -> Result<Self> {
        let config = LedgerConfig::new(
            ctx.policies.clone(),
            name.to_string(),
            ctx.storage.default_retention(),
        );
        let ledger = ctx.factory.open(&name.persistence_name(), config).await?;
        let buffer = TopicTransactionBuffer::recover(
            name.clone(),
            ledger.clone(),
            snapshots,
            ctx.transaction.clone(),
            ctx.storage.replay_batch_size,
        )
        .await?;
        info!(topic = %name, ledger_id = ledger.current_ledger_id(), "Topic loaded");
        Ok(Self {
            name,
            ledger,
            buffer,
            subscriptions: DashMap::new(),
            producers: Mutex::new(BTreeSet::new()),
            ctx,
        })
    }

    pub fn name(&self) -> &TopicName {
        &self.name
    }

    pub fn ledger(&self) -> &Arc<dyn ManagedLedger> {
        &self.ledger
    }

    pub fn transaction_buffer(&self) -> &Arc<TopicTransactionBuffer> {
        &self.buffer
    }

    /// Register a producer; the first one on a topic seeds the buffer snapshot
    pub async fn add_producer(&self, producer_name: &str) -> Result<()> {
        let inserted = self.producers.lock().insert(producer_name.to_string());
        if inserted {
            debug!(topic = %self.name, producer = producer_name, "Producer attached");
            self.buffer.on_producer_attached().await?;
        }
        Ok(())
    }

    pub fn remove_producer(&self, producer_name: &str) -> bool {
        self.producers.lock().remove(producer_name)
    }

    pub fn producers(&self) -> Vec<String> {
        self.producers.lock().iter().cloned().collect()
    }

    /// Publish an ordinary message
    pub async fn publish(&self, context: PublishContext, payload: Bytes) -> PublishResult {
        match self.buffer.append_normal(payload).await {
            Ok(position) => {
                #[cfg(feature = "metrics")]
                counter!("streamline_messages_published_total").increment(1);
                Ok(PublishReceipt { position, context })
            }
            Err(error) => Err(self.publish_failed(context, error)),
        }
    }

    /// Publish a message inside `txn_id`
    ///
    /// The topic is registered with the transaction first so that the
    /// coordinator will deliver the outcome here.
    pub async fn publish_txn_message(
        &self,
        txn_id: TxnId,
        context: PublishContext,
        payload: Bytes,
    ) -> PublishResult {
        let result = async {
            self.ctx
                .coordinators
                .coordinator_for(txn_id)?
                .add_participant(txn_id, TxnParticipant::topic(self.name.to_string()))
                .await?;
            self.buffer.append_pending(txn_id, payload).await
        }
        .await;
        match result {
            Ok(position) => {
                #[cfg(feature = "metrics")]
                counter!("streamline_txn_messages_published_total").increment(1);
                Ok(PublishReceipt { position, context })
            }
            Err(error) => Err(self.publish_failed(context, error)),
        }
    }

    fn publish_failed(&self, context: PublishContext, error: StreamlineError) -> PublishFailure {
        warn!(
            topic = %self.name,
            producer = %context.producer_name,
            sequence_id = context.sequence_id,
            ledger_closed = error.is_ledger_closed(),
            error = %error,
            "Publish failed"
        );
        PublishFailure { context, error }
    }

    /// Messages visible to readers, starting at `from`
    pub async fn read_committed(&self, from: Position, max: usize) -> Result<Vec<CommittedEntry>> {
        self.buffer.read_committed(from, max).await
    }

    /// Subscription `name`, created at the current end of the topic if missing
    pub fn get_or_create_subscription(&self, name: &str) -> Arc<PersistentSubscription> {
        self.subscriptions
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(topic = %self.name, subscription = name, "Subscription created");
                Arc::new(PersistentSubscription::new(
                    self.name.clone(),
                    name,
                    self.ledger.last_confirmed_position(),
                    self.ctx.clone(),
                ))
            })
            .clone()
    }

    pub fn get_subscription(&self, name: &str) -> Option<Arc<PersistentSubscription>> {
        self.subscriptions.get(name).map(|s| s.clone())
    }

    pub fn subscription_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.subscriptions.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }

    /// Close subscriptions, the buffer and the ledger
    pub(crate) async fn close(&self) -> Result<()> {
        let subscriptions: Vec<Arc<PersistentSubscription>> =
            self.subscriptions.iter().map(|e| e.value().clone()).collect();
        for subscription in subscriptions {
            subscription.close().await;
        }
        self.subscriptions.clear();

        self.buffer.close().await?;
        if let Err(e) = self.ledger.close().await {
            warn!(topic = %self.name, error = %e, "Failed to close topic ledger");
        }
        info!(topic = %self.name, "Topic closed");
        Ok(())
    }
}
