//! Broker service
//!
//! Owns every registry of the transactional core and wires them together:
//!
//! - Coordinator partitions (`TransactionMetadataStoreService`)
//! - Loaded topics and the topics the broker created (`TopicRegistry`)
//! - One buffer snapshot store per namespace
//!
//! The broker is also the outcome handler of its coordinators: a commit or
//! abort for a topic or subscription participant is applied by loading the
//! topic on demand and forwarding to its transaction buffer or to the
//! subscription's pending-ack handle.
//!
//! # Lifecycle
//!
//! Unloading a topic closes its buffer (taking a final snapshot), its
//! subscriptions' pending-ack handles and its ledger, and removes it from the
//! registry. Unloading the system namespace also unloads the coordinator
//! partitions. A later lookup loads everything again through full recovery.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::buffer::TransactionBufferSnapshotStore;
use crate::config::BrokerConfig;
use crate::error::{Result, StreamlineError};
use crate::naming::{NamespaceName, TopicName};
use crate::storage::{create_ledger_factory, LedgerConfig, ManagedLedgerFactory, TopicPolicies};
use crate::topic::{PersistentTopic, TopicContext, TopicRegistry};
use crate::transaction::{
    TransactionCoordinator, TransactionMetadataStoreService, TransactionOutcomeHandler, TxnAction,
    TxnId, TxnParticipant, TxnStatus,
};

type SnapshotStoreCell = Arc<OnceCell<Arc<TransactionBufferSnapshotStore>>>;

/// Delivers coordinator outcomes to the broker that owns the participants
struct BrokerOutcomeHandler {
    broker: Weak<BrokerService>,
}

#[async_trait]
impl TransactionOutcomeHandler for BrokerOutcomeHandler {
    async fn end_txn(
        &self,
        participant: &TxnParticipant,
        txn_id: TxnId,
        action: TxnAction,
    ) -> Result<()> {
        let broker = self.broker.upgrade().ok_or(StreamlineError::ShuttingDown)?;
        broker.apply_outcome(participant, txn_id, action).await
    }
}

pub struct BrokerService {
    config: BrokerConfig,
    factory: Arc<dyn ManagedLedgerFactory>,
    policies: Arc<TopicPolicies>,
    coordinators: Arc<TransactionMetadataStoreService>,
    topics: TopicRegistry,
    snapshot_stores: DashMap<NamespaceName, SnapshotStoreCell>,
    ctx: Arc<TopicContext>,
    closed: AtomicBool,
}

impl BrokerService {
    /// Create the broker on the configured storage and load every coordinator partition
    pub async fn start(config: BrokerConfig) -> Result<Arc<Self>> {
        let factory = create_ledger_factory(&config.storage)?;
        let broker = Self::with_factory(config, factory)?;
        broker.load_coordinators().await?;
        Ok(broker)
    }

    /// Create the broker on an existing ledger factory without loading anything
    pub fn with_factory(
        config: BrokerConfig,
        factory: Arc<dyn ManagedLedgerFactory>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let policies = Arc::new(TopicPolicies::new());
        let broker = Arc::new_cyclic(|weak: &Weak<BrokerService>| {
            let handler = Arc::new(BrokerOutcomeHandler {
                broker: weak.clone(),
            });
            let coordinators = Arc::new(TransactionMetadataStoreService::new(
                factory.clone(),
                policies.clone(),
                handler,
                config.transaction.clone(),
                config.storage.clone(),
            ));
            let ctx = Arc::new(TopicContext {
                factory: factory.clone(),
                policies: policies.clone(),
                coordinators: coordinators.clone(),
                storage: config.storage.clone(),
                transaction: config.transaction.clone(),
            });
            BrokerService {
                config,
                factory,
                policies,
                coordinators,
                topics: TopicRegistry::new(),
                snapshot_stores: DashMap::new(),
                ctx,
                closed: AtomicBool::new(false),
            }
        });
        info!(
            coordinator_partitions = broker.config.transaction.coordinator_partitions,
            in_memory = broker.config.storage.in_memory,
            "Broker service created"
        );
        Ok(broker)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn factory(&self) -> &Arc<dyn ManagedLedgerFactory> {
        &self.factory
    }

    /// Retention policies keyed by logical name
    pub fn policies(&self) -> &Arc<TopicPolicies> {
        &self.policies
    }

    pub fn coordinators(&self) -> &Arc<TransactionMetadataStoreService> {
        &self.coordinators
    }

    fn ensure_running(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamlineError::ShuttingDown);
        }
        Ok(())
    }

    /// Load every configured coordinator partition
    pub async fn load_coordinators(&self) -> Result<()> {
        for partition in 0..self.config.transaction.coordinator_partitions {
            self.load_coordinator(partition).await?;
        }
        Ok(())
    }

    /// Take ownership of a coordinator partition
    ///
    /// The partition's assignment topic is loaded first, then the coordinator
    /// recovers from its log.
    pub async fn load_coordinator(&self, partition: u64) -> Result<Arc<TransactionCoordinator>> {
        self.ensure_running()?;
        self.get_or_create_topic(&TopicName::coordinator_assign(partition))
            .await?;
        self.coordinators.load(partition).await
    }

    async fn snapshot_store(
        &self,
        namespace: &NamespaceName,
    ) -> Result<Arc<TransactionBufferSnapshotStore>> {
        let cell = self
            .snapshot_stores
            .entry(namespace.clone())
            .or_default()
            .clone();
        let result = cell
            .get_or_try_init(|| async {
                let name = namespace.buffer_snapshot_topic();
                let ledger = self
                    .factory
                    .open(
                        &name.persistence_name(),
                        LedgerConfig::new(
                            self.policies.clone(),
                            name.to_string(),
                            self.config.storage.default_retention(),
                        ),
                    )
                    .await?;
                let store = TransactionBufferSnapshotStore::open(
                    namespace.clone(),
                    ledger,
                    self.config.storage.replay_batch_size,
                )
                .await?;
                Ok::<_, StreamlineError>(Arc::new(store))
            })
            .await
            .cloned();
        if result.is_err() {
            self.snapshot_stores
                .remove_if(namespace, |_, c| Arc::ptr_eq(c, &cell) && c.get().is_none());
        }
        result
    }

    /// The loaded topic `name`, loading or creating it when needed
    pub async fn get_or_create_topic(&self, name: &TopicName) -> Result<Arc<PersistentTopic>> {
        self.ensure_running()?;
        if let Some(topic) = self.topics.get(name) {
            return Ok(topic);
        }
        if name.is_internal() {
            return Err(StreamlineError::InvalidTopicName(format!(
                "{} is an internal transaction store",
                name
            )));
        }
        let topic = self.load_topic(name).await?;
        self.topics.record_created(name);
        Ok(topic)
    }

    async fn load_topic(&self, name: &TopicName) -> Result<Arc<PersistentTopic>> {
        let snapshots = self.snapshot_store(name.namespace()).await?;
        self.topics
            .get_or_load(name, || {
                PersistentTopic::load(name.clone(), snapshots, self.ctx.clone())
            })
            .await
    }

    pub fn get_topic_if_exists(&self, name: &TopicName) -> Option<Arc<PersistentTopic>> {
        self.topics.get(name)
    }

    /// Whether `name` is currently loaded
    pub fn is_topic_registered(&self, name: &TopicName) -> bool {
        self.topics.is_registered(name)
    }

    /// Create a topic that must not exist yet
    ///
    /// Fails with `Conflict` while the broker still knows the name, even if
    /// its ledger disappeared from storage. The name is claimed before the
    /// topic loads, so of two concurrent creates only one succeeds.
    pub async fn create_non_partitioned_topic(
        &self,
        name: &TopicName,
    ) -> Result<Arc<PersistentTopic>> {
        self.ensure_running()?;
        if name.is_internal() {
            return Err(StreamlineError::InvalidTopicName(format!(
                "{} is an internal transaction store",
                name
            )));
        }
        let conflict = || StreamlineError::Conflict(format!("topic {} already exists", name));
        if self.topics.is_known(name)
            || self.topics.is_registered(name)
            || self.factory.exists(&name.persistence_name()).await
        {
            return Err(conflict());
        }
        if !self.topics.record_created(name) {
            return Err(conflict());
        }
        match self.load_topic(name).await {
            Ok(topic) => {
                info!(topic = %name, "Topic created");
                Ok(topic)
            }
            Err(e) => {
                self.topics.forget(name);
                Err(e)
            }
        }
    }

    /// Drop everything the broker remembers about `name`
    ///
    /// Storage is left alone; this clears stale references after the
    /// topic's ledger was removed elsewhere.
    pub async fn forget_topic(&self, name: &TopicName) -> bool {
        let known = self.topics.forget(name);
        let loaded = self.unload_topic(name).await.unwrap_or_else(|e| {
            warn!(topic = %name, error = %e, "Failed to close forgotten topic");
            true
        });
        if let Some(store) = self
            .snapshot_stores
            .get(name.namespace())
            .and_then(|c| c.get().cloned())
        {
            store.forget(&name.to_string());
        }
        debug!(topic = %name, known, loaded, "Topic forgotten");
        known || loaded
    }

    /// Close topic `name` and remove it from the registry
    ///
    /// A load of `name` that starts meanwhile waits for the close to finish
    /// and then recovers a fresh instance.
    pub async fn unload_topic(&self, name: &TopicName) -> Result<bool> {
        let Some((topic, _closing)) = self.topics.begin_unload(name) else {
            return Ok(false);
        };
        topic.close().await?;
        debug!(topic = %name, "Topic unloaded");
        Ok(true)
    }

    /// Unload every topic of `namespace`
    ///
    /// For the system namespace the coordinator partitions are unloaded as
    /// well, before the topics.
    pub async fn unload_namespace(&self, namespace: &NamespaceName) -> Result<()> {
        if namespace.is_system() {
            for partition in self.coordinators.loaded_partitions() {
                self.coordinators.remove(partition).await?;
            }
        }
        let topics = self.topics.topics_in(namespace);
        let count = topics.len();
        for name in topics {
            if let Err(e) = self.unload_topic(&name).await {
                warn!(topic = %name, error = %e, "Failed to unload topic");
            }
        }
        if let Some((_, cell)) = self.snapshot_stores.remove(namespace) {
            if let Some(store) = cell.get() {
                store.close().await?;
            }
        }
        info!(namespace = %namespace, topics = count, "Namespace unloaded");
        Ok(())
    }

    /// Open a transaction on the next coordinator partition
    pub async fn new_transaction(&self, timeout_ms: Option<i64>) -> Result<TxnId> {
        self.ensure_running()?;
        self.coordinators
            .pick()?
            .new_transaction(timeout_ms, None)
            .await
    }

    pub async fn commit_transaction(&self, txn_id: TxnId) -> Result<()> {
        self.ensure_running()?;
        self.coordinators.coordinator_for(txn_id)?.commit(txn_id).await
    }

    pub async fn abort_transaction(&self, txn_id: TxnId) -> Result<()> {
        self.ensure_running()?;
        self.coordinators.coordinator_for(txn_id)?.abort(txn_id).await
    }

    pub fn get_txn_status(&self, txn_id: TxnId) -> Result<TxnStatus> {
        self.coordinators
            .coordinator_for(txn_id)?
            .get_txn_status(txn_id)
    }

    async fn apply_outcome(
        &self,
        participant: &TxnParticipant,
        txn_id: TxnId,
        action: TxnAction,
    ) -> Result<()> {
        self.ensure_running()?;
        match participant {
            TxnParticipant::Topic(name) => {
                let topic = self.get_or_create_topic(&TopicName::parse(name)?).await?;
                let buffer = topic.transaction_buffer();
                match action {
                    TxnAction::Commit => buffer.materialize_commit(txn_id).await,
                    TxnAction::Abort => buffer.materialize_abort(txn_id).await,
                }
            }
            TxnParticipant::Subscription {
                topic,
                subscription,
            } => {
                let topic = self.get_or_create_topic(&TopicName::parse(topic)?).await?;
                let handle = topic
                    .get_or_create_subscription(subscription)
                    .pending_ack_handle()
                    .await?;
                match action {
                    TxnAction::Commit => handle.materialize_commit(txn_id).await,
                    TxnAction::Abort => handle.materialize_abort(txn_id).await,
                }
            }
        }
    }

    /// Stop coordinators, unload every topic and close all ledgers
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.coordinators.close().await;
        for name in self.topics.all() {
            if let Err(e) = self.unload_topic(&name).await {
                warn!(topic = %name, error = %e, "Failed to unload topic");
            }
        }
        let namespaces: Vec<NamespaceName> = self
            .snapshot_stores
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for namespace in namespaces {
            if let Some((_, cell)) = self.snapshot_stores.remove(&namespace) {
                if let Some(store) = cell.get() {
                    if let Err(e) = store.close().await {
                        warn!(namespace = %namespace, error = %e, "Failed to close snapshot store");
                    }
                }
            }
        }
        self.factory.close_all().await;
        info!("Broker service closed");
    }
}
