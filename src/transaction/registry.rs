//! Registry of loaded coordinator partitions

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::coordinator::{TransactionCoordinator, TransactionOutcomeHandler};
use super::id::TxnId;
use super::log::TransactionLogStore;
use crate::config::{StorageConfig, TransactionConfig};
use crate::error::{Result, StreamlineError};
use crate::naming::TopicName;
use crate::storage::{LedgerConfig, ManagedLedgerFactory, TopicPolicies};

type CoordinatorCell = Arc<OnceCell<Arc<TransactionCoordinator>>>;

/// Owns one coordinator per loaded partition
///
/// Loading is single-flight per partition. A partition that is not loaded,
/// or whose recovery has not finished, answers `CoordinatorUnavailable`.
pub struct TransactionMetadataStoreService {
    coordinators: DashMap<u64, CoordinatorCell>,
    factory: Arc<dyn ManagedLedgerFactory>,
    policies: Arc<TopicPolicies>,
    handler: Arc<dyn TransactionOutcomeHandler>,
    config: TransactionConfig,
    storage: StorageConfig,
    round_robin: AtomicU64,
}

impl TransactionMetadataStoreService {
    pub fn new(
        factory: Arc<dyn ManagedLedgerFactory>,
        policies: Arc<TopicPolicies>,
        handler: Arc<dyn TransactionOutcomeHandler>,
        config: TransactionConfig,
        storage: StorageConfig,
    ) -> Self {
        Self {
            coordinators: DashMap::new(),
            factory,
            policies,
            handler,
            config,
            storage,
            round_robin: AtomicU64::new(0),
        }
    }

    /// Load a partition, replaying its log the first time
    pub async fn load(&self, partition: u64) -> Result<Arc<TransactionCoordinator>> {
        if partition >= self.config.coordinator_partitions {
            return Err(StreamlineError::coordinator_unavailable(
                partition,
                format!(
                    "only {} coordinator partitions are configured",
                    self.config.coordinator_partitions
                ),
            ));
        }
        let cell = self.coordinators.entry(partition).or_default().clone();
        let result = cell
            .get_or_try_init(|| self.open_coordinator(partition))
            .await
            .cloned();
        if let Err(e) = &result {
            warn!(partition, error = %e, "Failed to load transaction coordinator");
            self.coordinators
                .remove_if(&partition, |_, c| Arc::ptr_eq(c, &cell) && c.get().is_none());
        }
        result
    }

    async fn open_coordinator(&self, partition: u64) -> Result<Arc<TransactionCoordinator>> {
        let name = TopicName::transaction_log(partition);
        let ledger = self
            .factory
            .open(
                &name.persistence_name(),
                LedgerConfig::new(
                    self.policies.clone(),
                    name.to_string(),
                    self.storage.default_retention(),
                ),
            )
            .await?;
        let log = TransactionLogStore::new(partition, ledger, self.storage.replay_batch_size);
        let coordinator =
            TransactionCoordinator::recover(log, self.handler.clone(), self.config.clone()).await?;
        info!(partition, "Transaction coordinator loaded");
        Ok(coordinator)
    }

    /// The ready coordinator of `partition`
    pub fn get(&self, partition: u64) -> Result<Arc<TransactionCoordinator>> {
        let cell = self
            .coordinators
            .get(&partition)
            .map(|c| c.clone())
            .ok_or_else(|| StreamlineError::coordinator_unavailable(partition, "not loaded"))?;
        cell.get()
            .cloned()
            .ok_or_else(|| StreamlineError::coordinator_unavailable(partition, "recovering"))
    }

    /// Coordinator owning `txn_id`
    pub fn coordinator_for(&self, txn_id: TxnId) -> Result<Arc<TransactionCoordinator>> {
        self.get(txn_id.partition())
    }

    pub fn is_loaded(&self, partition: u64) -> bool {
        self.coordinators
            .get(&partition)
            .is_some_and(|c| c.get().is_some())
    }

    /// Loaded partitions in ascending order
    pub fn loaded_partitions(&self) -> Vec<u64> {
        let mut partitions: Vec<u64> = self
            .coordinators
            .iter()
            .filter(|e| e.value().get().is_some())
            .map(|e| *e.key())
            .collect();
        partitions.sort_unstable();
        partitions
    }

    /// Next partition for a new transaction
    ///
    /// Partitions are used round-robin over the configured count; a partition
    /// that is not loaded yields `CoordinatorUnavailable`.
    pub fn pick(&self) -> Result<Arc<TransactionCoordinator>> {
        let n = self.config.coordinator_partitions.max(1);
        let partition = self.round_robin.fetch_add(1, Ordering::Relaxed) % n;
        self.get(partition)
    }

    /// Close and forget a partition's coordinator
    pub async fn remove(&self, partition: u64) -> Result<bool> {
        let Some((_, cell)) = self.coordinators.remove(&partition) else {
            return Ok(false);
        };
        if let Some(coordinator) = cell.get() {
            coordinator.close().await?;
            self.factory
                .evict(&TopicName::transaction_log(partition).persistence_name());
            info!(partition, "Transaction coordinator unloaded");
        }
        Ok(true)
    }

    /// Close every loaded coordinator
    pub async fn close(&self) {
        let partitions: Vec<u64> = self.coordinators.iter().map(|e| *e.key()).collect();
        for partition in partitions {
            if let Err(e) = self.remove(partition).await {
                warn!(partition, error = %e, "Failed to close transaction coordinator");
            }
        }
    }
}
