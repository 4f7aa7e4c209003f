//! Shared fixtures for the transactional core integration tests
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use streamline_txn::buffer::{TransactionBufferSnapshot, TransactionBufferSnapshotStore};
use streamline_txn::error::LedgerError;
use streamline_txn::naming::NamespaceName;
use streamline_txn::storage::{
    LedgerConfig, LedgerEntry, ManagedLedger, ManagedLedgerFactory, MemoryLedgerFactory, Position,
};
use streamline_txn::testing::{test_config, TestBroker};
use streamline_txn::{BrokerService, TopicName, TxnId, TxnStatus};

/// Upper bound for anything a test waits on
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Latest buffer snapshot persisted for `topic`, read straight from storage
pub async fn persisted_snapshot(
    factory: &Arc<MemoryLedgerFactory>,
    topic: &TopicName,
) -> Option<TransactionBufferSnapshot> {
    let namespace: &NamespaceName = topic.namespace();
    let name = namespace.buffer_snapshot_topic();
    if !factory.exists(&name.persistence_name()).await {
        return None;
    }
    let ledger = factory
        .open(&name.persistence_name(), LedgerConfig::standalone(name.to_string()))
        .await
        .expect("open snapshot ledger");
    let store = TransactionBufferSnapshotStore::open(namespace.clone(), ledger, 16)
        .await
        .expect("read snapshot ledger");
    store.latest(&topic.to_string())
}

/// Status of `txn` as seen by its coordinator, `None` once it is finished
pub fn txn_status(test: &TestBroker, txn: TxnId) -> Option<TxnStatus> {
    test.broker().get_txn_status(txn).ok()
}

/// Start a broker and fail the test if it does not come up
pub async fn start_broker() -> TestBroker {
    TestBroker::start().await.expect("start test broker")
}

// ============================================================================
// Slow storage
// ============================================================================

/// In-memory ledgers whose `exists` and `close` take a configurable time
///
/// Widens the windows between a check and the action that depends on it.
#[derive(Default)]
pub struct SlowLedgerFactory {
    inner: MemoryLedgerFactory,
    close_delay_ms: Arc<AtomicU64>,
    exists_delay_ms: AtomicU64,
}

impl SlowLedgerFactory {
    pub fn set_close_delay(&self, delay: Duration) {
        self.close_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_exists_delay(&self, delay: Duration) {
        self.exists_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

async fn pause(delay_ms: u64) {
    if delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
}

#[async_trait]
impl ManagedLedgerFactory for SlowLedgerFactory {
    async fn open(
        &self,
        name: &str,
        config: LedgerConfig,
    ) -> Result<Arc<dyn ManagedLedger>, LedgerError> {
        let inner = self.inner.open(name, config).await?;
        Ok(Arc::new(SlowLedger {
            inner,
            close_delay_ms: self.close_delay_ms.clone(),
        }))
    }

    fn is_open(&self, name: &str) -> bool {
        self.inner.is_open(name)
    }

    fn evict(&self, name: &str) -> Option<Arc<dyn ManagedLedger>> {
        self.inner.evict(name)
    }

    async fn exists(&self, name: &str) -> bool {
        pause(self.exists_delay_ms.load(Ordering::SeqCst)).await;
        self.inner.exists(name).await
    }

    async fn delete(&self, name: &str) -> Result<(), LedgerError> {
        self.inner.delete(name).await
    }

    async fn close_all(&self) {
        self.inner.close_all().await
    }
}

#[derive(Debug)]
struct SlowLedger {
    inner: Arc<dyn ManagedLedger>,
    close_delay_ms: Arc<AtomicU64>,
}

#[async_trait]
impl ManagedLedger for SlowLedger {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn current_ledger_id(&self) -> i64 {
        self.inner.current_ledger_id()
    }

    async fn append(&self, data: Bytes) -> Result<Position, LedgerError> {
        self.inner.append(data).await
    }

    async fn read_entries(
        &self,
        from: Position,
        max: usize,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.inner.read_entries(from, max).await
    }

    fn last_confirmed_position(&self) -> Position {
        self.inner.last_confirmed_position()
    }

    fn first_position(&self) -> Option<Position> {
        self.inner.first_position()
    }

    fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    async fn trim_ledgers_before(&self, ledger_id: i64) -> Result<u64, LedgerError> {
        self.inner.trim_ledgers_before(ledger_id).await
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    async fn close(&self) -> Result<(), LedgerError> {
        pause(self.close_delay_ms.load(Ordering::SeqCst)).await;
        self.inner.close().await
    }

    fn config(&self) -> &LedgerConfig {
        self.inner.config()
    }
}

/// Broker with test timers on top of `factory`, coordinators loaded
pub async fn start_broker_on(factory: Arc<dyn ManagedLedgerFactory>) -> Arc<BrokerService> {
    let broker = BrokerService::with_factory(test_config(), factory).expect("create broker");
    broker.load_coordinators().await.expect("load coordinators");
    broker
}
