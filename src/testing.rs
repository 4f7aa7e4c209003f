//! Testing utilities for the transactional core
//!
//! # Features
//!
//! - **TestBroker**: In-process broker on in-memory ledgers with short timers
//! - **TestProducer**: Publishes numbered messages with a producer identity
//! - **wait_until**: Polls a condition until it holds or a timeout elapses
//!
//! # Example
//!
//! ```ignore
//! use streamline_txn::testing::TestBroker;
//!
//! #[tokio::test]
//! async fn test_commit() {
//!     let test = TestBroker::start().await.unwrap();
//!     let topic = test.topic("orders").await.unwrap();
//!
//!     let txn = test.broker().new_transaction(None).await.unwrap();
//!     test.producer(&topic, "p1").send_txn(txn, "hello").await.unwrap();
//!     test.broker().commit_transaction(txn).await.unwrap();
//! }
//! ```

use bytes::Bytes;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::broker::BrokerService;
use crate::config::BrokerConfig;
use crate::error::Result;
use crate::naming::{NamespaceName, TopicName};
use crate::storage::{MemoryLedgerFactory, Position};
use crate::topic::{PersistentTopic, PublishContext, PublishResult};
use crate::transaction::TxnId;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Poll `condition` until it returns true or `timeout` elapses
pub async fn wait_until<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Broker configuration with in-memory storage and fast timers
pub fn test_config() -> BrokerConfig {
    let mut config = BrokerConfig::in_memory();
    config.transaction.coordinator_partitions = 1;
    config.transaction.min_timeout_ms = 1;
    config.transaction.timeout_check_interval_ms = 20;
    config.transaction.notify_min_backoff_ms = 5;
    config.transaction.notify_max_backoff_ms = 50;
    config.storage.replay_batch_size = 16;
    config
}

// ============================================================================
// Test Instance
// ============================================================================

/// In-process broker for tests
///
/// Coordinators are loaded on start. The ledger factory is exposed so tests
/// can reach under the broker, for example to delete a ledger out-of-band.
pub struct TestBroker {
    broker: Arc<BrokerService>,
    factory: Arc<MemoryLedgerFactory>,
    namespace: NamespaceName,
}

impl TestBroker {
    /// Start a broker with [`test_config`]
    pub async fn start() -> Result<Self> {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: BrokerConfig) -> Result<Self> {
        Self::on_factory(config, Arc::new(MemoryLedgerFactory::new())).await
    }

    /// Start a broker over an existing factory, keeping the data of a previous one
    pub async fn on_factory(config: BrokerConfig, factory: Arc<MemoryLedgerFactory>) -> Result<Self> {
        let broker = BrokerService::with_factory(config, factory.clone())?;
        broker.load_coordinators().await?;
        Ok(Self {
            broker,
            factory,
            namespace: NamespaceName::new("tnx", "ns1"),
        })
    }

    pub fn broker(&self) -> &Arc<BrokerService> {
        &self.broker
    }

    pub fn factory(&self) -> &Arc<MemoryLedgerFactory> {
        &self.factory
    }

    pub fn namespace(&self) -> &NamespaceName {
        &self.namespace
    }

    /// Full name of topic `local` in the test namespace
    pub fn topic_name(&self, local: &str) -> TopicName {
        TopicName::new(self.namespace.clone(), local)
    }

    /// Load or create topic `local` in the test namespace
    pub async fn topic(&self, local: &str) -> Result<Arc<PersistentTopic>> {
        self.broker.get_or_create_topic(&self.topic_name(local)).await
    }

    /// Producer publishing to `topic` with increasing sequence ids
    pub fn producer(&self, topic: &Arc<PersistentTopic>, name: &str) -> TestProducer {
        TestProducer::new(topic.clone(), name)
    }

    pub async fn shutdown(&self) {
        self.broker.close().await;
    }
}

// ============================================================================
// Test Producer
// ============================================================================

/// Publishes string payloads with a producer identity
pub struct TestProducer {
    topic: Arc<PersistentTopic>,
    name: String,
    next_sequence: AtomicI64,
}

impl TestProducer {
    pub fn new(topic: Arc<PersistentTopic>, name: impl Into<String>) -> Self {
        Self {
            topic,
            name: name.into(),
            next_sequence: AtomicI64::new(0),
        }
    }

    fn context(&self) -> PublishContext {
        let sequence_id = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        PublishContext::single(self.name.clone(), sequence_id)
    }

    /// Attach to the topic the way a connecting producer does
    pub async fn attach(&self) -> Result<()> {
        self.topic.add_producer(&self.name).await
    }

    pub async fn send(&self, value: &str) -> PublishResult {
        self.topic
            .publish(self.context(), Bytes::copy_from_slice(value.as_bytes()))
            .await
    }

    pub async fn send_txn(&self, txn_id: TxnId, value: &str) -> PublishResult {
        self.topic
            .publish_txn_message(txn_id, self.context(), Bytes::copy_from_slice(value.as_bytes()))
            .await
    }

    /// Number of messages sent so far
    pub fn messages_sent(&self) -> i64 {
        self.next_sequence.load(Ordering::Relaxed)
    }
}

/// Payloads visible on `topic`, from the beginning, as strings
pub async fn visible_messages(topic: &PersistentTopic) -> Result<Vec<String>> {
    let entries = topic.read_committed(Position::EARLIEST, usize::MAX).await?;
    Ok(entries
        .into_iter()
        .map(|e| String::from_utf8_lossy(&e.payload).into_owned())
        .collect())
}
