//! Broker restarts on file-backed storage
//!
//! Each test runs a broker on a temporary data directory, stops it and starts
//! a new broker on the same directory. The new broker must rebuild the
//! coordinator, the transaction buffers and the pending-ack stores from the
//! segment files alone.

use std::sync::Arc;
use streamline_txn::testing::{test_config, visible_messages, TestProducer};
use streamline_txn::{
    AckKind, BrokerConfig, BrokerService, StreamlineError, TopicName, TxnId, TxnStatus,
};
use tempfile::TempDir;

fn disk_config(dir: &TempDir) -> BrokerConfig {
    let mut config = test_config();
    config.storage.in_memory = false;
    config.storage.data_dir = dir.path().to_path_buf();
    // Snapshots only when a test asks for one
    config.transaction.snapshot_min_interval_ms = 600_000;
    config
}

async fn start_on_disk(dir: &TempDir) -> Arc<BrokerService> {
    BrokerService::start(disk_config(dir))
        .await
        .expect("start broker on disk")
}

fn topic_name(local: &str) -> TopicName {
    TopicName::parse(&format!("persistent://tnx/ns1/{}", local)).unwrap()
}

#[tokio::test]
async fn test_sequences_continue_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let (open, committed) = {
        let broker = start_on_disk(&dir).await;
        let open = broker.new_transaction(None).await.unwrap();
        let committed = broker.new_transaction(None).await.unwrap();
        let aborted = broker.new_transaction(None).await.unwrap();
        broker.commit_transaction(committed).await.unwrap();
        broker.abort_transaction(aborted).await.unwrap();
        broker.close().await;
        (open, committed)
    };

    let broker = start_on_disk(&dir).await;
    assert_eq!(broker.get_txn_status(open).unwrap(), TxnStatus::Open);
    assert!(matches!(
        broker.get_txn_status(committed),
        Err(StreamlineError::TransactionNotFound(_))
    ));
    assert_eq!(broker.new_transaction(None).await.unwrap(), TxnId::new(0, 3));
    broker.close().await;
}

#[tokio::test]
async fn test_buffer_recovers_from_snapshot_and_tail() {
    let dir = tempfile::tempdir().unwrap();
    let name = topic_name("orders");
    let (aborted, committed, open) = {
        let broker = start_on_disk(&dir).await;
        let topic = broker.get_or_create_topic(&name).await.unwrap();
        let producer = TestProducer::new(topic.clone(), "p");
        producer.attach().await.unwrap();

        let aborted = broker.new_transaction(None).await.unwrap();
        producer.send_txn(aborted, "gone").await.unwrap();
        broker.abort_transaction(aborted).await.unwrap();
        producer.send("n0").await.unwrap();
        topic.transaction_buffer().take_snapshot().await.unwrap();

        let committed = broker.new_transaction(None).await.unwrap();
        let open = broker.new_transaction(None).await.unwrap();
        producer.send_txn(committed, "c").await.unwrap();
        producer.send_txn(open, "o").await.unwrap();
        broker.commit_transaction(committed).await.unwrap();
        producer.send("n1").await.unwrap();

        // Crash: closing the ledger first leaves no final snapshot behind
        topic.ledger().close().await.unwrap();
        broker.close().await;
        (aborted, committed, open)
    };

    let broker = start_on_disk(&dir).await;
    let topic = broker.get_or_create_topic(&name).await.unwrap();
    let buffer = topic.transaction_buffer();
    assert_eq!(buffer.stats().snapshot_sequence, 2);
    assert!(buffer.is_aborted(aborted));
    assert!(buffer.is_committed(committed));
    assert!(buffer.is_ongoing(open));
    assert_eq!(visible_messages(&topic).await.unwrap(), vec!["n0", "c"]);

    broker.commit_transaction(open).await.unwrap();
    assert_eq!(
        visible_messages(&topic).await.unwrap(),
        vec!["n0", "c", "o", "n1"]
    );
    broker.close().await;
}

#[tokio::test]
async fn test_pending_acks_replayed_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let name = topic_name("billing");
    let (txn, position) = {
        let broker = start_on_disk(&dir).await;
        let topic = broker.get_or_create_topic(&name).await.unwrap();
        let subscription = topic.get_or_create_subscription("sub");
        let sent = TestProducer::new(topic.clone(), "p")
            .send("m0")
            .await
            .unwrap();

        let txn = broker.new_transaction(None).await.unwrap();
        subscription
            .acknowledge_txn(txn, vec![sent.position], AckKind::Individual)
            .await
            .unwrap();
        broker.close().await;
        (txn, sent.position)
    };

    let broker = start_on_disk(&dir).await;
    assert_eq!(broker.get_txn_status(txn).unwrap(), TxnStatus::Open);
    let topic = broker.get_or_create_topic(&name).await.unwrap();
    let handle = topic
        .get_or_create_subscription("sub")
        .pending_ack_handle()
        .await
        .unwrap();
    assert_eq!(handle.pending_transactions(), vec![txn]);
    assert!(handle.is_pending(position));

    broker.commit_transaction(txn).await.unwrap();
    assert!(handle.pending_transactions().is_empty());
    assert!(!handle.is_pending(position));
    broker.close().await;
}
