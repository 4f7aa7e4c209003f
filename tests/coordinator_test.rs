//! Coordinator behaviour observed through the broker

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use streamline_txn::testing::{test_config, visible_messages, wait_until, TestBroker};
use streamline_txn::{StreamlineError, TxnId, TxnStatus};

#[tokio::test]
async fn test_sequences_follow_call_order() {
    let test = start_broker().await;
    let broker = test.broker();

    let a = broker.new_transaction(None).await.unwrap();
    let b = broker.new_transaction(None).await.unwrap();
    broker.commit_transaction(a).await.unwrap();
    let c = broker.new_transaction(None).await.unwrap();
    broker.abort_transaction(b).await.unwrap();

    assert_eq!(a, TxnId::new(0, 0));
    assert_eq!(b, TxnId::new(0, 1));
    assert_eq!(c, TxnId::new(0, 2));
}

#[tokio::test]
async fn test_sequence_not_reused_after_abort() {
    let test = start_broker().await;
    let broker = test.broker();

    let first = broker.new_transaction(None).await.unwrap();
    assert_eq!(first.sequence(), 0);
    broker.abort_transaction(first).await.unwrap();

    let next = broker.new_transaction(None).await.unwrap();
    assert_eq!(next.sequence(), 1);
}

#[tokio::test]
async fn test_end_twice_is_rejected() {
    let test = start_broker().await;
    let broker = test.broker();

    let txn = broker.new_transaction(None).await.unwrap();
    broker.commit_transaction(txn).await.unwrap();
    let err = broker.abort_transaction(txn).await.unwrap_err();
    assert!(matches!(err, StreamlineError::TransactionNotFound(_)));
}

#[tokio::test]
async fn test_sequences_continue_after_restart() {
    let test = start_broker().await;
    let open = test.broker().new_transaction(None).await.unwrap();
    let done = test.broker().new_transaction(None).await.unwrap();
    test.broker().commit_transaction(done).await.unwrap();
    let factory = test.factory().clone();
    test.shutdown().await;

    let restarted = TestBroker::on_factory(test_config(), factory).await.unwrap();
    assert_eq!(txn_status(&restarted, open), Some(TxnStatus::Open));
    assert_eq!(txn_status(&restarted, done), None);

    let next = restarted.broker().new_transaction(None).await.unwrap();
    assert_eq!(next, TxnId::new(0, 2));
}

#[tokio::test]
async fn test_partitions_are_used_round_robin() {
    let mut config = test_config();
    config.transaction.coordinator_partitions = 3;
    let test = TestBroker::with_config(config).await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(test.broker().new_transaction(None).await.unwrap());
    }
    let partitions: Vec<u64> = ids.iter().map(|id| id.partition()).collect();
    assert_eq!(partitions, vec![0, 1, 2, 0, 1, 2]);
    assert!(ids.iter().skip(3).all(|id| id.sequence() == 1));
}

#[tokio::test]
async fn test_timed_out_transaction_is_aborted() {
    let test = start_broker().await;
    let topic = test.topic("timeouts").await.unwrap();
    let producer = test.producer(&topic, "p");

    let txn = test.broker().new_transaction(Some(30)).await.unwrap();
    producer.send_txn(txn, "late").await.unwrap();

    assert!(wait_until(|| txn_status(&test, txn).is_none(), TEST_TIMEOUT).await);
    assert!(topic.transaction_buffer().is_aborted(txn));
    assert!(visible_messages(&topic).await.unwrap().is_empty());

    let err = producer.send_txn(txn, "after").await.unwrap_err();
    assert!(matches!(err.error(), StreamlineError::TransactionNotFound(_)));
}

#[tokio::test]
async fn test_unreachable_participant_keeps_transaction_committing() {
    let test = start_broker().await;
    let name = test.topic_name("stuck");
    let topic = test.topic("stuck").await.unwrap();
    let txn = test.broker().new_transaction(None).await.unwrap();
    test.producer(&topic, "p").send_txn(txn, "x").await.unwrap();

    // The participant can no longer write its commit marker
    topic.ledger().close().await.unwrap();

    let committing = {
        let broker = Arc::clone(test.broker());
        tokio::spawn(async move { broker.commit_transaction(txn).await })
    };
    assert!(
        wait_until(
            || txn_status(&test, txn) == Some(TxnStatus::Committing),
            TEST_TIMEOUT
        )
        .await
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(txn_status(&test, txn), Some(TxnStatus::Committing));
    assert!(!committing.is_finished());

    // A reload brings the participant back and the retry goes through
    assert!(test.broker().unload_topic(&name).await.unwrap());
    tokio::time::timeout(TEST_TIMEOUT, committing)
        .await
        .expect("commit finished")
        .unwrap()
        .unwrap();
    assert_eq!(txn_status(&test, txn), None);

    let reloaded = test.topic("stuck").await.unwrap();
    assert_eq!(visible_messages(&reloaded).await.unwrap(), vec!["x"]);
}

#[tokio::test]
async fn test_unloaded_coordinator_is_unavailable() {
    let test = start_broker().await;
    assert!(test.broker().coordinators().remove(0).await.unwrap());

    let err = test.broker().new_transaction(None).await.unwrap_err();
    assert!(matches!(err, StreamlineError::CoordinatorUnavailable { .. }));
    assert!(err.is_retriable());

    test.broker().load_coordinator(0).await.unwrap();
    assert!(test.broker().new_transaction(None).await.is_ok());
}
