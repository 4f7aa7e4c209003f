//! Topic, subscription and namespace lifecycle

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use streamline_txn::naming::NamespaceName;
use streamline_txn::storage::ManagedLedgerFactory;
use streamline_txn::testing::{visible_messages, TestProducer};
use streamline_txn::{AckKind, RetentionPolicy, StreamlineError, TopicName, TxnId, TxnStatus};

#[tokio::test]
async fn test_concurrent_loads_share_one_topic() {
    let test = start_broker().await;
    let name = test.topic_name("shared");

    let (a, b) = tokio::join!(
        test.broker().get_or_create_topic(&name),
        test.broker().get_or_create_topic(&name)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(a.transaction_buffer(), b.transaction_buffer()));
}

#[tokio::test]
async fn test_internal_store_names_are_not_topics() {
    let test = start_broker().await;
    let store = test.topic_name("orders").pending_ack_store("sub");

    let err = test.broker().get_or_create_topic(&store).await.unwrap_err();
    assert!(matches!(err, StreamlineError::InvalidTopicName(_)));
    let err = test
        .broker()
        .get_or_create_topic(&TopicName::transaction_log(0))
        .await
        .unwrap_err();
    assert!(matches!(err, StreamlineError::InvalidTopicName(_)));
}

#[tokio::test]
async fn test_create_after_out_of_band_delete_conflicts_until_forgotten() {
    let test = start_broker().await;
    let name = test.topic_name("removed");

    let topic = test.broker().create_non_partitioned_topic(&name).await.unwrap();
    test.producer(&topic, "p").send("old").await.unwrap();

    test.factory().delete(&name.persistence_name()).await.unwrap();
    assert!(!test.factory().exists(&name.persistence_name()).await);

    let err = test
        .broker()
        .create_non_partitioned_topic(&name)
        .await
        .unwrap_err();
    assert!(matches!(err, StreamlineError::Conflict(_)));

    assert!(test.broker().forget_topic(&name).await);
    assert!(!test.broker().is_topic_registered(&name));

    let fresh = test.broker().create_non_partitioned_topic(&name).await.unwrap();
    assert!(!Arc::ptr_eq(&topic, &fresh));
    assert!(visible_messages(&fresh).await.unwrap().is_empty());

    test.producer(&fresh, "p").send("new").await.unwrap();
    assert_eq!(visible_messages(&fresh).await.unwrap(), vec!["new"]);
}

#[tokio::test]
async fn test_concurrent_creates_conflict() {
    let factory = Arc::new(SlowLedgerFactory::default());
    let broker = start_broker_on(factory.clone()).await;
    factory.set_exists_delay(Duration::from_millis(20));
    let name = TopicName::parse("persistent://tnx/ns1/raced").unwrap();

    let (a, b) = tokio::join!(
        broker.create_non_partitioned_topic(&name),
        broker.create_non_partitioned_topic(&name)
    );
    let conflicts = [&a, &b]
        .iter()
        .filter(|r| matches!(r, Err(StreamlineError::Conflict(_))))
        .count();
    assert_eq!(conflicts, 1);
    assert!(a.is_ok() || b.is_ok());
    assert!(broker.is_topic_registered(&name));
    broker.close().await;
}

#[tokio::test]
async fn test_reload_during_unload_waits_for_close() {
    let factory = Arc::new(SlowLedgerFactory::default());
    let broker = start_broker_on(factory.clone()).await;
    let name = TopicName::parse("persistent://tnx/ns1/reload").unwrap();

    let topic = broker.get_or_create_topic(&name).await.unwrap();
    TestProducer::new(topic.clone(), "p").send("before").await.unwrap();

    factory.set_close_delay(Duration::from_millis(100));
    let unload = tokio::spawn({
        let broker = broker.clone();
        let name = name.clone();
        async move { broker.unload_topic(&name).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!broker.is_topic_registered(&name));

    let reloaded = broker.get_or_create_topic(&name).await.unwrap();
    assert!(unload.is_finished());
    assert!(unload.await.unwrap().unwrap());
    factory.set_close_delay(Duration::ZERO);

    assert!(!Arc::ptr_eq(&topic, &reloaded));
    assert!(!reloaded.ledger().is_closed());
    TestProducer::new(reloaded.clone(), "p")
        .send("after")
        .await
        .unwrap();
    assert_eq!(
        visible_messages(&reloaded).await.unwrap(),
        vec!["before", "after"]
    );
    broker.close().await;
}

#[tokio::test]
async fn test_create_existing_topic_conflicts() {
    let test = start_broker().await;
    let name = test.topic_name("twice");

    test.broker().create_non_partitioned_topic(&name).await.unwrap();
    let err = test
        .broker()
        .create_non_partitioned_topic(&name)
        .await
        .unwrap_err();
    assert!(matches!(err, StreamlineError::Conflict(_)));
}

#[tokio::test]
async fn test_pending_ack_store_uses_subscription_retention() {
    let test = start_broker().await;
    let name = test.topic_name("retained");
    let policies = test.broker().policies();

    policies.set_retention(&name.to_string(), RetentionPolicy::new(10, 10));
    let store_name = name.pending_ack_store("sub");
    policies.set_retention(&store_name.to_string(), RetentionPolicy::new(6, 6));

    let topic = test.topic("retained").await.unwrap();
    let subscription = topic.get_or_create_subscription("sub");
    assert_eq!(subscription.pending_ack_store_name(), store_name);

    let handle = subscription.pending_ack_handle().await.unwrap();
    assert_eq!(handle.retention(), RetentionPolicy::new(6, 6));
    assert_eq!(topic.ledger().config().retention(), RetentionPolicy::new(10, 10));

    // Changes on the store name reach the live instance
    policies.set_retention(&store_name.to_string(), RetentionPolicy::new(5, 5));
    assert_eq!(handle.retention(), RetentionPolicy::new(5, 5));

    // Topic changes do not
    policies.set_retention(&name.to_string(), RetentionPolicy::new(1, 1));
    assert_eq!(handle.retention(), RetentionPolicy::new(5, 5));
}

#[tokio::test]
async fn test_pending_ack_store_falls_back_to_topic_retention() {
    let test = start_broker().await;
    let name = test.topic_name("inherit");
    test.broker()
        .policies()
        .set_retention(&name.to_string(), RetentionPolicy::new(30, 100));

    let topic = test.topic("inherit").await.unwrap();
    let handle = topic
        .get_or_create_subscription("sub")
        .pending_ack_handle()
        .await
        .unwrap();
    assert_eq!(handle.retention(), RetentionPolicy::new(30, 100));
}

#[tokio::test]
async fn test_unload_releases_every_registry_entry() {
    let test = start_broker().await;
    let broker = test.broker();
    let factory = test.factory();
    let namespace = test.namespace().clone();
    let name = test.topic_name("unload");

    let topic = test.topic("unload").await.unwrap();
    let subscription = topic.get_or_create_subscription("sub");
    let sent = test.producer(&topic, "p").send("m0").await.unwrap();
    let txn = broker.new_transaction(None).await.unwrap();
    subscription
        .acknowledge_txn(txn, vec![sent.position], AckKind::Individual)
        .await
        .unwrap();

    let pending_ack = subscription.pending_ack_store_name().persistence_name();
    let txn_log = TopicName::transaction_log(0).persistence_name();
    let assign = TopicName::coordinator_assign(0);
    assert!(factory.is_open(&pending_ack));
    assert!(factory.is_open(&txn_log));
    assert!(broker.is_topic_registered(&assign));

    broker.unload_namespace(&namespace).await.unwrap();
    broker.unload_namespace(&NamespaceName::system()).await.unwrap();

    assert!(!broker.is_topic_registered(&name));
    assert!(!broker.is_topic_registered(&assign));
    assert!(!broker.coordinators().is_loaded(0));
    assert!(!factory.is_open(&pending_ack));
    assert!(!factory.is_open(&txn_log));
    assert!(!factory.is_open(&name.persistence_name()));
    let err = broker.get_txn_status(txn).unwrap_err();
    assert!(matches!(err, StreamlineError::CoordinatorUnavailable { .. }));

    // Reloading goes through recovery
    broker.load_coordinators().await.unwrap();
    assert!(broker.is_topic_registered(&assign));
    assert_eq!(txn_status(&test, txn), Some(TxnStatus::Open));
    assert_eq!(broker.new_transaction(None).await.unwrap(), TxnId::new(0, 1));

    let reloaded = test.topic("unload").await.unwrap();
    assert!(!Arc::ptr_eq(&topic, &reloaded));
    assert!(reloaded.get_subscription("sub").is_none());
    assert_eq!(visible_messages(&reloaded).await.unwrap(), vec!["m0"]);

    let handle = reloaded
        .get_or_create_subscription("sub")
        .pending_ack_handle()
        .await
        .unwrap();
    assert_eq!(handle.pending_transactions(), vec![txn]);
}

#[tokio::test]
async fn test_closed_broker_rejects_requests() {
    let test = start_broker().await;
    test.shutdown().await;

    let err = test.broker().new_transaction(None).await.unwrap_err();
    assert!(matches!(err, StreamlineError::ShuttingDown));
    let err = test.topic("late").await.unwrap_err();
    assert!(matches!(err, StreamlineError::ShuttingDown));
}
