//! Property-based tests for the transactional core
//!
//! Uses proptest to drive random interleavings of transaction operations
//! and checks them against a simple model of what must hold.

use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use streamline_txn::testing::{visible_messages, TestBroker, TestProducer};
use streamline_txn::TxnId;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

#[derive(Debug, Clone, Copy)]
enum CoordinatorOp {
    Open,
    Commit(usize),
    Abort(usize),
}

fn coordinator_op() -> impl Strategy<Value = CoordinatorOp> {
    prop_oneof![
        3 => Just(CoordinatorOp::Open),
        1 => any::<usize>().prop_map(CoordinatorOp::Commit),
        1 => any::<usize>().prop_map(CoordinatorOp::Abort),
    ]
}

#[derive(Debug, Clone, Copy)]
enum TopicOp {
    Send,
    SendTxn(usize),
    Commit(usize),
    Abort(usize),
    Reload,
}

const SLOTS: usize = 3;

fn topic_op() -> impl Strategy<Value = TopicOp> {
    prop_oneof![
        2 => Just(TopicOp::Send),
        4 => (0..SLOTS).prop_map(TopicOp::SendTxn),
        1 => (0..SLOTS).prop_map(TopicOp::Commit),
        1 => (0..SLOTS).prop_map(TopicOp::Abort),
        1 => Just(TopicOp::Reload),
    ]
}

/// Expected reader view of a topic
#[derive(Default)]
struct VisibilityModel {
    entries: Vec<(String, Option<TxnId>)>,
    open: BTreeSet<TxnId>,
    aborted: BTreeSet<TxnId>,
}

impl VisibilityModel {
    fn visible(&self) -> Vec<String> {
        let limit = self
            .entries
            .iter()
            .position(|(_, txn)| txn.is_some_and(|t| self.open.contains(&t)))
            .unwrap_or(self.entries.len());
        self.entries[..limit]
            .iter()
            .filter(|(_, txn)| txn.map_or(true, |t| !self.aborted.contains(&t)))
            .map(|(value, _)| value.clone())
            .collect()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: Sequence numbers follow allocation order whatever ends in between
    #[test]
    fn sequences_are_contiguous(ops in prop::collection::vec(coordinator_op(), 1..40)) {
        let rt = runtime();
        let allocated = rt.block_on(async {
            let test = TestBroker::start().await.unwrap();
            let broker = test.broker();
            let mut allocated: Vec<TxnId> = Vec::new();
            let mut live: Vec<TxnId> = Vec::new();
            for op in ops {
                match op {
                    CoordinatorOp::Open => {
                        let txn = broker.new_transaction(None).await.unwrap();
                        allocated.push(txn);
                        live.push(txn);
                    }
                    CoordinatorOp::Commit(i) if !live.is_empty() => {
                        let txn = live.remove(i % live.len());
                        broker.commit_transaction(txn).await.unwrap();
                    }
                    CoordinatorOp::Abort(i) if !live.is_empty() => {
                        let txn = live.remove(i % live.len());
                        broker.abort_transaction(txn).await.unwrap();
                    }
                    _ => {}
                }
            }
            test.shutdown().await;
            allocated
        });

        for (expected, txn) in allocated.iter().enumerate() {
            prop_assert_eq!(txn.partition(), 0);
            prop_assert_eq!(txn.sequence(), expected as u64);
        }
    }

    /// Property: Readers see exactly the committed prefix before the oldest open transaction
    #[test]
    fn visibility_matches_model(ops in prop::collection::vec(topic_op(), 1..40)) {
        let rt = runtime();
        let (actual, expected) = rt.block_on(async {
            let test = TestBroker::start().await.unwrap();
            let broker = Arc::clone(test.broker());
            let mut topic = test.topic("model").await.unwrap();
            let mut producer = TestProducer::new(topic.clone(), "p");
            let mut slots: BTreeMap<usize, TxnId> = BTreeMap::new();
            let mut model = VisibilityModel::default();

            for (n, op) in ops.into_iter().enumerate() {
                let value = format!("v{n}");
                match op {
                    TopicOp::Send => {
                        producer.send(&value).await.unwrap();
                        model.entries.push((value, None));
                    }
                    TopicOp::SendTxn(slot) => {
                        let txn = match slots.get(&slot) {
                            Some(txn) => *txn,
                            None => {
                                let txn = broker.new_transaction(None).await.unwrap();
                                slots.insert(slot, txn);
                                txn
                            }
                        };
                        producer.send_txn(txn, &value).await.unwrap();
                        model.open.insert(txn);
                        model.entries.push((value, Some(txn)));
                    }
                    TopicOp::Commit(slot) => {
                        if let Some(txn) = slots.remove(&slot) {
                            broker.commit_transaction(txn).await.unwrap();
                            model.open.remove(&txn);
                        }
                    }
                    TopicOp::Abort(slot) => {
                        if let Some(txn) = slots.remove(&slot) {
                            broker.abort_transaction(txn).await.unwrap();
                            model.open.remove(&txn);
                            model.aborted.insert(txn);
                        }
                    }
                    TopicOp::Reload => {
                        broker.unload_topic(topic.name()).await.unwrap();
                        topic = test.topic("model").await.unwrap();
                        producer = TestProducer::new(topic.clone(), "p");
                    }
                }
            }

            let actual = visible_messages(&topic).await.unwrap();
            test.shutdown().await;
            (actual, model.visible())
        });

        prop_assert_eq!(actual, expected);
    }
}
