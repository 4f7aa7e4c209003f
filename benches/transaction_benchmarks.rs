//! Benchmarks for the transactional publish and acknowledge paths
//!
//! Run with: cargo bench --bench transaction_benchmarks
//!
//! These benchmarks measure:
//! - Plain publish vs publish inside an open transaction
//! - A full open / publish / commit cycle by batch size
//! - Transactional acknowledgment followed by commit

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use streamline_txn::testing::TestBroker;
use streamline_txn::{AckKind, PublishContext};

/// Benchmark plain and transactional single-message publishes
fn bench_publish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let test = rt.block_on(TestBroker::start()).unwrap();
    let topic = rt.block_on(test.topic("bench-publish")).unwrap();
    let txn = rt.block_on(test.broker().new_transaction(Some(600_000))).unwrap();
    let value = Bytes::from(vec![b'x'; 100]);

    let mut group = c.benchmark_group("publish");
    group.throughput(Throughput::Elements(1));

    group.bench_function("plain_100b", |b| {
        b.to_async(&rt).iter(|| {
            let topic = topic.clone();
            let value = value.clone();
            async move {
                let receipt = topic
                    .publish(PublishContext::single("bench", 0), black_box(value))
                    .await
                    .unwrap();
                black_box(receipt);
            }
        });
    });

    group.bench_function("txn_100b", |b| {
        b.to_async(&rt).iter(|| {
            let topic = topic.clone();
            let value = value.clone();
            async move {
                let receipt = topic
                    .publish_txn_message(txn, PublishContext::single("bench", 0), black_box(value))
                    .await
                    .unwrap();
                black_box(receipt);
            }
        });
    });

    group.finish();
    rt.block_on(test.shutdown());
}

/// Benchmark open, publish `n` messages, commit
fn bench_commit_cycle(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let test = rt.block_on(TestBroker::start()).unwrap();
    let topic = rt.block_on(test.topic("bench-commit")).unwrap();
    let value = Bytes::from(vec![b'x'; 100]);

    let mut group = c.benchmark_group("commit_cycle");
    for batch in [1u64, 10, 100] {
        group.throughput(Throughput::Elements(batch));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.to_async(&rt).iter(|| {
                let broker = test.broker().clone();
                let topic = topic.clone();
                let value = value.clone();
                async move {
                    let txn = broker.new_transaction(None).await.unwrap();
                    for seq in 0..batch as i64 {
                        topic
                            .publish_txn_message(txn, PublishContext::single("bench", seq), value.clone())
                            .await
                            .unwrap();
                    }
                    broker.commit_transaction(txn).await.unwrap();
                }
            });
        });
    }

    group.finish();
    rt.block_on(test.shutdown());
}

/// Benchmark a transactional ack of one message followed by commit
fn bench_ack_commit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let test = rt.block_on(TestBroker::start()).unwrap();
    let topic = rt.block_on(test.topic("bench-ack")).unwrap();
    let subscription = topic.get_or_create_subscription("bench");

    c.bench_function("ack_commit", |b| {
        b.to_async(&rt).iter(|| {
            let broker = test.broker().clone();
            let topic = topic.clone();
            let subscription = subscription.clone();
            async move {
                let receipt = topic
                    .publish(PublishContext::single("bench", 0), Bytes::from_static(b"m"))
                    .await
                    .unwrap();
                let txn = broker.new_transaction(None).await.unwrap();
                subscription
                    .acknowledge_txn(txn, vec![receipt.position], AckKind::Individual)
                    .await
                    .unwrap();
                broker.commit_transaction(txn).await.unwrap();
            }
        });
    });

    rt.block_on(test.shutdown());
}

criterion_group!(benches, bench_publish, bench_commit_cycle, bench_ack_commit);

criterion_main!(benches);
