//! Benchmarks for work queue operations using criterion.
//!
//! These benchmarks measure the cost of the queue primitives workers rely on:
//! - Single key add
//! - Duplicate adds collapsing onto a pending key
//! - Batch add followed by a full drain
//! - Failure path (add_rate_limited, forget)
//! - Controller throughput (source notification to completed sync)

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ctrlkit::{
    CancellationToken, Controller, ControllerConfig, FatalPolicy, InMemoryRecorder,
    ItemExponentialRateLimiter, WorkQueue,
};
use ctrlkit_testkit::{FakeSource, RecordingReconciler, TestObject};
use tokio::runtime::Runtime;

/// Creates a tokio runtime for async benchmarks.
fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn bench_add_single(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("add_single");
    group.sample_size(100);

    group.bench_function("add_get_done", |b| {
        let queue = WorkQueue::new("bench");

        b.to_async(&rt).iter(|| async {
            queue.add("ns/object");
            let key = queue.get().await.expect("queue should yield a key");
            queue.done(&key);
        });
    });

    group.finish();
}

/// Adding a key that is already pending only touches the dirty set.
fn bench_add_duplicate(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_duplicate");

    group.bench_function("pending_key", |b| {
        let queue = WorkQueue::new("bench");
        queue.add("ns/object");
        b.iter(|| queue.add("ns/object"));
    });

    group.finish();
}

fn bench_add_drain(c: &mut Criterion) {
    let rt = create_runtime();
    let batch_sizes = [10_usize, 100, 1000];

    let mut group = c.benchmark_group("add_drain");
    group.sample_size(50);

    for batch_size in batch_sizes {
        let keys: Vec<String> = (0..batch_size).map(|i| format!("ns/object-{i}")).collect();

        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(BenchmarkId::new("keys", batch_size), &keys, |b, keys| {
            let queue = WorkQueue::new("bench");

            b.to_async(&rt).iter(|| async {
                for key in keys {
                    queue.add(key);
                }
                for _ in 0..keys.len() {
                    let key = queue.get().await.expect("queue should yield a key");
                    queue.done(&key);
                }
            });
        });
    }

    group.finish();
}

fn bench_rate_limited(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limited");

    group.bench_function("add_rate_limited_forget", |b| {
        // Long base delay keeps keys parked in the delayed set.
        let limiter = ItemExponentialRateLimiter::new(Duration::from_secs(60), Duration::from_secs(600));
        let queue = WorkQueue::with_rate_limiter("bench", Arc::new(limiter));

        b.iter(|| {
            queue.add_rate_limited("ns/object");
            queue.forget("ns/object");
        });
    });

    group.finish();
}

fn bench_controller_throughput(c: &mut Criterion) {
    let rt = create_runtime();
    let worker_counts = [1_usize, 4, 16];
    const KEYS: usize = 500;

    let mut group = c.benchmark_group("controller_throughput");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(20));
    group.throughput(Throughput::Elements(KEYS as u64));

    for workers in worker_counts {
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, &workers| {
            b.to_async(&rt).iter(|| async move {
                let reconciler = RecordingReconciler::new();
                let source = Arc::new(FakeSource::<TestObject>::synced());
                let controller = Controller::builder()
                    .with_config(ControllerConfig::default().with_fatal_policy(FatalPolicy::Return))
                    .with_reconciler(reconciler.clone())
                    .with_source_keys(Arc::clone(&source), TestObject::queue_keys())
                    .build("bench", &InMemoryRecorder::new("bench"))
                    .expect("build controller");

                let shutdown = CancellationToken::new();
                let run = tokio::spawn({
                    let controller = controller.clone();
                    let shutdown = shutdown.clone();
                    async move { controller.run(shutdown, workers).await }
                });

                for i in 0..KEYS {
                    source.add(TestObject::new("bench", format!("object-{i}")));
                }
                assert!(reconciler.wait_for_calls(KEYS, Duration::from_secs(30)).await);

                shutdown.cancel();
                run.await
                    .expect("run task panicked")
                    .expect("run failed");
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_add_single,
    bench_add_duplicate,
    bench_add_drain,
    bench_rate_limited,
    bench_controller_throughput,
);
criterion_main!(benches);
