use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use chrono::Utc;
use portaljobs_infra::config::QueueTable;
use portaljobs_infra::jobs::{
    InMemoryJobStore, Job, JobStore, Queue, QueueRouter, RetryPolicy, WorkerId,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

fn seeded_store(rt: &Runtime, jobs: usize) -> Arc<InMemoryJobStore> {
    let store = InMemoryJobStore::arc();
    let route = QueueRouter::new(QueueTable::default(), Vec::new()).route("feed.refresh", None);
    let now = Utc::now();
    rt.block_on(async {
        for i in 0..jobs {
            let job = Job::new("feed.refresh", serde_json::json!({ "n": i }), route, now, now);
            store.insert(job).await.unwrap();
        }
    });
    store
}

/// Claim every job in a queue, one claim per call.
fn bench_claim_drain(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let worker = WorkerId::new("bench-worker").unwrap();

    let mut group = c.benchmark_group("claim_drain");
    for size in [100usize, 1_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || seeded_store(&rt, size),
                |store| {
                    rt.block_on(async {
                        let now = Utc::now();
                        while let Some(job) =
                            store.claim_next(Queue::Default, &worker, now).await.unwrap()
                        {
                            black_box(job.id);
                        }
                    })
                },
                criterion::BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

/// Concurrent workers draining the same queue.
fn bench_contended_claims(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("contended_claims");
    for workers in [1usize, 4, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &workers| {
            b.iter_batched(
                || seeded_store(&rt, 500),
                |store| {
                    rt.block_on(async {
                        let mut tasks = Vec::with_capacity(workers);
                        for n in 0..workers {
                            let store = store.clone();
                            let worker = WorkerId::new(format!("bench-{n}")).unwrap();
                            tasks.push(tokio::spawn(async move {
                                let now = Utc::now();
                                let mut claimed = 0u32;
                                while store
                                    .claim_next(Queue::Default, &worker, now)
                                    .await
                                    .unwrap()
                                    .is_some()
                                {
                                    claimed += 1;
                                }
                                claimed
                            }));
                        }
                        for t in tasks {
                            black_box(t.await.unwrap());
                        }
                    })
                },
                criterion::BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

fn bench_backoff(c: &mut Criterion) {
    let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(3600));

    c.bench_function("backoff_next_delay", |b| {
        b.iter(|| {
            for attempt in 0..16 {
                black_box(policy.next_delay(black_box(attempt)));
            }
        })
    });
}

criterion_group!(
    benches,
    bench_claim_drain,
    bench_contended_claims,
    bench_backoff
);
criterion_main!(benches);
