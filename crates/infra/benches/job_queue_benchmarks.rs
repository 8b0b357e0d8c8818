use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use firelancer_infra::jobs::{InMemoryJobStore, JobBufferStore, JobOutcome, JobStore, NewJob};
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

fn payload(n: usize) -> serde_json::Value {
    serde_json::json!({ "assetId": format!("asset-{n}"), "size": n })
}

/// Enqueue a batch, then claim and complete every job.
fn bench_claim_settle_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_settle_throughput");

    for batch_size in [10usize, 100, 1_000] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &batch_size| {
                b.iter(|| {
                    rt.block_on(async {
                        let store = InMemoryJobStore::new();
                        for n in 0..batch_size {
                            store.create(NewJob::new("bench", payload(n))).await.unwrap();
                        }
                        while let Some(job) = store.claim_next("bench").await.unwrap() {
                            let done = store
                                .settle(job.id, JobOutcome::Completed(serde_json::Value::Null))
                                .await
                                .unwrap();
                            black_box(done);
                        }
                    })
                });
            },
        );
    }

    group.finish();
}

/// Claim cost when the queue is deep and mostly made of other queues' jobs.
fn bench_claim_from_mixed_store(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_from_mixed_store");

    for backlog in [100usize, 10_000] {
        let store = InMemoryJobStore::new();
        rt.block_on(async {
            for n in 0..backlog {
                store.create(NewJob::new("other", payload(n))).await.unwrap();
            }
        });

        group.bench_with_input(BenchmarkId::from_parameter(backlog), &backlog, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let job = store.create(NewJob::new("target", payload(0))).await.unwrap();
                    let claimed = store.claim_next("target").await.unwrap();
                    store.settle(job.id, JobOutcome::Cancelled).await.unwrap();
                    black_box(claimed)
                })
            });
        });
    }

    group.finish();
}

fn bench_buffer_flush(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("buffer_flush");

    for batch_size in [10usize, 500] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &batch_size| {
                b.iter(|| {
                    rt.block_on(async {
                        let store = InMemoryJobStore::new();
                        for n in 0..batch_size {
                            store.add("digest", NewJob::new("digest", payload(n))).await.unwrap();
                        }
                        black_box(store.flush("digest").await.unwrap())
                    })
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_claim_settle_throughput,
    bench_claim_from_mixed_store,
    bench_buffer_flush
);
criterion_main!(benches);
