use criterion::{black_box, criterion_group, criterion_main, Criterion};
use autotest::batch::{BatchCounts, BatchId, BatchSnapshot, ExecutionStatus};
use autotest::credentials::{CredentialPool, PoolConfig, ProviderConfig, ProviderKind};
use autotest::stream::{ChannelSink, ProgressBroadcaster};
use std::sync::Arc;
use std::thread;
use tokio::runtime::Runtime;

fn create_pool(providers: usize, keys: usize, rate_limit: u32) -> CredentialPool {
    let providers = (0..providers)
        .map(|p| {
            let keys = (0..keys).map(|k| format!("sk-bench-{p}-{k}")).collect();
            ProviderConfig::new(format!("provider-{p}"), ProviderKind::OpenAi, keys, rate_limit)
        })
        .collect();
    CredentialPool::new(PoolConfig::new(providers)).unwrap()
}

fn benchmark_acquire(c: &mut Criterion) {
    let pool = create_pool(4, 8, u32::MAX);
    c.bench_function("acquire_uncontended", |b| b.iter(|| black_box(pool.acquire())));

    // every slot exhausted: a full scan that grants nothing
    let exhausted = create_pool(4, 8, 1);
    while exhausted.acquire().is_some() {}
    c.bench_function("acquire_exhausted", |b| {
        b.iter(|| black_box(exhausted.acquire()))
    });
}

fn benchmark_contended_acquire(c: &mut Criterion) {
    let pool = Arc::new(create_pool(4, 8, u32::MAX));

    c.bench_function("acquire_8_threads_x_100", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let pool = pool.clone();
                    thread::spawn(move || {
                        for _ in 0..100 {
                            black_box(pool.acquire());
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        })
    });
}

fn benchmark_broadcast(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let broadcaster = ProgressBroadcaster::default();
    let mut receivers = Vec::new();
    for _ in 0..32 {
        let (sink, stream) = ChannelSink::new(1024);
        broadcaster.subscribe(BatchId(1), Arc::new(sink));
        receivers.push(stream.into_inner());
    }
    let snapshot = BatchSnapshot {
        batch_id: BatchId(1),
        status: ExecutionStatus::Running,
        counts: BatchCounts::default(),
        total_duration: 0.0,
        started_at: None,
        completed_at: None,
        updated_at: chrono::Utc::now(),
    };

    c.bench_function("broadcast_32_subscribers", |b| {
        b.iter(|| {
            rt.block_on(async {
                black_box(broadcaster.broadcast(BatchId(1), &snapshot).await);
            });
            for receiver in receivers.iter_mut() {
                while receiver.try_recv().is_ok() {}
            }
        })
    });
}

criterion_group!(
    benches,
    benchmark_acquire,
    benchmark_contended_acquire,
    benchmark_broadcast
);
criterion_main!(benches);
