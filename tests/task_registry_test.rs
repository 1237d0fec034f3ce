//! Task registry tests
//!
//! Cancellation under concurrent registration, and resource closes that run
//! outside the registry lock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_test::{assert_pending, assert_ready, task};
use tokio_util::sync::CancellationToken;

use autotest::batch::{BatchId, ItemId};
use autotest::registry::{NoopResource, ResourceError, ResourceHandle, TaskRegistry};

/// Resource whose close waits until released
struct SlowResource {
    release: Arc<Notify>,
    closed: AtomicUsize,
}

#[async_trait]
impl ResourceHandle for SlowResource {
    fn label(&self) -> String {
        "slow-browser".to_string()
    }

    async fn close(&self) -> Result<(), ResourceError> {
        self.release.notified().await;
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_slow_close_does_not_block_other_batches() {
    let registry = TaskRegistry::new();
    registry.register_batch(BatchId(1)).unwrap();
    registry.register_batch(BatchId(2)).unwrap();

    let release = Arc::new(Notify::new());
    let slow = Arc::new(SlowResource {
        release: release.clone(),
        closed: AtomicUsize::new(0),
    });
    let token = CancellationToken::new();
    registry
        .register_job(BatchId(1), ItemId(1), slow.clone(), token.clone())
        .unwrap();

    let mut cancelling = task::spawn(registry.cancel_batch(BatchId(1)));
    assert_pending!(cancelling.poll());
    assert!(token.is_cancelled());

    // batch 1 is already detached while its resource is still closing
    assert!(!registry.is_registered(BatchId(1)));
    registry
        .register_job(BatchId(2), ItemId(2), Arc::new(NoopResource), CancellationToken::new())
        .unwrap();
    assert_eq!(registry.active_count(BatchId(2)), 1);
    assert_eq!(slow.closed.load(Ordering::SeqCst), 0);

    release.notify_one();
    assert!(cancelling.is_woken());
    assert!(assert_ready!(cancelling.poll()));
    assert_eq!(slow.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_races_with_finishing_jobs() {
    let registry = Arc::new(TaskRegistry::new());
    registry.register_batch(BatchId(7)).unwrap();

    let tokens: Vec<CancellationToken> = (0..64).map(|_| CancellationToken::new()).collect();
    for (index, token) in tokens.iter().enumerate() {
        registry
            .register_job(
                BatchId(7),
                ItemId(index as u64),
                Arc::new(NoopResource),
                token.clone(),
            )
            .unwrap();
    }

    // half of the jobs finish on their own while the batch is being cancelled
    let finishing: Vec<_> = (0..32)
        .map(|index| {
            let registry = registry.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_micros(index * 10)).await;
                registry.unregister_job(ItemId(index));
            })
        })
        .collect();
    let cancelled = registry.cancel_batch(BatchId(7)).await;
    for task in finishing {
        task.await.unwrap();
    }

    assert!(cancelled);
    assert!(!registry.is_registered(BatchId(7)));
    assert_eq!(registry.active_count(BatchId(7)), 0);
    // every job still registered at cancel time was signalled
    assert!(tokens[32..].iter().all(CancellationToken::is_cancelled));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_only_one_concurrent_cancel_wins() {
    let registry = Arc::new(TaskRegistry::new());
    registry.register_batch(BatchId(3)).unwrap();
    registry
        .register_job(BatchId(3), ItemId(1), Arc::new(NoopResource), CancellationToken::new())
        .unwrap();

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.cancel_batch(BatchId(3)).await })
        })
        .collect();

    let mut wins = 0;
    for attempt in attempts {
        if attempt.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);
}
