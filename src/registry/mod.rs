//! Process-wide bookkeeping of in-flight jobs, grouped by batch.
//!
//! A job blocked on external I/O is not released by cancelling its task alone, so
//! every registered job carries both a [`CancellationToken`] and the
//! [`ResourceHandle`] it holds (for example a browser session). Cancelling a batch
//! signals every token and closes every handle.
//!
//! The registry mutex is synchronous and is never held across an `.await`:
//! [`TaskRegistry::cancel_batch`] takes its snapshot under the lock, releases it,
//! and only then performs the slow closes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::batch::{BatchId, ItemId};

/// Failure to acquire or release an external resource
#[derive(Error, Debug, Clone)]
#[error("Resource {resource}: {message}")]
pub struct ResourceError {
    pub resource: String,
    pub message: String,
}

impl ResourceError {
    pub fn new(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            message: message.into(),
        }
    }
}

/// An external resource held by a running job
#[async_trait]
pub trait ResourceHandle: Send + Sync {
    /// Short description for logs
    fn label(&self) -> String;

    /// Release the resource, unblocking any call waiting on it.
    ///
    /// May be called more than once; later calls should be cheap no-ops.
    async fn close(&self) -> Result<(), ResourceError>;
}

/// Handle for jobs that hold nothing closable
#[derive(Debug, Clone, Default)]
pub struct NoopResource;

#[async_trait]
impl ResourceHandle for NoopResource {
    fn label(&self) -> String {
        "noop".to_string()
    }

    async fn close(&self) -> Result<(), ResourceError> {
        Ok(())
    }
}

/// Errors raised by [`TaskRegistry`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Batch {0} is already registered")]
    BatchAlreadyRegistered(BatchId),

    #[error("Batch {0} is not registered")]
    BatchNotRegistered(BatchId),
}

#[derive(Clone)]
struct JobEntry {
    batch_id: BatchId,
    resource: Arc<dyn ResourceHandle>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RegistryState {
    batches: HashMap<BatchId, HashSet<ItemId>>,
    jobs: HashMap<ItemId, JobEntry>,
}

/// Outcome of a batch cancellation, for logging and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelReport {
    pub jobs_signalled: usize,
    pub close_failures: usize,
}

/// Registry of running jobs and their cancellation handles
#[derive(Default)]
pub struct TaskRegistry {
    state: Mutex<RegistryState>,
}

impl TaskRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a batch with an empty job set
    pub fn register_batch(&self, batch_id: BatchId) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        if state.batches.contains_key(&batch_id) {
            return Err(RegistryError::BatchAlreadyRegistered(batch_id));
        }
        state.batches.insert(batch_id, HashSet::new());
        debug!(batch_id = %batch_id, "Registered batch");
        Ok(())
    }

    /// Record a running job and its handles.
    ///
    /// Registering the same job again overwrites its handles (and moves it if the
    /// batch differs). Fails when the batch is not registered, which is how a worker
    /// learns that its batch was cancelled before the job got going.
    pub fn register_job(
        &self,
        batch_id: BatchId,
        job_id: ItemId,
        resource: Arc<dyn ResourceHandle>,
        cancel: CancellationToken,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        if !state.batches.contains_key(&batch_id) {
            return Err(RegistryError::BatchNotRegistered(batch_id));
        }

        let previous = state.jobs.insert(
            job_id,
            JobEntry {
                batch_id,
                resource,
                cancel,
            },
        );
        if let Some(previous) = previous {
            if previous.batch_id != batch_id {
                if let Some(jobs) = state.batches.get_mut(&previous.batch_id) {
                    jobs.remove(&job_id);
                }
            }
        }
        if let Some(jobs) = state.batches.get_mut(&batch_id) {
            jobs.insert(job_id);
        }
        debug!(batch_id = %batch_id, job_id = %job_id, "Registered job");
        Ok(())
    }

    /// Forget a job; no-op if it is not registered
    pub fn unregister_job(&self, job_id: ItemId) {
        let mut state = self.state.lock();
        if let Some(entry) = state.jobs.remove(&job_id) {
            if let Some(jobs) = state.batches.get_mut(&entry.batch_id) {
                jobs.remove(&job_id);
            }
            debug!(batch_id = %entry.batch_id, job_id = %job_id, "Unregistered job");
        }
    }

    /// Forget a batch that finished on its own, along with any leftover jobs.
    ///
    /// Returns false if the batch was not registered.
    pub fn unregister_batch(&self, batch_id: BatchId) -> bool {
        let mut state = self.state.lock();
        match state.batches.remove(&batch_id) {
            Some(jobs) => {
                for job_id in jobs {
                    state.jobs.remove(&job_id);
                }
                debug!(batch_id = %batch_id, "Unregistered batch");
                true
            }
            None => false,
        }
    }

    /// Cancel every job of a batch and drop the batch.
    ///
    /// The batch and its jobs are detached under the lock in one step, so jobs that
    /// finish concurrently simply find nothing to unregister, and jobs that try to
    /// register afterwards are refused. Tokens are signalled and resources closed
    /// after the lock is released; close failures are logged and do not stop the
    /// remaining closes. Returns false if the batch was not registered.
    pub async fn cancel_batch(&self, batch_id: BatchId) -> bool {
        match self.detach_batch(batch_id) {
            Some(entries) => {
                let report = Self::shutdown_jobs(batch_id, entries).await;
                info!(
                    batch_id = %batch_id,
                    jobs_signalled = report.jobs_signalled,
                    close_failures = report.close_failures,
                    "Cancelled batch"
                );
                true
            }
            None => {
                debug!(batch_id = %batch_id, "Cancel requested for unregistered batch");
                false
            }
        }
    }

    /// Whether the batch is currently tracked
    pub fn is_registered(&self, batch_id: BatchId) -> bool {
        self.state.lock().batches.contains_key(&batch_id)
    }

    /// Number of jobs currently registered for the batch (0 if unknown)
    pub fn active_count(&self, batch_id: BatchId) -> usize {
        self.state
            .lock()
            .batches
            .get(&batch_id)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    fn detach_batch(&self, batch_id: BatchId) -> Option<Vec<(ItemId, JobEntry)>> {
        let mut state = self.state.lock();
        let job_ids = state.batches.remove(&batch_id)?;
        let entries = job_ids
            .into_iter()
            .filter_map(|job_id| state.jobs.remove(&job_id).map(|entry| (job_id, entry)))
            .collect();
        Some(entries)
    }

    async fn shutdown_jobs(batch_id: BatchId, entries: Vec<(ItemId, JobEntry)>) -> CancelReport {
        for (_, entry) in &entries {
            entry.cancel.cancel();
        }

        let closes = entries.iter().map(|(job_id, entry)| async move {
            match entry.resource.close().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        batch_id = %batch_id,
                        job_id = %job_id,
                        resource = %entry.resource.label(),
                        error = %e,
                        "Failed to close resource during cancellation"
                    );
                    false
                }
            }
        });
        let results = join_all(closes).await;

        CancelReport {
            jobs_signalled: entries.len(),
            close_failures: results.iter().filter(|ok| !**ok).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingResource {
        closes: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ResourceHandle for CountingResource {
        fn label(&self) -> String {
            "counting".to_string()
        }

        async fn close(&self) -> Result<(), ResourceError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ResourceError::new("counting", "already gone"))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_register_batch_twice_fails() {
        let registry = TaskRegistry::new();
        registry.register_batch(BatchId(1)).unwrap();
        assert_eq!(
            registry.register_batch(BatchId(1)),
            Err(RegistryError::BatchAlreadyRegistered(BatchId(1)))
        );
        assert!(registry.is_registered(BatchId(1)));
        assert_eq!(registry.active_count(BatchId(1)), 0);
    }

    #[test]
    fn test_register_job_requires_batch() {
        let registry = TaskRegistry::new();
        let result = registry.register_job(
            BatchId(3),
            ItemId(1),
            Arc::new(NoopResource),
            CancellationToken::new(),
        );
        assert_eq!(result, Err(RegistryError::BatchNotRegistered(BatchId(3))));
    }

    #[test]
    fn test_reregister_overwrites() {
        let registry = TaskRegistry::new();
        registry.register_batch(BatchId(1)).unwrap();
        registry.register_batch(BatchId(2)).unwrap();

        for _ in 0..2 {
            registry
                .register_job(
                    BatchId(1),
                    ItemId(10),
                    Arc::new(NoopResource),
                    CancellationToken::new(),
                )
                .unwrap();
        }
        assert_eq!(registry.active_count(BatchId(1)), 1);

        registry
            .register_job(BatchId(2), ItemId(10), Arc::new(NoopResource), CancellationToken::new())
            .unwrap();
        assert_eq!(registry.active_count(BatchId(1)), 0);
        assert_eq!(registry.active_count(BatchId(2)), 1);
    }

    #[test]
    fn test_unregister_job_is_idempotent() {
        let registry = TaskRegistry::new();
        registry.register_batch(BatchId(1)).unwrap();
        registry
            .register_job(BatchId(1), ItemId(5), Arc::new(NoopResource), CancellationToken::new())
            .unwrap();

        registry.unregister_job(ItemId(5));
        registry.unregister_job(ItemId(5));
        registry.unregister_job(ItemId(99));
        assert_eq!(registry.active_count(BatchId(1)), 0);
        assert!(registry.is_registered(BatchId(1)));
    }

    #[tokio::test]
    async fn test_cancel_batch_signals_and_closes() {
        let registry = TaskRegistry::new();
        registry.register_batch(BatchId(1)).unwrap();

        let resource = Arc::new(CountingResource::default());
        let token = CancellationToken::new();
        registry
            .register_job(BatchId(1), ItemId(100), resource.clone(), token.clone())
            .unwrap();

        assert!(registry.cancel_batch(BatchId(1)).await);
        assert!(token.is_cancelled());
        assert_eq!(resource.closes.load(Ordering::SeqCst), 1);
        assert!(!registry.is_registered(BatchId(1)));
        assert_eq!(registry.active_count(BatchId(1)), 0);

        // second call is a no-op
        assert!(!registry.cancel_batch(BatchId(1)).await);
        assert_eq!(resource.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_failure_does_not_stop_other_closes() {
        let registry = TaskRegistry::new();
        registry.register_batch(BatchId(1)).unwrap();

        let failing = Arc::new(CountingResource {
            fail: true,
            ..Default::default()
        });
        let healthy = Arc::new(CountingResource::default());
        registry
            .register_job(BatchId(1), ItemId(1), failing.clone(), CancellationToken::new())
            .unwrap();
        registry
            .register_job(BatchId(1), ItemId(2), healthy.clone(), CancellationToken::new())
            .unwrap();

        let entries = registry.detach_batch(BatchId(1)).unwrap();
        let report = TaskRegistry::shutdown_jobs(BatchId(1), entries).await;
        assert_eq!(
            report,
            CancelReport {
                jobs_signalled: 2,
                close_failures: 1
            }
        );
        assert_eq!(failing.closes.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_job_registered_after_cancel_is_refused() {
        let registry = TaskRegistry::new();
        registry.register_batch(BatchId(1)).unwrap();
        assert!(registry.cancel_batch(BatchId(1)).await);

        let result = registry.register_job(
            BatchId(1),
            ItemId(1),
            Arc::new(NoopResource),
            CancellationToken::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unregister_batch_drops_jobs() {
        let registry = TaskRegistry::new();
        registry.register_batch(BatchId(4)).unwrap();
        registry
            .register_job(BatchId(4), ItemId(1), Arc::new(NoopResource), CancellationToken::new())
            .unwrap();
        assert!(registry.unregister_batch(BatchId(4)));
        assert!(!registry.unregister_batch(BatchId(4)));
        assert!(!registry.is_registered(BatchId(4)));
    }
}
