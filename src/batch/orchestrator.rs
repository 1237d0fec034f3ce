//! Batch orchestration: bounded-concurrency workers over a batch's items.
//!
//! Every write to a batch's item rows or its batch row goes through the
//! batch's control lock, and batch aggregates are recomputed from the full
//! item list on every write. Snapshots are broadcast before the lock is
//! released, so subscribers see them in write order. Runner calls happen
//! outside the lock.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::runner::{AgentRunner, Outcome, OutcomeStatus, RunRequest};
use super::store::{BatchStore, StoreError};
use super::types::{
    BatchId, BatchJob, BatchOptions, BatchSnapshot, ExecutionStatus, ItemId, JobId, JobItem,
    NewBatch,
};
use crate::config::OrchestratorConfig;
use crate::credentials::{Credential, CredentialPool};
use crate::metrics;
use crate::registry::{RegistryError, ResourceHandle, TaskRegistry};
use crate::stream::ProgressBroadcaster;

/// Errors reported by [`BatchOrchestrator`]
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    #[error("Batch {batch_id} cannot move from {from} to {to}")]
    InvalidTransition {
        batch_id: BatchId,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("No credential available: every key is at its rate limit")]
    CredentialExhausted,

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for OrchestratorError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::BatchNotFound(batch_id) => OrchestratorError::BatchNotFound(batch_id),
            other => OrchestratorError::Store(other),
        }
    }
}

type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

/// Per-batch coordination state
struct BatchControl {
    /// Fired once when the batch is cancelled; item tokens are children of it
    cancel: CancellationToken,
    /// Serializes item transitions with the batch recompute-and-write
    lock: Mutex<()>,
}

impl BatchControl {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            lock: Mutex::new(()),
        }
    }
}

/// Handle to a batch started in the background by [`BatchOrchestrator::run_batch`]
pub struct BatchHandle {
    pub batch_id: BatchId,
    task: JoinHandle<OrchestratorResult<BatchSnapshot>>,
}

impl BatchHandle {
    /// Wait for the batch to reach its final state
    pub async fn wait(self) -> OrchestratorResult<BatchSnapshot> {
        self.task
            .await
            .map_err(|e| OrchestratorError::Internal(format!("batch task failed: {e}")))?
    }
}

/// Runs batches of jobs with bounded concurrency, cancellation and progress
/// reporting.
///
/// Cloning is cheap; clones share all collaborators and in-flight batch state.
#[derive(Clone)]
pub struct BatchOrchestrator {
    store: Arc<dyn BatchStore>,
    registry: Arc<TaskRegistry>,
    pool: Arc<CredentialPool>,
    broadcaster: Arc<ProgressBroadcaster>,
    runner: Arc<dyn AgentRunner>,
    config: OrchestratorConfig,
    controls: Arc<DashMap<BatchId, Arc<BatchControl>>>,
}

impl BatchOrchestrator {
    pub fn new(
        store: Arc<dyn BatchStore>,
        registry: Arc<TaskRegistry>,
        pool: Arc<CredentialPool>,
        broadcaster: Arc<ProgressBroadcaster>,
        runner: Arc<dyn AgentRunner>,
    ) -> Self {
        Self {
            store,
            registry,
            pool,
            broadcaster,
            runner,
            config: OrchestratorConfig::default(),
            controls: Arc::new(DashMap::new()),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self.config.max_concurrent = self.config.max_concurrent.max(1);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        &self.broadcaster
    }

    /// Persist a pending batch with one pending item per job id.
    ///
    /// A batch with no jobs is completed on the spot.
    #[instrument(skip(self, job_ids, options), fields(job_count = job_ids.len()))]
    pub async fn create_batch(
        &self,
        job_ids: &[JobId],
        options: BatchOptions,
    ) -> OrchestratorResult<BatchId> {
        let now = Utc::now();
        let batch = self
            .store
            .insert_batch(NewBatch {
                name: options.resolve_name(now),
                headless: options.headless.unwrap_or(self.config.default_headless),
                total_count: job_ids.len(),
            })
            .await?;
        let batch_id = batch.id;
        let items = match self.store.insert_items(batch_id, job_ids).await {
            Ok(items) => items,
            Err(e) => {
                error!(batch_id = %batch_id, error = %e, "Failed to create batch items");
                self.abandon(batch).await;
                return Err(e.into());
            }
        };

        if items.is_empty() {
            let mut batch = batch;
            batch.apply_items(&items, now);
            batch.set_status(ExecutionStatus::Completed, now);
            self.store.update_batch(&batch).await?;
            metrics::record_batch_finished(ExecutionStatus::Completed);
            info!(
                batch_id = %batch.id,
                name = %batch.name,
                "Created empty batch, completed immediately"
            );
        } else {
            info!(
                batch_id = %batch.id,
                name = %batch.name,
                total_count = items.len(),
                headless = batch.headless,
                "Created batch"
            );
        }

        Ok(batch_id)
    }

    /// Run every pending item of a batch and wait for the batch to finish.
    ///
    /// Returns the final snapshot. Fails without side effects when the batch is
    /// already running or finished. If the orchestrator's own bookkeeping
    /// breaks down the batch is marked failed and the cause returned.
    #[instrument(skip_all, fields(batch_id = %batch_id))]
    pub async fn start_batch(&self, batch_id: BatchId) -> OrchestratorResult<BatchSnapshot> {
        let control = self.control(batch_id);

        let (batch, pending) = {
            let _guard = control.lock.lock().await;
            let mut batch = match self.store.get_batch(batch_id).await {
                Ok(batch) => batch,
                Err(e) => {
                    drop(_guard);
                    self.forget_unknown(batch_id, &e);
                    return Err(e.into());
                }
            };
            if batch.status != ExecutionStatus::Pending {
                if batch.status.is_terminal() {
                    drop(_guard);
                    self.controls.remove(&batch_id);
                }
                return Err(OrchestratorError::InvalidTransition {
                    batch_id,
                    from: batch.status,
                    to: ExecutionStatus::Running,
                });
            }

            self.registry.register_batch(batch_id)?;
            let started = async {
                let items = self.store.list_items(batch_id).await?;
                let now = Utc::now();
                batch.apply_items(&items, now);
                batch.set_status(ExecutionStatus::Running, now);
                self.store.update_batch(&batch).await?;
                Ok::<_, StoreError>(items)
            }
            .await;

            match started {
                Ok(items) => {
                    let pending: Vec<JobItem> = items
                        .into_iter()
                        .filter(|item| item.status == ExecutionStatus::Pending)
                        .collect();
                    self.broadcaster.broadcast(batch_id, &batch.snapshot()).await;
                    (batch, pending)
                }
                Err(e) => {
                    self.registry.unregister_batch(batch_id);
                    return Err(e.into());
                }
            }
        };

        info!(
            total_count = batch.counts.total_count,
            pending = pending.len(),
            max_concurrent = self.config.max_concurrent,
            "Starting batch"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent));
        let workers: Vec<JoinHandle<OrchestratorResult<()>>> = pending
            .into_iter()
            .map(|item| {
                let orchestrator = self.clone();
                let control = control.clone();
                let semaphore = semaphore.clone();
                let headless = batch.headless;
                tokio::spawn(async move {
                    orchestrator
                        .run_item(control, semaphore, batch_id, item.id, item.job_id, headless)
                        .await
                })
            })
            .collect();

        let mut defect = None;
        for joined in join_all(workers).await {
            let result = joined
                .map_err(|e| OrchestratorError::Internal(format!("worker task failed: {e}")))
                .and_then(|result| result);
            if let Err(e) = result {
                error!(error = %e, "Worker hit an orchestration error");
                defect.get_or_insert(e);
            }
        }

        self.finalize(batch_id, &control, defect).await
    }

    /// Cancel a batch.
    ///
    /// Running items are signalled and their resources closed; items that never
    /// started are cancelled without running. Returns false, changing nothing,
    /// when the batch is unknown or already finished.
    #[instrument(skip_all, fields(batch_id = %batch_id))]
    pub async fn cancel_batch(&self, batch_id: BatchId) -> OrchestratorResult<bool> {
        let control = self.control(batch_id);

        let was_running = {
            let _guard = control.lock.lock().await;
            let mut batch = match self.store.get_batch(batch_id).await {
                Ok(batch) => batch,
                Err(StoreError::BatchNotFound(_)) => {
                    drop(_guard);
                    self.controls.remove(&batch_id);
                    debug!("Cancel requested for unknown batch");
                    return Ok(false);
                }
                Err(e) => return Err(e.into()),
            };
            if batch.status.is_terminal() {
                debug!(status = %batch.status, "Cancel requested for finished batch");
                drop(_guard);
                self.controls.remove(&batch_id);
                return Ok(false);
            }

            let was_running = batch.status == ExecutionStatus::Running;
            control.cancel.cancel();
            if was_running {
                self.registry.cancel_batch(batch_id).await;
            }

            let now = Utc::now();
            let mut items = self.store.list_items(batch_id).await?;
            let mut skipped = 0;
            for item in items
                .iter_mut()
                .filter(|item| item.status == ExecutionStatus::Pending)
            {
                item.transition(ExecutionStatus::Cancelled, now);
                self.store.update_item(item).await?;
                metrics::record_item_skipped();
                skipped += 1;
            }

            batch.apply_items(&items, now);
            batch.set_status(ExecutionStatus::Cancelled, now);
            self.store.update_batch(&batch).await?;
            info!(
                skipped_items = skipped,
                running_items = batch.counts.running_count,
                "Batch cancelled"
            );
            self.broadcaster.broadcast(batch_id, &batch.snapshot()).await;
            was_running
        };

        // A running batch is finalized by its own start call
        if !was_running {
            self.controls.remove(&batch_id);
            metrics::record_batch_finished(ExecutionStatus::Cancelled);
        }
        Ok(true)
    }

    /// Current snapshot of a batch
    pub async fn get_status(&self, batch_id: BatchId) -> OrchestratorResult<BatchSnapshot> {
        Ok(self.store.get_batch(batch_id).await?.snapshot())
    }

    /// Full batch row
    pub async fn get_batch(&self, batch_id: BatchId) -> OrchestratorResult<BatchJob> {
        Ok(self.store.get_batch(batch_id).await?)
    }

    /// Items of a batch in creation order
    pub async fn list_items(&self, batch_id: BatchId) -> OrchestratorResult<Vec<JobItem>> {
        Ok(self.store.list_items(batch_id).await?)
    }

    /// Create a batch and start it in the background
    pub async fn run_batch(
        &self,
        job_ids: &[JobId],
        options: BatchOptions,
    ) -> OrchestratorResult<BatchHandle> {
        let batch_id = self.create_batch(job_ids, options).await?;
        let orchestrator = self.clone();
        let task = tokio::spawn(async move {
            match orchestrator.start_batch(batch_id).await {
                // Empty, or cancelled before it got going
                Err(OrchestratorError::InvalidTransition { .. }) => {
                    orchestrator.get_status(batch_id).await
                }
                other => other,
            }
        });
        Ok(BatchHandle { batch_id, task })
    }

    fn control(&self, batch_id: BatchId) -> Arc<BatchControl> {
        self.controls
            .entry(batch_id)
            .or_insert_with(|| Arc::new(BatchControl::new()))
            .clone()
    }

    fn forget_unknown(&self, batch_id: BatchId, error: &StoreError) {
        if matches!(error, StoreError::BatchNotFound(_)) {
            self.controls.remove(&batch_id);
        }
    }

    /// Worker body for one item
    #[instrument(skip_all, fields(batch_id = %batch_id, item_id = %item_id, job_id = %job_id))]
    async fn run_item(
        &self,
        control: Arc<BatchControl>,
        semaphore: Arc<Semaphore>,
        batch_id: BatchId,
        item_id: ItemId,
        job_id: JobId,
        headless: bool,
    ) -> OrchestratorResult<()> {
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| OrchestratorError::Internal("worker semaphore closed".to_string()))?;

        {
            let _guard = control.lock.lock().await;
            if control.cancel.is_cancelled() {
                debug!("Batch cancelled before item started");
                return Ok(());
            }
            let mut item = self.store.get_item(item_id).await?;
            if !item.transition(ExecutionStatus::Running, Utc::now()) {
                debug!(status = %item.status, "Item no longer pending, skipping");
                return Ok(());
            }
            self.store.update_item(&item).await?;
            let snapshot = self.refresh_batch(batch_id).await?;
            self.broadcaster.broadcast(batch_id, &snapshot).await;
        }
        metrics::record_item_started();
        debug!("Item running");

        let (status, outcome) = self
            .execute(&control, batch_id, item_id, job_id, headless)
            .await;
        metrics::record_item_finished(status, outcome.duration_seconds);

        {
            let _guard = control.lock.lock().await;
            let mut item = self.store.get_item(item_id).await?;
            item.duration_seconds = outcome.duration_seconds;
            item.summary = outcome.summary.clone();
            item.error_message = outcome.error.clone();
            item.execution_ref = outcome.execution_ref.clone();
            if !item.transition(status, Utc::now()) {
                warn!(from = %item.status, to = %status, "Dropping illegal item transition");
                return Ok(());
            }
            self.store.update_item(&item).await?;
            let snapshot = self.refresh_batch(batch_id).await?;
            self.broadcaster.broadcast(batch_id, &snapshot).await;
        }

        match status {
            ExecutionStatus::Completed => {
                info!(duration_seconds = ?outcome.duration_seconds, "Item completed")
            }
            ExecutionStatus::Cancelled => info!("Item cancelled"),
            _ => warn!(error = ?outcome.error, "Item failed"),
        }
        Ok(())
    }

    /// Acquire a credential and resource, run the job and classify the result.
    ///
    /// Every failure here is local to the item.
    async fn execute(
        &self,
        control: &BatchControl,
        batch_id: BatchId,
        item_id: ItemId,
        job_id: JobId,
        headless: bool,
    ) -> (ExecutionStatus, Outcome) {
        if control.cancel.is_cancelled() {
            debug!("Batch cancelled before credential acquisition");
            return (ExecutionStatus::Cancelled, Outcome::cancelled());
        }
        let credential = match self.acquire_credential(&control.cancel).await {
            Some(credential) => credential,
            None if control.cancel.is_cancelled() => {
                return (ExecutionStatus::Cancelled, Outcome::cancelled())
            }
            None => {
                return (
                    ExecutionStatus::Failed,
                    Outcome::failed(OrchestratorError::CredentialExhausted.to_string()),
                )
            }
        };

        let request = RunRequest {
            batch_id,
            item_id,
            job_id,
            headless,
            credential,
        };
        if control.cancel.is_cancelled() {
            debug!("Batch cancelled before resource acquisition");
            return (ExecutionStatus::Cancelled, Outcome::cancelled());
        }
        let resource = match self.runner.acquire_resource(&request).await {
            Ok(resource) => resource,
            Err(e) => {
                return (
                    ExecutionStatus::Failed,
                    Outcome::failed(format!("failed to acquire resource: {e}")),
                )
            }
        };

        let token = control.cancel.child_token();
        if let Err(e) = self
            .registry
            .register_job(batch_id, item_id, resource.clone(), token.clone())
        {
            // The batch was cancelled between claiming the item and registering it
            debug!(error = %e, "Batch gone before registration, releasing resource");
            close_quietly(resource.as_ref()).await;
            return (ExecutionStatus::Cancelled, Outcome::cancelled());
        }

        let run = AssertUnwindSafe(self.runner.run(request, resource.clone(), token.clone()))
            .catch_unwind();
        let result = match self.config.job_timeout() {
            Some(limit) => tokio::time::timeout(limit, run).await.ok(),
            None => Some(run.await),
        };
        self.registry.unregister_job(item_id);

        let outcome = match result {
            None => {
                token.cancel();
                close_quietly(resource.as_ref()).await;
                let limit = self.config.job_timeout.unwrap_or_default();
                return (
                    ExecutionStatus::Failed,
                    Outcome::failed(format!("job timed out after {limit}s")),
                );
            }
            Some(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "Runner panicked");
                token.cancel();
                close_quietly(resource.as_ref()).await;
                return (
                    ExecutionStatus::Failed,
                    Outcome::failed(format!("runner panicked: {message}")),
                );
            }
            Some(Ok(outcome)) => outcome,
        };

        let status = if outcome.status == OutcomeStatus::Cancelled
            || (token.is_cancelled() && !outcome.success)
        {
            ExecutionStatus::Cancelled
        } else if outcome.success {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::Failed
        };
        (status, outcome)
    }

    /// Take a credential, retrying only as configured
    async fn acquire_credential(&self, cancel: &CancellationToken) -> Option<Credential> {
        let retry = self.config.credential_retry;
        let mut attempt = 0;
        loop {
            if let Some(credential) = self.pool.acquire() {
                return Some(credential);
            }
            if attempt >= retry.attempts || cancel.is_cancelled() {
                return None;
            }
            attempt += 1;
            debug!(attempt, max_attempts = retry.attempts, "Credential pool exhausted, retrying");
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(retry.delay()) => {}
            }
        }
    }

    /// Recompute the batch row from all of its items and store it.
    ///
    /// Caller holds the batch's control lock. Status is left alone.
    async fn refresh_batch(&self, batch_id: BatchId) -> OrchestratorResult<BatchSnapshot> {
        let mut batch = self.store.get_batch(batch_id).await?;
        let items = self.store.list_items(batch_id).await?;
        batch.apply_items(&items, Utc::now());
        self.store.update_batch(&batch).await?;
        Ok(batch.snapshot())
    }

    /// Settle the batch's final status once every worker has exited
    async fn finalize(
        &self,
        batch_id: BatchId,
        control: &BatchControl,
        defect: Option<OrchestratorError>,
    ) -> OrchestratorResult<BatchSnapshot> {
        let settled = {
            let _guard = control.lock.lock().await;
            let settled = async {
                let mut batch = self.store.get_batch(batch_id).await?;
                let items = self.store.list_items(batch_id).await?;
                let now = Utc::now();
                batch.apply_items(&items, now);
                if !batch.status.is_terminal() {
                    let status = if defect.is_some() {
                        ExecutionStatus::Failed
                    } else if control.cancel.is_cancelled() {
                        ExecutionStatus::Cancelled
                    } else {
                        ExecutionStatus::Completed
                    };
                    batch.set_status(status, now);
                }
                self.store.update_batch(&batch).await?;
                Ok::<_, StoreError>(batch)
            }
            .await;

            match settled {
                Ok(batch) => {
                    self.broadcaster.broadcast(batch_id, &batch.snapshot()).await;
                    Ok(batch)
                }
                Err(e) => {
                    error!(error = %e, "Failed to finalize batch, marking it failed");
                    self.mark_failed(batch_id).await;
                    Err(OrchestratorError::from(e))
                }
            }
        };

        self.registry.unregister_batch(batch_id);
        self.controls.remove(&batch_id);

        let batch = settled?;
        metrics::record_batch_finished(batch.status);
        info!(
            status = %batch.status,
            success_count = batch.counts.success_count,
            failed_count = batch.counts.failed_count,
            cancelled_count = batch.counts.cancelled_count,
            total_duration = batch.total_duration,
            "Batch finished"
        );

        match defect {
            Some(e) => Err(e),
            None => Ok(batch.snapshot()),
        }
    }

    /// Fail a batch whose items could not all be created.
    ///
    /// Counts are recomputed from whatever items did get stored.
    async fn abandon(&self, mut batch: BatchJob) {
        let now = Utc::now();
        match self.store.list_items(batch.id).await {
            Ok(items) => batch.apply_items(&items, now),
            Err(e) => {
                warn!(batch_id = %batch.id, error = %e, "Could not list items of abandoned batch")
            }
        }
        batch.set_status(ExecutionStatus::Failed, now);
        match self.store.update_batch(&batch).await {
            Ok(()) => metrics::record_batch_finished(ExecutionStatus::Failed),
            Err(e) => error!(batch_id = %batch.id, error = %e, "Could not mark batch failed"),
        }
    }

    /// Best-effort: set the batch row to failed without touching counts
    async fn mark_failed(&self, batch_id: BatchId) {
        let result = async {
            let mut batch = self.store.get_batch(batch_id).await?;
            if !batch.status.is_terminal() {
                batch.set_status(ExecutionStatus::Failed, Utc::now());
                self.store.update_batch(&batch).await?;
            }
            Ok::<_, StoreError>(())
        }
        .await;
        if let Err(e) = result {
            error!(batch_id = %batch_id, error = %e, "Could not mark batch failed");
        }
    }
}

/// Close a resource the runner can no longer release, logging failures
async fn close_quietly(resource: &dyn ResourceHandle) {
    if let Err(e) = resource.close().await {
        warn!(resource = %e.resource, error = %e.message, "Failed to close resource");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
