//! Persistence for batches and their items.
//!
//! The orchestrator only assumes "last writer wins per row"; it serializes its own
//! writes per batch and never relies on cross-row transactions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;

use super::types::{
    BatchCounts, BatchId, BatchJob, ExecutionStatus, ItemId, JobId, JobItem, NewBatch,
};

/// Errors raised by a [`BatchStore`]
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Batch not found: {0}")]
    BatchNotFound(BatchId),

    #[error("Job item not found: {0}")]
    ItemNotFound(ItemId),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Result alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Storage interface for batch and item rows
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Insert a batch in `pending` and return the stored row
    async fn insert_batch(&self, batch: NewBatch) -> StoreResult<BatchJob>;

    /// Insert one `pending` item per job id, preserving order
    async fn insert_items(&self, batch_id: BatchId, job_ids: &[JobId]) -> StoreResult<Vec<JobItem>>;

    /// Load a batch row
    async fn get_batch(&self, batch_id: BatchId) -> StoreResult<BatchJob>;

    /// Overwrite a batch row
    async fn update_batch(&self, batch: &BatchJob) -> StoreResult<()>;

    /// Load a single item row
    async fn get_item(&self, item_id: ItemId) -> StoreResult<JobItem>;

    /// Load every item of a batch in insertion order
    async fn list_items(&self, batch_id: BatchId) -> StoreResult<Vec<JobItem>>;

    /// Overwrite an item row
    async fn update_item(&self, item: &JobItem) -> StoreResult<()>;
}

/// In-memory batch storage
#[derive(Clone, Default)]
pub struct MemoryBatchStore {
    batches: Arc<DashMap<BatchId, BatchJob>>,
    items: Arc<DashMap<ItemId, JobItem>>,
    batch_index: Arc<DashMap<BatchId, Vec<ItemId>>>,
    next_batch_id: Arc<AtomicU64>,
    next_item_id: Arc<AtomicU64>,
}

impl MemoryBatchStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored batches
    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }
}

#[async_trait]
impl BatchStore for MemoryBatchStore {
    async fn insert_batch(&self, batch: NewBatch) -> StoreResult<BatchJob> {
        let id = BatchId(self.next_batch_id.fetch_add(1, Ordering::SeqCst) + 1);
        let now = Utc::now();
        let row = BatchJob {
            id,
            name: batch.name,
            status: ExecutionStatus::Pending,
            counts: BatchCounts {
                total_count: batch.total_count,
                pending_count: batch.total_count,
                ..BatchCounts::default()
            },
            headless: batch.headless,
            total_duration: 0.0,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };

        self.batches.insert(id, row.clone());
        self.batch_index.entry(id).or_default();
        Ok(row)
    }

    async fn insert_items(
        &self,
        batch_id: BatchId,
        job_ids: &[JobId],
    ) -> StoreResult<Vec<JobItem>> {
        if !self.batches.contains_key(&batch_id) {
            return Err(StoreError::BatchNotFound(batch_id));
        }

        let now = Utc::now();
        let rows: Vec<JobItem> = job_ids
            .iter()
            .map(|&job_id| JobItem {
                id: ItemId(self.next_item_id.fetch_add(1, Ordering::SeqCst) + 1),
                batch_id,
                job_id,
                status: ExecutionStatus::Pending,
                execution_ref: None,
                duration_seconds: None,
                summary: None,
                error_message: None,
                created_at: now,
                started_at: None,
                completed_at: None,
                updated_at: now,
            })
            .collect();

        for row in &rows {
            self.items.insert(row.id, row.clone());
        }
        self.batch_index
            .entry(batch_id)
            .or_default()
            .extend(rows.iter().map(|row| row.id));

        Ok(rows)
    }

    async fn get_batch(&self, batch_id: BatchId) -> StoreResult<BatchJob> {
        self.batches
            .get(&batch_id)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::BatchNotFound(batch_id))
    }

    async fn update_batch(&self, batch: &BatchJob) -> StoreResult<()> {
        match self.batches.get_mut(&batch.id) {
            Some(mut entry) => {
                *entry = batch.clone();
                Ok(())
            }
            None => Err(StoreError::BatchNotFound(batch.id)),
        }
    }

    async fn get_item(&self, item_id: ItemId) -> StoreResult<JobItem> {
        self.items
            .get(&item_id)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::ItemNotFound(item_id))
    }

    async fn list_items(&self, batch_id: BatchId) -> StoreResult<Vec<JobItem>> {
        // Clone the id list so no index guard is held while reading item rows
        let ids = self
            .batch_index
            .get(&batch_id)
            .map(|entry| entry.value().clone())
            .ok_or(StoreError::BatchNotFound(batch_id))?;

        ids.into_iter()
            .map(|id| {
                self.items
                    .get(&id)
                    .map(|entry| entry.value().clone())
                    .ok_or(StoreError::ItemNotFound(id))
            })
            .collect()
    }

    async fn update_item(&self, item: &JobItem) -> StoreResult<()> {
        match self.items.get_mut(&item.id) {
            Some(mut entry) => {
                *entry = item.clone();
                Ok(())
            }
            None => Err(StoreError::ItemNotFound(item.id)),
        }
    }
}
