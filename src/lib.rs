//! # Autotest batch orchestration
//!
//! Runs many long-lived, externally executed jobs (one automated test case
//! each) as a single batch, with bounded concurrency, mid-flight cancellation,
//! per-item and per-batch progress tracking, and fair rationing of rate-limited
//! LLM credentials across all running jobs.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use tokio_util::sync::CancellationToken;
//! use autotest::batch::{
//!     AgentRunner, BatchOptions, BatchOrchestrator, JobId, MemoryBatchStore, Outcome, RunRequest,
//! };
//! use autotest::credentials::{CredentialPool, PoolConfig};
//! use autotest::registry::{ResourceHandle, TaskRegistry};
//! use autotest::stream::ProgressBroadcaster;
//!
//! struct AlwaysPasses;
//!
//! #[async_trait]
//! impl AgentRunner for AlwaysPasses {
//!     async fn run(
//!         &self,
//!         _request: RunRequest,
//!         _resource: Arc<dyn ResourceHandle>,
//!         _cancel: CancellationToken,
//!     ) -> Outcome {
//!         Outcome::passed(1.0)
//!     }
//! }
//!
//! # async fn example() -> autotest::Result<()> {
//! let orchestrator = BatchOrchestrator::new(
//!     Arc::new(MemoryBatchStore::new()),
//!     Arc::new(TaskRegistry::new()),
//!     Arc::new(CredentialPool::new(PoolConfig::default_from_env())?),
//!     Arc::new(ProgressBroadcaster::default()),
//!     Arc::new(AlwaysPasses),
//! );
//!
//! let batch_id = orchestrator
//!     .create_batch(&[JobId(1), JobId(2)], BatchOptions::named("smoke"))
//!     .await?;
//! let snapshot = orchestrator.start_batch(batch_id).await?;
//! assert_eq!(snapshot.counts.success_count, 2);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`batch`]: batch and item records, storage, the runner seam and the orchestrator
//! - [`registry`]: running jobs and their cancellation handles
//! - [`credentials`]: round-robin, rate-limited credential pool
//! - [`stream`]: progress fan-out to subscribers
//! - [`config`]: orchestrator settings
//! - [`metrics`]: Prometheus metrics
//! - [`telemetry`]: tracing setup

#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for autotest operations
pub type Result<T> = std::result::Result<T, AutotestError>;

/// Top-level error type
#[derive(Error, Debug)]
pub enum AutotestError {
    /// Batch orchestration failure
    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] batch::OrchestratorError),

    /// Persistent store failure
    #[error("Store error: {0}")]
    Store(#[from] batch::StoreError),

    /// Task registry misuse
    #[error("Registry error: {0}")]
    Registry(#[from] registry::RegistryError),

    /// Provider configuration problem
    #[error("Credential error: {0}")]
    Credential(#[from] credentials::CredentialError),

    /// Subscriber delivery failure
    #[error("Sink error: {0}")]
    Sink(#[from] stream::SinkError),

    /// Orchestrator configuration problem
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Join error from async tasks
    #[error("Async join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Batches, items and the orchestrator
pub mod batch;

/// Running-job bookkeeping and cancellation
pub mod registry;

/// Provider credentials and the rotation pool
pub mod credentials;

/// Progress streaming
pub mod stream;

pub mod config;

pub mod metrics;

pub mod telemetry;
