//! Batches of jobs: records, storage, the runner seam and the orchestrator.

pub mod orchestrator;
pub mod runner;
pub mod store;
pub mod types;

pub use orchestrator::{BatchHandle, BatchOrchestrator, OrchestratorError};
pub use runner::{AgentRunner, Outcome, OutcomeStatus, RunRequest};
pub use store::{BatchStore, MemoryBatchStore, StoreError, StoreResult};
pub use types::*;
