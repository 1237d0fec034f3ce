//! The agent execution seam.
//!
//! The orchestrator owns scheduling, credentials and bookkeeping; an
//! [`AgentRunner`] owns the actual run of one job (driving a browser agent,
//! an LLM client, or a test double).

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::types::{BatchId, ItemId, JobId};
use crate::credentials::Credential;
use crate::registry::{NoopResource, ResourceError, ResourceHandle};

/// Everything a runner needs to execute one job
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub batch_id: BatchId,
    pub item_id: ItemId,
    pub job_id: JobId,
    pub headless: bool,
    /// Credential selected for this run
    pub credential: Credential,
}

/// How a run ended, as reported by the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Passed,
    Failed,
    Cancelled,
}

/// Result of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    pub status: OutcomeStatus,
    pub duration_seconds: Option<f64>,
    pub summary: Option<String>,
    pub error: Option<String>,
    /// Opaque reference to the runner's own result record
    pub execution_ref: Option<String>,
}

impl Outcome {
    pub fn passed(duration_seconds: f64) -> Self {
        Self {
            success: true,
            status: OutcomeStatus::Passed,
            duration_seconds: Some(duration_seconds),
            summary: None,
            error: None,
            execution_ref: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            status: OutcomeStatus::Failed,
            duration_seconds: None,
            summary: None,
            error: Some(error.into()),
            execution_ref: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            success: false,
            status: OutcomeStatus::Cancelled,
            duration_seconds: None,
            summary: None,
            error: Some("cancelled".to_string()),
            execution_ref: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_execution_ref(mut self, execution_ref: impl Into<String>) -> Self {
        self.execution_ref = Some(execution_ref.into());
        self
    }

    pub fn with_duration(mut self, duration_seconds: f64) -> Self {
        self.duration_seconds = Some(duration_seconds);
        self
    }
}

/// Executes a single job.
///
/// `run` should return promptly with [`Outcome::cancelled`] once `cancel`
/// fires. The resource passed in is the one produced by
/// [`AgentRunner::acquire_resource`]; the orchestrator registers it so a
/// batch cancel can close it from outside.
///
/// When `run` returns normally the runner owns the resource and releases it
/// itself. The orchestrator closes it instead when `run` panics, exceeds the
/// job timeout or is cut off by a batch cancel, and when the batch is gone
/// before the resource could be registered.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Allocate the closable resource (browser session, client) for a run
    async fn acquire_resource(
        &self,
        _request: &RunRequest,
    ) -> Result<Arc<dyn ResourceHandle>, ResourceError> {
        Ok(Arc::new(NoopResource))
    }

    /// Execute the job to completion or cancellation
    async fn run(
        &self,
        request: RunRequest,
        resource: Arc<dyn ResourceHandle>,
        cancel: CancellationToken,
    ) -> Outcome;
}
