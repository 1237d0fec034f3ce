//! Wire messages exchanged with progress subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::batch::{BatchCounts, BatchId, BatchSnapshot, ExecutionStatus};

/// Payload of a `batch_execution_update`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressData {
    pub status: ExecutionStatus,
    #[serde(flatten)]
    pub counts: BatchCounts,
    pub total_duration: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<&BatchSnapshot> for ProgressData {
    fn from(snapshot: &BatchSnapshot) -> Self {
        Self {
            status: snapshot.status,
            counts: snapshot.counts,
            total_duration: snapshot.total_duration,
            started_at: snapshot.started_at,
            completed_at: snapshot.completed_at,
            updated_at: snapshot.updated_at,
        }
    }
}

/// Messages pushed to a subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    BatchExecutionUpdate {
        batch_execution_id: BatchId,
        data: ProgressData,
        timestamp: DateTime<Utc>,
    },
    SubscriptionConfirmed {
        batch_execution_id: BatchId,
        message: String,
    },
    UnsubscriptionConfirmed {
        batch_execution_id: BatchId,
        message: String,
    },
    Pong,
    Error {
        message: String,
    },
}

impl ServerMessage {
    /// Progress update for one snapshot, stamped now
    pub fn update(snapshot: &BatchSnapshot) -> Self {
        ServerMessage::BatchExecutionUpdate {
            batch_execution_id: snapshot.batch_id,
            data: ProgressData::from(snapshot),
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Messages accepted on the control channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    SubscribeBatch { batch_execution_id: BatchId },
    UnsubscribeBatch { batch_execution_id: BatchId },
    Ping,
}
