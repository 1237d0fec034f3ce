//! Batch and item records, the status state machine and aggregate counts.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a persisted batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub u64);

/// Identifier of a persisted job item (one row per job within a batch)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub u64);

/// Identifier of the unit of work an item executes (a test case)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status shared by batches and their items.
///
/// Both follow `pending -> running -> {completed | failed | cancelled}`. A pending
/// record may also jump straight to a terminal state: an item that is cancelled
/// before a worker picks it up, or a batch created with no jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Created, not started
    Pending,
    /// Picked up by a worker (or, for a batch, started)
    Running,
    /// Finished normally
    Completed,
    /// Finished with a failure
    Failed,
    /// Stopped by a cancel request
    Cancelled,
}

impl ExecutionStatus {
    /// Whether no further transitions are allowed
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (Pending, Running) => true,
            (Pending, Completed | Failed | Cancelled) => true,
            (Running, Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }

    /// Lowercase wire name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate item counts of one batch.
///
/// Always derived from the full set of item statuses, never incremented, so
/// `success + failed + cancelled + running + pending == total` holds for every
/// value produced by [`BatchCounts::from_statuses`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchCounts {
    pub total_count: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub cancelled_count: usize,
    pub running_count: usize,
    pub pending_count: usize,
}

impl BatchCounts {
    /// Recompute counts from item statuses
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = ExecutionStatus>,
    {
        let mut counts = Self::default();
        for status in statuses {
            counts.total_count += 1;
            match status {
                ExecutionStatus::Pending => counts.pending_count += 1,
                ExecutionStatus::Running => counts.running_count += 1,
                ExecutionStatus::Completed => counts.success_count += 1,
                ExecutionStatus::Failed => counts.failed_count += 1,
                ExecutionStatus::Cancelled => counts.cancelled_count += 1,
            }
        }
        counts
    }

    /// Check the partition invariant
    pub fn is_consistent(&self) -> bool {
        self.success_count
            + self.failed_count
            + self.cancelled_count
            + self.running_count
            + self.pending_count
            == self.total_count
    }

    /// Whether every item reached a terminal state
    pub fn all_terminal(&self) -> bool {
        self.running_count == 0 && self.pending_count == 0
    }
}

/// Options supplied when creating a batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Display name; defaults to `batch_<timestamp>`
    pub name: Option<String>,
    /// Run the browser without a visible window; unset uses the orchestrator default
    #[serde(default)]
    pub headless: Option<bool>,
}

impl BatchOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            headless: None,
        }
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = Some(headless);
        self
    }

    /// Name to persist, generating one from `now` if none was given
    pub fn resolve_name(&self, now: DateTime<Utc>) -> String {
        match &self.name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => format!("batch_{}", now.format("%Y%m%d_%H%M%S")),
        }
    }
}

/// Fields needed to insert a new batch row
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub name: String,
    pub headless: bool,
    pub total_count: usize,
}

/// A persisted batch of job items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: BatchId,
    pub name: String,
    pub status: ExecutionStatus,
    #[serde(flatten)]
    pub counts: BatchCounts,
    pub headless: bool,
    /// Sum of the runner-reported durations of finished items, in seconds
    pub total_duration: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl BatchJob {
    /// Apply recomputed aggregates and bump `updated_at`
    pub fn apply_items(&mut self, items: &[JobItem], now: DateTime<Utc>) {
        self.counts = BatchCounts::from_statuses(items.iter().map(|item| item.status));
        self.total_duration = items.iter().filter_map(|item| item.duration_seconds).sum();
        self.updated_at = now;
    }

    /// Move to a new status, stamping `started_at`/`completed_at` as appropriate
    pub fn set_status(&mut self, status: ExecutionStatus, now: DateTime<Utc>) {
        if status == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
        self.status = status;
        self.updated_at = now;
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        BatchSnapshot {
            batch_id: self.id,
            status: self.status,
            counts: self.counts,
            total_duration: self.total_duration,
            started_at: self.started_at,
            completed_at: self.completed_at,
            updated_at: self.updated_at,
        }
    }
}

/// One unit of work inside a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobItem {
    pub id: ItemId,
    pub batch_id: BatchId,
    pub job_id: JobId,
    pub status: ExecutionStatus,
    /// Opaque pointer to the runner's result record
    pub execution_ref: Option<String>,
    pub duration_seconds: Option<f64>,
    pub summary: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl JobItem {
    /// Apply a transition, refusing illegal ones.
    ///
    /// Returns `false` and leaves the item untouched when the move is not allowed.
    /// Items only skip `running` when they are cancelled before being picked up.
    pub fn transition(&mut self, next: ExecutionStatus, now: DateTime<Utc>) -> bool {
        let skips_running = self.status == ExecutionStatus::Pending
            && matches!(next, ExecutionStatus::Completed | ExecutionStatus::Failed);
        if skips_running || !self.status.can_transition_to(next) {
            return false;
        }
        if next == ExecutionStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        true
    }
}

/// Point-in-time view of a batch, as pushed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub batch_id: BatchId,
    pub status: ExecutionStatus,
    #[serde(flatten)]
    pub counts: BatchCounts,
    pub total_duration: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionStatus::*;

    fn item(status: ExecutionStatus) -> JobItem {
        let now = Utc::now();
        JobItem {
            id: ItemId(1),
            batch_id: BatchId(1),
            job_id: JobId(7),
            status,
            execution_ref: None,
            duration_seconds: None,
            summary: None,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    #[test]
    fn test_transition_table() {
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Running));
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_item_transition_stamps_times() {
        let mut job = item(Pending);
        let now = Utc::now();
        assert!(job.transition(Running, now));
        assert_eq!(job.started_at, Some(now));
        assert!(job.completed_at.is_none());

        assert!(job.transition(Completed, now));
        assert_eq!(job.completed_at, Some(now));

        // terminal items stay put
        assert!(!job.transition(Failed, now));
        assert_eq!(job.status, Completed);
    }

    #[test]
    fn test_item_cannot_finish_without_running() {
        let now = Utc::now();
        let mut job = item(Pending);
        assert!(!job.transition(Completed, now));
        assert!(!job.transition(Failed, now));
        assert!(job.transition(Cancelled, now));
        assert!(job.started_at.is_none());
    }

    #[test]
    fn test_counts_from_statuses() {
        let counts =
            BatchCounts::from_statuses([Completed, Failed, Running, Pending, Cancelled, Completed]);
        assert_eq!(counts.total_count, 6);
        assert_eq!(counts.success_count, 2);
        assert_eq!(counts.failed_count, 1);
        assert_eq!(counts.cancelled_count, 1);
        assert_eq!(counts.running_count, 1);
        assert_eq!(counts.pending_count, 1);
        assert!(counts.is_consistent());
        assert!(!counts.all_terminal());

        let empty = BatchCounts::from_statuses(std::iter::empty());
        assert!(empty.is_consistent());
        assert!(empty.all_terminal());
    }

    #[test]
    fn test_default_batch_name() {
        let now = DateTime::parse_from_rfc3339("2024-03-05T07:08:09Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(BatchOptions::default().resolve_name(now), "batch_20240305_070809");
        assert_eq!(BatchOptions::named("nightly").resolve_name(now), "nightly");
        assert_eq!(BatchOptions::named("  ").resolve_name(now), "batch_20240305_070809");
        assert_eq!(BatchOptions::default().with_headless(true).headless, Some(true));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Cancelled).unwrap(), "\"cancelled\"");
        let parsed: ExecutionStatus = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(parsed, Running);
    }
}
