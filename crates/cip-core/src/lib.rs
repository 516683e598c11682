//! Core domain model for the catalog import pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cip-core";

/// Upper bound on the per-run list of recent item errors surfaced to monitors.
pub const RECENT_ERROR_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Lifecycle of one import queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 5] = [
        QueueStatus::Pending,
        QueueStatus::Processing,
        QueueStatus::Completed,
        QueueStatus::Failed,
        QueueStatus::Skipped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        match self {
            QueueStatus::Pending | QueueStatus::Processing => false,
            QueueStatus::Completed | QueueStatus::Failed | QueueStatus::Skipped => true,
        }
    }

    /// Whether the queue state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: QueueStatus) -> bool {
        use QueueStatus::*;
        match (self, next) {
            (Pending, Processing) | (Pending, Skipped) => true,
            (Pending, Pending | Completed | Failed) => false,
            (Processing, Pending | Completed | Failed | Skipped) => true,
            (Processing, Processing) => false,
            (Completed | Failed | Skipped, _) => false,
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "queue status",
                value: s.to_string(),
            })
    }
}

/// The statuses an item can be parked in for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalStatus {
    Completed,
    Failed,
    Skipped,
}

impl From<TerminalStatus> for QueueStatus {
    fn from(value: TerminalStatus) -> Self {
        match value {
            TerminalStatus::Completed => QueueStatus::Completed,
            TerminalStatus::Failed => QueueStatus::Failed,
            TerminalStatus::Skipped => QueueStatus::Skipped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Idle,
    Running,
    Stopped,
    Completed,
    Failed,
}

impl RunStatus {
    pub const ALL: [RunStatus; 5] = [
        RunStatus::Idle,
        RunStatus::Running,
        RunStatus::Stopped,
        RunStatus::Completed,
        RunStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Stopped => "stopped",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "run status",
                value: s.to_string(),
            })
    }
}

/// A curated source entity (e.g. an artist) the crawler searches for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlCandidate {
    pub id: Uuid,
    pub name: String,
    pub last_crawled_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub items_found_count: i64,
}

impl CrawlCandidate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            last_crawled_at: None,
            is_active: true,
            items_found_count: 0,
        }
    }
}

/// Crawler handoff into the deduplication gate and the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoundItem {
    pub external_id: String,
    pub aggregate_id: Option<String>,
    pub candidate_id: Option<Uuid>,
    pub title: String,
    pub artist: Option<String>,
    pub year: Option<i32>,
    pub formats: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub external_id: String,
    pub aggregate_id: Option<String>,
    pub candidate_id: Option<Uuid>,
    pub title: String,
    pub artist: Option<String>,
    pub year: Option<i32>,
    pub formats: Vec<String>,
    pub status: QueueStatus,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub artifact_refs: Vec<String>,
}

impl QueueItem {
    pub fn pending(found: FoundItem, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            external_id: found.external_id,
            aggregate_id: found.aggregate_id,
            candidate_id: found.candidate_id,
            title: found.title,
            artist: found.artist,
            year: found.year,
            formats: found.formats,
            status: QueueStatus::Pending,
            retry_count: 0,
            error_message: None,
            created_at,
            claimed_at: None,
            processed_at: None,
            artifact_refs: Vec::new(),
        }
    }
}

/// Per-status item totals for the run monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl QueueCounts {
    pub fn add(&mut self, status: QueueStatus, n: u64) {
        match status {
            QueueStatus::Pending => self.pending += n,
            QueueStatus::Processing => self.processing += n,
            QueueStatus::Completed => self.completed += n,
            QueueStatus::Failed => self.failed += n,
            QueueStatus::Skipped => self.skipped += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.skipped
    }
}

/// What a recovery sweep did with items stuck in `processing`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub requeued: u64,
    pub failed: u64,
}

/// Result of running the per-item pipeline once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    Completed { artifact_refs: Vec<String> },
    Retried { retry_count: i32, error: String },
    Failed { error: String },
    Skipped { reason: String },
}

impl ItemOutcome {
    pub fn error_message(&self) -> Option<&str> {
        match self {
            ItemOutcome::Retried { error, .. } | ItemOutcome::Failed { error } => Some(error),
            ItemOutcome::Completed { .. } | ItemOutcome::Skipped { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub item_id: Uuid,
    pub external_id: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

/// Counters for a single batch, folded into the owning [`BatchRun`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchTally {
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Items whose outcome could not be written back to the queue.
    pub unrecorded: u64,
}

impl BatchTally {
    pub fn record(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Completed { .. } => self.completed += 1,
            ItemOutcome::Retried { .. } => self.retried += 1,
            ItemOutcome::Failed { .. } => self.failed += 1,
            ItemOutcome::Skipped { .. } => self.skipped += 1,
        }
    }

    pub fn processed(&self) -> u64 {
        self.completed + self.retried + self.failed + self.skipped + self.unrecorded
    }

    pub fn errors(&self) -> u64 {
        self.retried + self.failed + self.unrecorded
    }

    /// Nothing produced and nothing went wrong: the queue is probably drained.
    pub fn is_unproductive(&self) -> bool {
        self.completed == 0 && self.errors() == 0
    }
}

/// Persisted state of one orchestrator execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRun {
    pub id: Uuid,
    pub status: RunStatus,
    pub batch_size: i32,
    pub cooldown_secs: i64,
    pub total_items: i64,
    pub processed_items: i64,
    pub successful_items: i64,
    pub failed_items: i64,
    pub retried_items: i64,
    pub skipped_items: i64,
    pub current_batch: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub recent_errors: Vec<ItemError>,
}

impl BatchRun {
    pub fn start(batch_size: i32, cooldown_secs: i64, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: RunStatus::Running,
            batch_size,
            cooldown_secs,
            started_at: Some(started_at),
            updated_at: started_at,
            ..Self::idle()
        }
    }

    /// Projection reported when no run has ever been started.
    pub fn idle() -> Self {
        Self {
            id: Uuid::nil(),
            status: RunStatus::Idle,
            batch_size: 0,
            cooldown_secs: 0,
            total_items: 0,
            processed_items: 0,
            successful_items: 0,
            failed_items: 0,
            retried_items: 0,
            skipped_items: 0,
            current_batch: 0,
            started_at: None,
            completed_at: None,
            updated_at: DateTime::<Utc>::UNIX_EPOCH,
            last_error: None,
            recent_errors: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    pub fn apply_tally(&mut self, tally: &BatchTally, at: DateTime<Utc>) {
        self.processed_items += tally.processed() as i64;
        self.successful_items += tally.completed as i64;
        self.failed_items += (tally.failed + tally.unrecorded) as i64;
        self.retried_items += tally.retried as i64;
        self.skipped_items += tally.skipped as i64;
        self.updated_at = at;
    }

    /// Keeps the newest `RECENT_ERROR_LIMIT` errors, newest last.
    pub fn push_error(&mut self, error: ItemError) {
        self.recent_errors.push(error);
        if self.recent_errors.len() > RECENT_ERROR_LIMIT {
            let overflow = self.recent_errors.len() - RECENT_ERROR_LIMIT;
            self.recent_errors.drain(..overflow);
        }
    }

    pub fn finish(&mut self, status: RunStatus, at: DateTime<Utc>) {
        self.status = status;
        self.completed_at = Some(at);
        self.updated_at = at;
    }
}
