//! Durable import queue, candidate, canonical and run stores.
//!
//! Every store is a trait so the sync pipeline can run against Postgres in
//! production and [`MemoryStore`] in tests and dry runs.

mod memory;
mod postgres;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cip_core::{
    BatchRun, CrawlCandidate, FoundItem, QueueCounts, QueueItem, QueueStatus, RecoveryReport,
    TerminalStatus,
};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "cip-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("queue item {0} not found")]
    NotFound(Uuid),
    #[error("queue item {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: QueueStatus,
        to: QueueStatus,
    },
    #[error("a batch run is already running")]
    RunAlreadyActive,
    #[error("corrupt row: {0}")]
    Decode(String),
}

/// Statuses an item may be in right before moving to `target`.
pub fn allowed_sources(target: QueueStatus) -> Vec<QueueStatus> {
    QueueStatus::ALL
        .into_iter()
        .filter(|from| from.can_transition_to(target))
        .collect()
}

#[async_trait]
pub trait ImportQueue: Send + Sync {
    /// Inserts items that are not already live in the queue; returns how many were added.
    async fn enqueue(&self, items: &[FoundItem]) -> Result<usize, StoreError>;

    /// Atomically moves up to `limit` pending items to processing, oldest first.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<QueueItem>, StoreError>;

    async fn mark_terminal(
        &self,
        id: Uuid,
        status: TerminalStatus,
        error: Option<&str>,
        artifact_refs: &[String],
    ) -> Result<(), StoreError>;

    /// Sends a processing item back to pending and returns its new retry count.
    async fn increment_retry(&self, id: Uuid, error: &str) -> Result<i32, StoreError>;

    /// External ids present in the queue under any status.
    async fn known_external_ids(&self, ids: &[String]) -> Result<HashSet<String>, StoreError>;

    async fn pending_count(&self) -> Result<u64, StoreError>;

    /// Releases items whose claim is older than `claimed_before`.
    async fn recover_stale(
        &self,
        claimed_before: DateTime<Utc>,
        max_retries: i32,
    ) -> Result<RecoveryReport, StoreError>;
}

/// Read-only view of the queue for dashboards.
#[async_trait]
pub trait QueueMonitor: Send + Sync {
    async fn status_counts(&self) -> Result<QueueCounts, StoreError>;

    async fn list_items(
        &self,
        status: Option<QueueStatus>,
        limit: usize,
    ) -> Result<Vec<QueueItem>, StoreError>;

    async fn recent_failures(&self, limit: usize) -> Result<Vec<QueueItem>, StoreError>;
}

#[async_trait]
pub trait CandidateStore: Send + Sync {
    /// Active candidates, least recently crawled first (never-crawled before all).
    async fn select_candidates(&self, limit: usize) -> Result<Vec<CrawlCandidate>, StoreError>;

    async fn record_crawl_attempt(
        &self,
        id: Uuid,
        found: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CanonicalStore: Send + Sync {
    async fn existing_external_ids(&self, ids: &[String]) -> Result<HashSet<String>, StoreError>;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persists a fresh running run, or fails with [`StoreError::RunAlreadyActive`].
    async fn begin_run(&self, run: &BatchRun) -> Result<(), StoreError>;

    async fn save_run(&self, run: &BatchRun) -> Result<(), StoreError>;

    /// Refreshes `updated_at` of a run that is still running.
    async fn touch_run(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn latest_run(&self) -> Result<Option<BatchRun>, StoreError>;

    /// Fails running runs that stopped reporting before `updated_before`.
    async fn abandon_stale_runs(&self, updated_before: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_sources_follow_the_state_machine() {
        assert_eq!(allowed_sources(QueueStatus::Completed), vec![QueueStatus::Processing]);
        assert_eq!(
            allowed_sources(QueueStatus::Skipped),
            vec![QueueStatus::Pending, QueueStatus::Processing]
        );
        assert_eq!(allowed_sources(QueueStatus::Processing), vec![QueueStatus::Pending]);
    }
}
