use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cip_core::{
    BatchRun, CrawlCandidate, FoundItem, QueueCounts, QueueItem, QueueStatus, RecoveryReport,
    RunStatus, TerminalStatus,
};
use uuid::Uuid;

use crate::{
    CandidateStore, CanonicalStore, ImportQueue, QueueMonitor, RunStore, StoreError,
};

const STALE_CLAIM_MESSAGE: &str = "claim expired before the item finished processing";

#[derive(Debug, Default)]
struct MemoryState {
    items: Vec<QueueItem>,
    candidates: Vec<CrawlCandidate>,
    published: HashSet<String>,
    runs: Vec<BatchRun>,
}

/// Mutex-guarded implementation of every store; each call is one critical section.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_candidate(&self, candidate: CrawlCandidate) {
        self.state().candidates.push(candidate);
    }

    pub fn candidate(&self, id: Uuid) -> Option<CrawlCandidate> {
        self.state().candidates.iter().find(|c| c.id == id).cloned()
    }

    /// Marks an external id as already present in the canonical store.
    pub fn publish(&self, external_id: impl Into<String>) {
        self.state().published.insert(external_id.into());
    }

    pub fn item(&self, id: Uuid) -> Option<QueueItem> {
        self.state().items.iter().find(|i| i.id == id).cloned()
    }

    pub fn items(&self) -> Vec<QueueItem> {
        self.state().items.clone()
    }

    pub fn runs(&self) -> Vec<BatchRun> {
        self.state().runs.clone()
    }
}

fn transition(item: &mut QueueItem, to: QueueStatus) -> Result<(), StoreError> {
    if !item.status.can_transition_to(to) {
        return Err(StoreError::InvalidTransition {
            id: item.id,
            from: item.status,
            to,
        });
    }
    item.status = to;
    Ok(())
}

#[async_trait]
impl ImportQueue for MemoryStore {
    async fn enqueue(&self, items: &[FoundItem]) -> Result<usize, StoreError> {
        let mut state = self.state();
        let now = Utc::now();
        let mut inserted = 0;
        for found in items {
            let live = state
                .items
                .iter()
                .any(|i| i.external_id == found.external_id && i.status != QueueStatus::Skipped);
            if live {
                continue;
            }
            state.items.push(QueueItem::pending(found.clone(), now));
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<QueueItem>, StoreError> {
        let mut state = self.state();
        let now = Utc::now();

        let mut pending = state
            .items
            .iter()
            .enumerate()
            .filter(|(_, item)| item.status == QueueStatus::Pending)
            .map(|(idx, item)| (item.created_at, idx))
            .collect::<Vec<_>>();
        pending.sort();

        let mut claimed = Vec::new();
        for (_, idx) in pending.into_iter().take(limit) {
            let item = &mut state.items[idx];
            transition(item, QueueStatus::Processing)?;
            item.claimed_at = Some(now);
            claimed.push(item.clone());
        }
        Ok(claimed)
    }

    async fn mark_terminal(
        &self,
        id: Uuid,
        status: TerminalStatus,
        error: Option<&str>,
        artifact_refs: &[String],
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        let item = state
            .items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(StoreError::NotFound(id))?;
        transition(item, status.into())?;
        item.error_message = error.map(str::to_string);
        if !artifact_refs.is_empty() {
            item.artifact_refs = artifact_refs.to_vec();
        }
        item.processed_at = Some(Utc::now());
        Ok(())
    }

    async fn increment_retry(&self, id: Uuid, error: &str) -> Result<i32, StoreError> {
        let mut state = self.state();
        let item = state
            .items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(StoreError::NotFound(id))?;
        transition(item, QueueStatus::Pending)?;
        item.retry_count += 1;
        item.error_message = Some(error.to_string());
        item.claimed_at = None;
        Ok(item.retry_count)
    }

    async fn known_external_ids(&self, ids: &[String]) -> Result<HashSet<String>, StoreError> {
        let wanted = ids.iter().collect::<HashSet<_>>();
        Ok(self
            .state()
            .items
            .iter()
            .filter(|i| wanted.contains(&i.external_id))
            .map(|i| i.external_id.clone())
            .collect())
    }

    async fn pending_count(&self) -> Result<u64, StoreError> {
        Ok(self
            .state()
            .items
            .iter()
            .filter(|i| i.status == QueueStatus::Pending)
            .count() as u64)
    }

    async fn recover_stale(
        &self,
        claimed_before: DateTime<Utc>,
        max_retries: i32,
    ) -> Result<RecoveryReport, StoreError> {
        let mut state = self.state();
        let now = Utc::now();
        let mut report = RecoveryReport::default();

        for item in state.items.iter_mut().filter(|i| {
            i.status == QueueStatus::Processing
                && i.claimed_at.is_some_and(|at| at < claimed_before)
        }) {
            if item.retry_count < max_retries {
                transition(item, QueueStatus::Pending)?;
                item.retry_count += 1;
                report.requeued += 1;
            } else {
                transition(item, QueueStatus::Failed)?;
                item.processed_at = Some(now);
                report.failed += 1;
            }
            item.claimed_at = None;
            item.error_message = Some(STALE_CLAIM_MESSAGE.to_string());
        }
        Ok(report)
    }
}

#[async_trait]
impl QueueMonitor for MemoryStore {
    async fn status_counts(&self) -> Result<QueueCounts, StoreError> {
        let mut counts = QueueCounts::default();
        for item in &self.state().items {
            counts.add(item.status, 1);
        }
        Ok(counts)
    }

    async fn list_items(
        &self,
        status: Option<QueueStatus>,
        limit: usize,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let mut items = self
            .state()
            .items
            .iter()
            .filter(|i| status.is_none_or(|s| i.status == s))
            .cloned()
            .collect::<Vec<_>>();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        items.truncate(limit);
        Ok(items)
    }

    async fn recent_failures(&self, limit: usize) -> Result<Vec<QueueItem>, StoreError> {
        let mut items = self
            .state()
            .items
            .iter()
            .filter(|i| i.status == QueueStatus::Failed)
            .cloned()
            .collect::<Vec<_>>();
        items.sort_by(|a, b| b.processed_at.cmp(&a.processed_at));
        items.truncate(limit);
        Ok(items)
    }
}

#[async_trait]
impl CandidateStore for MemoryStore {
    async fn select_candidates(&self, limit: usize) -> Result<Vec<CrawlCandidate>, StoreError> {
        let mut active = self
            .state()
            .candidates
            .iter()
            .filter(|c| c.is_active)
            .cloned()
            .collect::<Vec<_>>();
        // `None < Some(_)`, so never-crawled candidates sort first.
        active.sort_by(|a, b| {
            a.last_crawled_at
                .cmp(&b.last_crawled_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        active.truncate(limit);
        Ok(active)
    }

    async fn record_crawl_attempt(
        &self,
        id: Uuid,
        found: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        let candidate = state
            .candidates
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or(StoreError::NotFound(id))?;
        candidate.last_crawled_at = Some(at);
        candidate.items_found_count += found;
        Ok(())
    }
}

#[async_trait]
impl CanonicalStore for MemoryStore {
    async fn existing_external_ids(&self, ids: &[String]) -> Result<HashSet<String>, StoreError> {
        let state = self.state();
        Ok(ids
            .iter()
            .filter(|id| state.published.contains(*id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn begin_run(&self, run: &BatchRun) -> Result<(), StoreError> {
        let mut state = self.state();
        if state.runs.iter().any(|r| r.status == RunStatus::Running) {
            return Err(StoreError::RunAlreadyActive);
        }
        state.runs.push(run.clone());
        Ok(())
    }

    async fn save_run(&self, run: &BatchRun) -> Result<(), StoreError> {
        let mut state = self.state();
        match state.runs.iter_mut().find(|r| r.id == run.id) {
            Some(existing) => *existing = run.clone(),
            None => state.runs.push(run.clone()),
        }
        Ok(())
    }

    async fn touch_run(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state();
        if let Some(run) = state
            .runs
            .iter_mut()
            .find(|r| r.id == id && r.status == RunStatus::Running)
        {
            run.updated_at = at;
        }
        Ok(())
    }

    async fn latest_run(&self) -> Result<Option<BatchRun>, StoreError> {
        Ok(self
            .state()
            .runs
            .iter()
            .max_by_key(|r| r.started_at)
            .cloned())
    }

    async fn abandon_stale_runs(&self, updated_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state();
        let now = Utc::now();
        let mut abandoned = 0;
        for run in state
            .runs
            .iter_mut()
            .filter(|r| r.status == RunStatus::Running && r.updated_at < updated_before)
        {
            run.finish(RunStatus::Failed, now);
            run.last_error = Some("run stopped reporting progress".to_string());
            abandoned += 1;
        }
        Ok(abandoned)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;

    fn found(external_id: &str) -> FoundItem {
        FoundItem {
            external_id: external_id.to_string(),
            aggregate_id: None,
            candidate_id: None,
            title: format!("Release {external_id}"),
            artist: Some("Artist".into()),
            year: Some(1997),
            formats: vec!["Vinyl".into()],
        }
    }

    async fn seeded(n: usize) -> MemoryStore {
        let store = MemoryStore::new();
        let items = (0..n).map(|i| found(&format!("r{i}"))).collect::<Vec<_>>();
        assert_eq!(store.enqueue(&items).await.unwrap(), n);
        store
    }

    #[tokio::test]
    async fn enqueue_skips_live_duplicates_but_not_skipped_ones() {
        let store = seeded(2).await;
        assert_eq!(store.enqueue(&[found("r0"), found("r9")]).await.unwrap(), 1);

        let r1 = store.items().into_iter().find(|i| i.external_id == "r1").unwrap();
        store
            .mark_terminal(r1.id, TerminalStatus::Skipped, Some("policy"), &[])
            .await
            .unwrap();
        assert_eq!(store.enqueue(&[found("r1")]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_claims_never_hand_out_the_same_item() {
        let store = Arc::new(seeded(40).await);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.claim_batch(7).await.unwrap() }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for item in handle.await.unwrap() {
                assert_eq!(item.status, QueueStatus::Processing);
                assert!(seen.insert(item.id), "item {} claimed twice", item.id);
                total += 1;
            }
        }
        assert_eq!(total, 40);
        assert_eq!(store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn retried_items_are_claimed_before_newer_ones() {
        let store = seeded(3).await;
        let first = store.claim_batch(1).await.unwrap().remove(0);
        assert_eq!(first.external_id, "r0");

        assert_eq!(store.increment_retry(first.id, "503").await.unwrap(), 1);
        let again = store.claim_batch(1).await.unwrap().remove(0);
        assert_eq!(again.id, first.id);
        assert_eq!(again.retry_count, 1);
        assert_eq!(again.error_message.as_deref(), Some("503"));
    }

    #[tokio::test]
    async fn terminal_states_reject_further_transitions() {
        let store = seeded(1).await;
        let item = store.claim_batch(1).await.unwrap().remove(0);
        store
            .mark_terminal(item.id, TerminalStatus::Completed, None, &["artifact-1".into()])
            .await
            .unwrap();

        let stored = store.item(item.id).unwrap();
        assert_eq!(stored.artifact_refs, vec!["artifact-1".to_string()]);
        assert!(stored.processed_at.is_some());

        let err = store.increment_retry(item.id, "late").await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition { from: QueueStatus::Completed, to: QueueStatus::Pending, .. }
        ));
        let err = store
            .mark_terminal(item.id, TerminalStatus::Failed, Some("late"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn pending_items_cannot_complete_without_a_claim() {
        let store = seeded(1).await;
        let id = store.items()[0].id;
        let err = store
            .mark_terminal(id, TerminalStatus::Completed, None, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { from: QueueStatus::Pending, .. }));
    }

    #[tokio::test]
    async fn recovery_requeues_stale_claims_until_the_cap() {
        let store = seeded(2).await;
        let claimed = store.claim_batch(2).await.unwrap();
        // Burn the retry budget of the second item.
        for _ in 0..3 {
            store.increment_retry(claimed[1].id, "timeout").await.unwrap();
            store.claim_batch(2).await.unwrap();
        }

        let report = store
            .recover_stale(Utc::now() + Duration::seconds(1), 3)
            .await
            .unwrap();
        assert_eq!(report, RecoveryReport { requeued: 1, failed: 1 });

        let first = store.item(claimed[0].id).unwrap();
        assert_eq!(first.status, QueueStatus::Pending);
        assert_eq!(first.retry_count, 1);
        let second = store.item(claimed[1].id).unwrap();
        assert_eq!(second.status, QueueStatus::Failed);
        assert_eq!(store.status_counts().await.unwrap().processing, 0);
    }

    #[tokio::test]
    async fn recovery_leaves_fresh_claims_alone() {
        let store = seeded(1).await;
        store.claim_batch(1).await.unwrap();
        let report = store
            .recover_stale(Utc::now() - Duration::minutes(15), 3)
            .await
            .unwrap();
        assert_eq!(report, RecoveryReport::default());
    }

    #[tokio::test]
    async fn candidates_rotate_by_staleness() {
        let store = MemoryStore::new();
        let mut old = CrawlCandidate::new("Autechre");
        old.last_crawled_at = Some(Utc::now() - Duration::days(3));
        let mut recent = CrawlCandidate::new("Aphex Twin");
        recent.last_crawled_at = Some(Utc::now() - Duration::hours(1));
        let never = CrawlCandidate::new("Plaid");
        let mut inactive = CrawlCandidate::new("Seefeel");
        inactive.is_active = false;
        for c in [recent.clone(), never.clone(), old.clone(), inactive] {
            store.insert_candidate(c);
        }

        let picked = store.select_candidates(10).await.unwrap();
        let names = picked.iter().map(|c| c.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["Plaid", "Autechre", "Aphex Twin"]);

        store.record_crawl_attempt(never.id, 1, Utc::now()).await.unwrap();
        let picked = store.select_candidates(1).await.unwrap();
        assert_eq!(picked[0].name, "Autechre");
        assert_eq!(store.candidate(never.id).unwrap().items_found_count, 1);
    }

    #[tokio::test]
    async fn only_one_run_may_be_running() {
        let store = MemoryStore::new();
        let mut first = BatchRun::start(10, 5, Utc::now());
        store.begin_run(&first).await.unwrap();
        let second = BatchRun::start(10, 5, Utc::now());
        assert!(matches!(
            store.begin_run(&second).await,
            Err(StoreError::RunAlreadyActive)
        ));

        first.finish(RunStatus::Completed, Utc::now());
        store.save_run(&first).await.unwrap();
        store.begin_run(&second).await.unwrap();
        assert_eq!(store.latest_run().await.unwrap().unwrap().id, second.id);
    }

    #[tokio::test]
    async fn silent_runs_are_abandoned() {
        let store = MemoryStore::new();
        let run = BatchRun::start(10, 5, Utc::now() - Duration::hours(2));
        store.begin_run(&run).await.unwrap();

        let abandoned = store
            .abandon_stale_runs(Utc::now() - Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(abandoned, 1);
        let latest = store.latest_run().await.unwrap().unwrap();
        assert_eq!(latest.status, RunStatus::Failed);
        assert!(latest.last_error.is_some());
    }

    #[tokio::test]
    async fn touched_runs_are_not_abandoned() {
        let store = MemoryStore::new();
        let run = BatchRun::start(10, 5, Utc::now() - Duration::hours(2));
        store.begin_run(&run).await.unwrap();
        store.touch_run(run.id, Utc::now()).await.unwrap();

        let abandoned = store
            .abandon_stale_runs(Utc::now() - Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(abandoned, 0);
        assert_eq!(
            store.latest_run().await.unwrap().unwrap().status,
            RunStatus::Running
        );
    }
}
