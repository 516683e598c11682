//! One crawl cycle: pick stale candidates, search the catalog, enqueue at most
//! one fresh concrete item per candidate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cip_catalog::{CatalogApi, CatalogError, FormatFilter, RawResult, ResultKind, SearchQuery};
use cip_core::{CrawlCandidate, FoundItem};
use cip_storage::{CandidateStore, ImportQueue, StoreError};
use rand::seq::SliceRandom;
use serde::Serialize;
use strsim::jaro_winkler;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::dedup::DeduplicationGate;

#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub candidate_limit: usize,
    pub name_match_threshold: f64,
    pub retry_backoff: Duration,
    pub per_page: u32,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            candidate_limit: 25,
            name_match_threshold: 0.85,
            retry_backoff: Duration::from_secs(2),
            per_page: 50,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrawlReport {
    pub candidates_attempted: usize,
    pub results_seen: usize,
    pub filtered_out: usize,
    pub aggregates_resolved: usize,
    pub aggregates_unresolved: usize,
    pub picked: usize,
    pub duplicates: usize,
    pub enqueued: usize,
    pub catalog_errors: usize,
    pub cancelled: bool,
}

/// Lowercases and drops the catalog's disambiguation suffixes (`"Name (2)"`, `"Name*"`).
pub fn normalize_artist(name: &str) -> String {
    let mut name = name.trim().trim_end_matches('*').trim();
    if let Some(open) = name.rfind(" (") {
        let suffix = &name[open + 2..];
        if let Some(digits) = suffix.strip_suffix(')') {
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                name = &name[..open];
            }
        }
    }
    name.to_lowercase()
}

pub struct Crawler {
    catalog: Arc<dyn CatalogApi>,
    candidates: Arc<dyn CandidateStore>,
    queue: Arc<dyn ImportQueue>,
    gate: DeduplicationGate,
    formats: FormatFilter,
    settings: CrawlSettings,
}

impl Crawler {
    pub fn new(
        catalog: Arc<dyn CatalogApi>,
        candidates: Arc<dyn CandidateStore>,
        queue: Arc<dyn ImportQueue>,
        gate: DeduplicationGate,
        formats: FormatFilter,
        settings: CrawlSettings,
    ) -> Self {
        Self {
            catalog,
            candidates,
            queue,
            gate,
            formats,
            settings,
        }
    }

    pub async fn run_cycle(&self, token: &CancellationToken) -> Result<CrawlReport, StoreError> {
        let selected = self
            .candidates
            .select_candidates(self.settings.candidate_limit)
            .await?;
        info!(candidates = selected.len(), "crawl cycle started");

        let mut report = CrawlReport::default();
        let mut attempted = Vec::with_capacity(selected.len());
        let mut picks = Vec::new();

        for candidate in &selected {
            if token.is_cancelled() {
                report.cancelled = true;
                break;
            }
            report.candidates_attempted += 1;
            attempted.push(candidate.id);

            let span = info_span!("crawl_candidate", candidate = %candidate.name);
            match self.crawl_candidate(candidate, &mut report).instrument(span).await {
                Ok(Some(found)) => picks.push(found),
                Ok(None) => {}
                Err(err) => {
                    report.catalog_errors += 1;
                    if err.is_retryable() {
                        warn!(candidate = %candidate.name, error = %err, "catalog unavailable; backing off");
                        tokio::select! {
                            _ = token.cancelled() => {}
                            _ = tokio::time::sleep(self.settings.retry_backoff) => {}
                        }
                    } else {
                        warn!(candidate = %candidate.name, error = %err, "candidate skipped");
                    }
                }
            }
        }

        report.picked = picks.len();
        let mut found_per_candidate: HashMap<Uuid, i64> = HashMap::new();
        let enqueued = self
            .enqueue_fresh(picks, &mut report, &mut found_per_candidate)
            .await;

        // Attempts are recorded even when enqueueing failed part way.
        let now = Utc::now();
        for id in attempted {
            let found = found_per_candidate.get(&id).copied().unwrap_or(0);
            if let Err(err) = self.candidates.record_crawl_attempt(id, found, now).await {
                warn!(candidate_id = %id, error = %err, "failed to record crawl attempt");
            }
        }

        if let Err(err) = enqueued {
            warn!(enqueued = report.enqueued, error = %err, "crawl cycle aborted");
            return Err(err);
        }
        info!(
            attempted = report.candidates_attempted,
            picked = report.picked,
            duplicates = report.duplicates,
            enqueued = report.enqueued,
            catalog_errors = report.catalog_errors,
            "crawl cycle finished"
        );
        Ok(report)
    }

    /// Enqueues picks that survive the dedup gate, stopping at the first store error.
    async fn enqueue_fresh(
        &self,
        picks: Vec<FoundItem>,
        report: &mut CrawlReport,
        found_per_candidate: &mut HashMap<Uuid, i64>,
    ) -> Result<(), StoreError> {
        let fresh = self.gate.filter_new(picks).await?;
        report.duplicates = report.picked - fresh.len();

        for item in &fresh {
            let inserted = self.queue.enqueue(std::slice::from_ref(item)).await?;
            report.enqueued += inserted;
            if let Some(candidate_id) = item.candidate_id {
                *found_per_candidate.entry(candidate_id).or_default() += inserted as i64;
            }
        }
        Ok(())
    }

    async fn crawl_candidate(
        &self,
        candidate: &CrawlCandidate,
        report: &mut CrawlReport,
    ) -> Result<Option<FoundItem>, CatalogError> {
        let query = SearchQuery {
            per_page: self.settings.per_page,
            ..SearchQuery::for_name(candidate.name.clone())
        };
        let results = self.catalog.search(&query).await?;
        let seen = results.len();
        report.results_seen += seen;

        let mut eligible = results
            .into_iter()
            .filter(|result| self.is_eligible(candidate, result))
            .collect::<Vec<_>>();
        report.filtered_out += seen - eligible.len();
        eligible.shuffle(&mut rand::rng());
        debug!(seen, eligible = eligible.len(), "search results filtered");

        for result in eligible {
            if !result.is_aggregate() {
                let (id, aggregate_id) = (result.id.clone(), result.master_id.clone());
                return Ok(Some(found_item(candidate, &result, id, aggregate_id)));
            }
            match self.catalog.resolve_aggregate(&result.id).await {
                Ok(concrete_id) => {
                    report.aggregates_resolved += 1;
                    let aggregate_id = Some(result.id.clone());
                    return Ok(Some(found_item(candidate, &result, concrete_id, aggregate_id)));
                }
                Err(err) => {
                    report.aggregates_unresolved += 1;
                    warn!(aggregate_id = %result.id, error = %err, "aggregate could not be resolved");
                }
            }
        }
        Ok(None)
    }

    fn is_eligible(&self, candidate: &CrawlCandidate, result: &RawResult) -> bool {
        if result.kind == ResultKind::Other || !self.formats.accepts(&result.format) {
            return false;
        }
        match result.artist_and_title() {
            (Some(artist), _) => {
                jaro_winkler(&normalize_artist(artist), &normalize_artist(&candidate.name))
                    >= self.settings.name_match_threshold
            }
            (None, _) => false,
        }
    }
}

fn found_item(
    candidate: &CrawlCandidate,
    result: &RawResult,
    external_id: String,
    aggregate_id: Option<String>,
) -> FoundItem {
    let (artist, title) = result.artist_and_title();
    FoundItem {
        external_id,
        aggregate_id,
        candidate_id: Some(candidate.id),
        title: title.to_string(),
        artist: artist.map(str::to_string).or_else(|| Some(candidate.name.clone())),
        year: result.year,
        formats: result.format.clone(),
    }
}
