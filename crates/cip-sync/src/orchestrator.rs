//! Cooldown-paced batch runs over the import queue.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cip_core::{BatchRun, BatchTally, ItemError, QueueItem, RecoveryReport, RunStatus};
use cip_storage::{ImportQueue, RunStore, StoreError};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::BatchSettings;
use crate::pipeline::ItemPipeline;

const CLAIM_ATTEMPTS: usize = 3;
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// Checks operator-supplied settings and converts them to their stored widths.
fn validate(settings: &BatchSettings) -> Result<(i32, i64), OrchestratorError> {
    let invalid = |msg: &str| OrchestratorError::InvalidSettings(msg.to_string());
    let batch_size = i32::try_from(settings.batch_size)
        .ok()
        .filter(|size| *size >= 1)
        .ok_or_else(|| invalid("batch size must be between 1 and 2147483647"))?;
    let cooldown_secs = i64::try_from(settings.cooldown.as_secs())
        .map_err(|_| invalid("cooldown is too long"))?;
    if settings.max_retries < 0 {
        return Err(invalid("max retries cannot be negative"));
    }
    Ok((batch_size, cooldown_secs))
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("a batch run is already running")]
    AlreadyRunning,
    #[error("invalid batch settings: {0}")]
    InvalidSettings(String),
    #[error("batch run task ended abnormally: {0}")]
    Task(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoverySummary {
    pub items: RecoveryReport,
    pub abandoned_runs: u64,
}

#[derive(Default)]
struct ActiveRun {
    token: Option<CancellationToken>,
    handle: Option<JoinHandle<Result<BatchRun, OrchestratorError>>>,
}

/// Clears the in-process run slot when the driving task ends, however it ends.
struct SlotGuard {
    active: Arc<Mutex<ActiveRun>>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        lock(&self.active).token = None;
    }
}

fn lock(active: &Mutex<ActiveRun>) -> MutexGuard<'_, ActiveRun> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone)]
pub struct BatchOrchestrator {
    queue: Arc<dyn ImportQueue>,
    runs: Arc<dyn RunStore>,
    pipeline: Arc<ItemPipeline>,
    stale_after: Duration,
    active: Arc<Mutex<ActiveRun>>,
}

impl BatchOrchestrator {
    pub fn new(
        queue: Arc<dyn ImportQueue>,
        runs: Arc<dyn RunStore>,
        pipeline: Arc<ItemPipeline>,
        stale_after: Duration,
    ) -> Self {
        Self {
            queue,
            runs,
            pipeline,
            stale_after,
            active: Arc::default(),
        }
    }

    /// Starts a run in a background task and returns its initial state.
    pub async fn start(&self, settings: BatchSettings) -> Result<BatchRun, OrchestratorError> {
        let (token, guard) = self.claim_slot(CancellationToken::new())?;
        let run = self.prepare(&settings).await?;

        let this = self.clone();
        let initial = run.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            this.drive(run, settings, token).await
        });
        lock(&self.active).handle = Some(handle);
        Ok(initial)
    }

    /// Drives a run to its end on the caller's task.
    pub async fn run(
        &self,
        settings: BatchSettings,
        token: CancellationToken,
    ) -> Result<BatchRun, OrchestratorError> {
        let (token, _guard) = self.claim_slot(token.child_token())?;
        let run = self.prepare(&settings).await?;
        self.drive(run, settings, token).await
    }

    /// Requests a cooperative stop; returns whether a run was active.
    pub fn stop(&self) -> bool {
        match &lock(&self.active).token {
            Some(token) => {
                token.cancel();
                info!("stop requested");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.active).token.is_some()
    }

    /// Latest persisted run, or the idle projection when none exists.
    pub async fn status(&self) -> Result<BatchRun, StoreError> {
        Ok(self.runs.latest_run().await?.unwrap_or_else(BatchRun::idle))
    }

    /// Waits for the background run started by [`start`](Self::start), if any.
    pub async fn join(&self) -> Option<Result<BatchRun, OrchestratorError>> {
        let handle = lock(&self.active).handle.take()?;
        Some(match handle.await {
            Ok(result) => result,
            Err(err) => Err(OrchestratorError::Task(err.to_string())),
        })
    }

    /// Fails runs that stopped reporting, then releases items stuck in
    /// processing unless a live run still owns them.
    pub async fn recover(&self, max_retries: i32) -> Result<RecoverySummary, StoreError> {
        let cutoff = self.stale_cutoff();
        let abandoned_runs = self.runs.abandon_stale_runs(cutoff).await?;
        let live_run = self
            .runs
            .latest_run()
            .await?
            .filter(|run| run.is_running());
        let items = match live_run {
            Some(run) => {
                info!(run_id = %run.id, "run in progress; leaving processing items alone");
                RecoveryReport::default()
            }
            None => self.recover_items(cutoff, max_retries).await?,
        };
        if abandoned_runs > 0 {
            warn!(abandoned_runs, "abandoned runs marked failed");
        }
        Ok(RecoverySummary {
            items,
            abandoned_runs,
        })
    }

    fn stale_cutoff(&self) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::zero())
    }

    /// Interval at which a working run refreshes `updated_at`.
    fn heartbeat_every(&self) -> Duration {
        (self.stale_after / 3).max(MIN_HEARTBEAT)
    }

    async fn recover_items(
        &self,
        cutoff: DateTime<Utc>,
        max_retries: i32,
    ) -> Result<RecoveryReport, StoreError> {
        let items = self.queue.recover_stale(cutoff, max_retries).await?;
        if items.requeued > 0 || items.failed > 0 {
            warn!(
                requeued = items.requeued,
                failed = items.failed,
                "released stale processing items"
            );
        }
        Ok(items)
    }

    fn claim_slot(
        &self,
        token: CancellationToken,
    ) -> Result<(CancellationToken, SlotGuard), OrchestratorError> {
        let mut active = lock(&self.active);
        if active.token.is_some() {
            return Err(OrchestratorError::AlreadyRunning);
        }
        active.token = Some(token.clone());
        Ok((
            token,
            SlotGuard {
                active: self.active.clone(),
            },
        ))
    }

    async fn prepare(&self, settings: &BatchSettings) -> Result<BatchRun, OrchestratorError> {
        let (batch_size, cooldown_secs) = validate(settings)?;

        let cutoff = self.stale_cutoff();
        let abandoned_runs = self.runs.abandon_stale_runs(cutoff).await?;
        if abandoned_runs > 0 {
            warn!(abandoned_runs, "abandoned runs marked failed");
        }

        let mut run = BatchRun::start(batch_size, cooldown_secs, Utc::now());
        run.total_items = self.queue.pending_count().await? as i64;
        match self.runs.begin_run(&run).await {
            Ok(()) => {}
            Err(StoreError::RunAlreadyActive) => return Err(OrchestratorError::AlreadyRunning),
            Err(err) => return Err(err.into()),
        }

        // Only the run that owns the queue may release items left by a crashed one.
        let recovered = match self.recover_items(cutoff, settings.max_retries).await {
            Ok(recovered) => recovered,
            Err(err) => return self.abort(run, err).await,
        };
        if recovered.requeued > 0 {
            let refreshed = match self.queue.pending_count().await {
                Ok(pending) => pending,
                Err(err) => return self.abort(run, err).await,
            };
            run.total_items = refreshed as i64;
            if let Err(err) = self.runs.save_run(&run).await {
                return self.abort(run, err).await;
            }
        }

        info!(
            run_id = %run.id,
            batch_size = settings.batch_size,
            cooldown_secs = settings.cooldown.as_secs(),
            pending = run.total_items,
            "batch run started"
        );
        Ok(run)
    }

    /// Runs `work` while refreshing the run's `updated_at` so recovery
    /// sweeps never mistake it for an abandoned run.
    async fn with_heartbeat<F: Future>(&self, run_id: Uuid, work: F) -> F::Output {
        let mut ticker = tokio::time::interval(self.heartbeat_every());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        tokio::pin!(work);
        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = ticker.tick() => {
                    if let Err(err) = self.runs.touch_run(run_id, Utc::now()).await {
                        warn!(error = %err, "run heartbeat failed");
                    }
                }
            }
        }
    }

    async fn drive(
        &self,
        run: BatchRun,
        settings: BatchSettings,
        token: CancellationToken,
    ) -> Result<BatchRun, OrchestratorError> {
        let span = info_span!("batch_run", run_id = %run.id);
        self.drive_loop(run, settings, token).instrument(span).await
    }

    async fn drive_loop(
        &self,
        mut run: BatchRun,
        settings: BatchSettings,
        token: CancellationToken,
    ) -> Result<BatchRun, OrchestratorError> {
        loop {
            if token.is_cancelled() {
                return self.finish(run, RunStatus::Stopped).await;
            }

            let batch = match self.claim_with_retry(settings.batch_size).await {
                Ok(batch) => batch,
                Err(err) => return self.abort(run, err).await,
            };
            if batch.is_empty() {
                return self.finish(run, RunStatus::Completed).await;
            }

            run.current_batch += 1;
            let claimed = batch.len();
            let run_id = run.id;
            let tally = self
                .with_heartbeat(run_id, self.process_batch(&mut run, batch, &settings))
                .await;

            let pending = match self.queue.pending_count().await {
                Ok(pending) => pending,
                Err(err) => return self.abort(run, err).await,
            };
            run.apply_tally(&tally, Utc::now());
            run.total_items = run.processed_items + pending as i64;
            if let Err(err) = self.runs.save_run(&run).await {
                return self.abort(run, err).await;
            }
            info!(
                batch = run.current_batch,
                claimed,
                completed = tally.completed,
                retried = tally.retried,
                failed = tally.failed,
                skipped = tally.skipped,
                unrecorded = tally.unrecorded,
                pending,
                "batch finished"
            );

            if token.is_cancelled() {
                return self.finish(run, RunStatus::Stopped).await;
            }

            if tally.is_unproductive() {
                if pending == 0 {
                    return self.finish(run, RunStatus::Completed).await;
                }
                // Something else is still feeding the queue; skip the cooldown.
                continue;
            }

            let cooldown = self.with_heartbeat(run.id, async {
                tokio::select! {
                    _ = token.cancelled() => false,
                    _ = tokio::time::sleep(settings.cooldown) => true,
                }
            });
            if !cooldown.await {
                return self.finish(run, RunStatus::Stopped).await;
            }
        }
    }

    async fn claim_with_retry(&self, limit: usize) -> Result<Vec<QueueItem>, StoreError> {
        let mut attempt = 1;
        loop {
            match self.queue.claim_batch(limit).await {
                Ok(batch) => return Ok(batch),
                Err(err) if attempt < CLAIM_ATTEMPTS => {
                    warn!(attempt, error = %err, "claim failed; retrying");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn process_batch(
        &self,
        run: &mut BatchRun,
        batch: Vec<QueueItem>,
        settings: &BatchSettings,
    ) -> BatchTally {
        let max_retries = settings.max_retries;
        let results = stream::iter(batch)
            .map(|item| {
                let pipeline = self.pipeline.clone();
                let item_id = item.id;
                let external_id = item.external_id.clone();
                async move {
                    let result =
                        tokio::spawn(async move { pipeline.process(item, max_retries).await })
                            .await;
                    (item_id, external_id, result)
                }
            })
            .buffer_unordered(settings.batch_size.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut tally = BatchTally::default();
        for (item_id, external_id, result) in results {
            let message = match result {
                Ok(Ok(outcome)) => {
                    tally.record(&outcome);
                    outcome.error_message().map(str::to_string)
                }
                Ok(Err(err)) => {
                    tally.unrecorded += 1;
                    error!(%item_id, error = %err, "item outcome could not be recorded");
                    Some(format!("outcome not recorded: {err}"))
                }
                Err(err) => {
                    tally.unrecorded += 1;
                    error!(%item_id, error = %err, "item task aborted");
                    Some(format!("item task aborted: {err}"))
                }
            };
            if let Some(message) = message {
                run.push_error(ItemError {
                    item_id,
                    external_id,
                    message,
                    occurred_at: Utc::now(),
                });
            }
        }
        tally
    }

    async fn finish(
        &self,
        mut run: BatchRun,
        status: RunStatus,
    ) -> Result<BatchRun, OrchestratorError> {
        run.finish(status, Utc::now());
        self.runs.save_run(&run).await?;
        info!(
            status = %status,
            batches = run.current_batch,
            processed = run.processed_items,
            successful = run.successful_items,
            failed = run.failed_items,
            "batch run ended"
        );
        Ok(run)
    }

    async fn abort(
        &self,
        mut run: BatchRun,
        err: StoreError,
    ) -> Result<BatchRun, OrchestratorError> {
        error!(error = %err, "batch run aborted");
        run.last_error = Some(err.to_string());
        run.finish(RunStatus::Failed, Utc::now());
        if let Err(save_err) = self.runs.save_run(&run).await {
            error!(error = %save_err, "could not persist failed run");
        }
        Err(err.into())
    }
}
