use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cip_core::{
    BatchRun, CrawlCandidate, FoundItem, ItemError, QueueCounts, QueueItem, QueueStatus,
    RecoveryReport, RunStatus, TerminalStatus,
};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    allowed_sources, CandidateStore, CanonicalStore, ImportQueue, QueueMonitor, RunStore,
    StoreError,
};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const ITEM_COLUMNS: &str = "id, external_id, aggregate_id, candidate_id, title, artist, year, \
     formats, status, retry_count, error_message, created_at, claimed_at, processed_at, \
     artifact_refs";

const RUN_COLUMNS: &str = "id, status, batch_size, cooldown_secs, total_items, processed_items, \
     successful_items, failed_items, retried_items, skipped_items, current_batch, started_at, \
     completed_at, updated_at, last_error, recent_errors";

/// Inserts a whole run, in `RUN_COLUMNS` order.
const INSERT_RUN: &str = "INSERT INTO batch_runs (id, status, batch_size, cooldown_secs, \
     total_items, processed_items, successful_items, failed_items, retried_items, skipped_items, \
     current_batch, started_at, completed_at, updated_at, last_error, recent_errors) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)";

const STALE_CLAIM_MESSAGE: &str = "claim expired before the item finished processing";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    /// Inserts a candidate by name, reactivating it if it already exists.
    pub async fn upsert_candidate(&self, name: &str) -> Result<CrawlCandidate, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO crawl_candidates (id, name, is_active)
            VALUES ($1, $2, TRUE)
            ON CONFLICT (name) DO UPDATE SET is_active = TRUE
            RETURNING id, name, last_crawled_at, is_active, items_found_count
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name.trim())
        .fetch_one(&self.pool)
        .await?;
        candidate_from_row(&row)
    }

    async fn describe_rejection(&self, id: Uuid, to: QueueStatus) -> StoreError {
        let current = sqlx::query("SELECT status FROM import_queue WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await;
        match current {
            Ok(Some(row)) => match row
                .try_get::<String, _>("status")
                .map_err(StoreError::from)
                .and_then(|s| parse_status(&s))
            {
                Ok(from) => StoreError::InvalidTransition { id, from, to },
                Err(err) => err,
            },
            Ok(None) => StoreError::NotFound(id),
            Err(err) => err.into(),
        }
    }
}

fn parse_status(raw: &str) -> Result<QueueStatus, StoreError> {
    raw.parse()
        .map_err(|err: cip_core::UnknownVariant| StoreError::Decode(err.to_string()))
}

fn status_strings(statuses: &[QueueStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

fn item_from_row(row: &PgRow) -> Result<QueueItem, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(QueueItem {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        aggregate_id: row.try_get("aggregate_id")?,
        candidate_id: row.try_get("candidate_id")?,
        title: row.try_get("title")?,
        artist: row.try_get("artist")?,
        year: row.try_get("year")?,
        formats: row.try_get("formats")?,
        status: parse_status(&status)?,
        retry_count: row.try_get("retry_count")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        claimed_at: row.try_get("claimed_at")?,
        processed_at: row.try_get("processed_at")?,
        artifact_refs: row.try_get("artifact_refs")?,
    })
}

fn candidate_from_row(row: &PgRow) -> Result<CrawlCandidate, StoreError> {
    Ok(CrawlCandidate {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        last_crawled_at: row.try_get("last_crawled_at")?,
        is_active: row.try_get("is_active")?,
        items_found_count: row.try_get("items_found_count")?,
    })
}

/// Column values of a `batch_runs` row, decoupled from the driver for decoding.
#[derive(Debug, Clone)]
struct BatchRunRow {
    id: Uuid,
    status: String,
    batch_size: i32,
    cooldown_secs: i64,
    total_items: i64,
    processed_items: i64,
    successful_items: i64,
    failed_items: i64,
    retried_items: i64,
    skipped_items: i64,
    current_batch: i32,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    last_error: Option<String>,
    recent_errors: Vec<ItemError>,
}

impl BatchRunRow {
    fn from_row(row: &PgRow) -> Result<Self, StoreError> {
        let Json(recent_errors) = row.try_get::<Json<Vec<ItemError>>, _>("recent_errors")?;
        Ok(Self {
            id: row.try_get("id")?,
            status: row.try_get("status")?,
            batch_size: row.try_get("batch_size")?,
            cooldown_secs: row.try_get("cooldown_secs")?,
            total_items: row.try_get("total_items")?,
            processed_items: row.try_get("processed_items")?,
            successful_items: row.try_get("successful_items")?,
            failed_items: row.try_get("failed_items")?,
            retried_items: row.try_get("retried_items")?,
            skipped_items: row.try_get("skipped_items")?,
            current_batch: row.try_get("current_batch")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            updated_at: row.try_get("updated_at")?,
            last_error: row.try_get("last_error")?,
            recent_errors,
        })
    }
}

impl TryFrom<BatchRunRow> for BatchRun {
    type Error = StoreError;

    fn try_from(row: BatchRunRow) -> Result<Self, Self::Error> {
        let status: RunStatus = row
            .status
            .parse()
            .map_err(|err: cip_core::UnknownVariant| StoreError::Decode(err.to_string()))?;
        Ok(BatchRun {
            id: row.id,
            status,
            batch_size: row.batch_size,
            cooldown_secs: row.cooldown_secs,
            total_items: row.total_items,
            processed_items: row.processed_items,
            successful_items: row.successful_items,
            failed_items: row.failed_items,
            retried_items: row.retried_items,
            skipped_items: row.skipped_items,
            current_batch: row.current_batch,
            started_at: row.started_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
            last_error: row.last_error,
            recent_errors: row.recent_errors,
        })
    }
}

#[async_trait]
impl ImportQueue for PgStore {
    async fn enqueue(&self, items: &[FoundItem]) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;
        for item in items {
            let result = sqlx::query(
                r#"
                INSERT INTO import_queue
                    (id, external_id, aggregate_id, candidate_id, title, artist, year, formats)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (external_id) WHERE status <> 'skipped' DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&item.external_id)
            .bind(&item.aggregate_id)
            .bind(item.candidate_id)
            .bind(&item.title)
            .bind(&item.artist)
            .bind(item.year)
            .bind(&item.formats)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        debug!(offered = items.len(), inserted, "enqueued found items");
        Ok(inserted)
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<QueueItem>, StoreError> {
        let sql = format!(
            r#"
            WITH next AS (
                SELECT id
                  FROM import_queue
                 WHERE status = 'pending'
                 ORDER BY created_at, id
                 LIMIT $1
                 FOR UPDATE SKIP LOCKED
            )
            UPDATE import_queue q
               SET status = 'processing',
                   claimed_at = NOW(),
                   updated_at = NOW()
              FROM next
             WHERE q.id = next.id
            RETURNING {}
            "#,
            ITEM_COLUMNS
                .split(", ")
                .map(|c| format!("q.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut items = rows.iter().map(item_from_row).collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not preserve the CTE ordering.
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(items)
    }

    async fn mark_terminal(
        &self,
        id: Uuid,
        status: TerminalStatus,
        error: Option<&str>,
        artifact_refs: &[String],
    ) -> Result<(), StoreError> {
        let target = QueueStatus::from(status);
        let result = sqlx::query(
            r#"
            UPDATE import_queue
               SET status = $2,
                   error_message = $3,
                   artifact_refs = CASE WHEN cardinality($4::text[]) > 0
                                        THEN $4::text[] ELSE artifact_refs END,
                   processed_at = NOW(),
                   updated_at = NOW()
             WHERE id = $1
               AND status = ANY($5)
            "#,
        )
        .bind(id)
        .bind(target.as_str())
        .bind(error)
        .bind(artifact_refs)
        .bind(status_strings(&allowed_sources(target)))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.describe_rejection(id, target).await);
        }
        Ok(())
    }

    async fn increment_retry(&self, id: Uuid, error: &str) -> Result<i32, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE import_queue
               SET status = 'pending',
                   retry_count = retry_count + 1,
                   error_message = $2,
                   claimed_at = NULL,
                   updated_at = NOW()
             WHERE id = $1
               AND status = 'processing'
            RETURNING retry_count
            "#,
        )
        .bind(id)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.try_get("retry_count")?),
            None => Err(self.describe_rejection(id, QueueStatus::Pending).await),
        }
    }

    async fn known_external_ids(&self, ids: &[String]) -> Result<HashSet<String>, StoreError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let rows = sqlx::query(
            "SELECT DISTINCT external_id FROM import_queue WHERE external_id = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("external_id").map_err(StoreError::from))
            .collect()
    }

    async fn pending_count(&self) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM import_queue WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn recover_stale(
        &self,
        claimed_before: DateTime<Utc>,
        max_retries: i32,
    ) -> Result<RecoveryReport, StoreError> {
        let rows = sqlx::query(
            r#"
            UPDATE import_queue
               SET status = CASE WHEN retry_count < $2 THEN 'pending' ELSE 'failed' END,
                   retry_count = CASE WHEN retry_count < $2 THEN retry_count + 1
                                      ELSE retry_count END,
                   processed_at = CASE WHEN retry_count < $2 THEN processed_at ELSE NOW() END,
                   claimed_at = NULL,
                   error_message = $3,
                   updated_at = NOW()
             WHERE status = 'processing'
               AND claimed_at < $1
            RETURNING status
            "#,
        )
        .bind(claimed_before)
        .bind(max_retries)
        .bind(STALE_CLAIM_MESSAGE)
        .fetch_all(&self.pool)
        .await?;

        let mut report = RecoveryReport::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            match parse_status(&status)? {
                QueueStatus::Pending => report.requeued += 1,
                _ => report.failed += 1,
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl QueueMonitor for PgStore {
    async fn status_counts(&self) -> Result<QueueCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM import_queue GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = QueueCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            counts.add(parse_status(&status)?, n.max(0) as u64);
        }
        Ok(counts)
    }

    async fn list_items(
        &self,
        status: Option<QueueStatus>,
        limit: usize,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let sql = format!(
            r#"
            SELECT {ITEM_COLUMNS}
              FROM import_queue
             WHERE ($1::text IS NULL OR status = $1)
             ORDER BY created_at DESC
             LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(status.map(QueueStatus::as_str))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn recent_failures(&self, limit: usize) -> Result<Vec<QueueItem>, StoreError> {
        let sql = format!(
            r#"
            SELECT {ITEM_COLUMNS}
              FROM import_queue
             WHERE status = 'failed'
             ORDER BY processed_at DESC NULLS LAST
             LIMIT $1
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(item_from_row).collect()
    }
}

#[async_trait]
impl CandidateStore for PgStore {
    async fn select_candidates(&self, limit: usize) -> Result<Vec<CrawlCandidate>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, last_crawled_at, is_active, items_found_count
              FROM crawl_candidates
             WHERE is_active
             ORDER BY last_crawled_at ASC NULLS FIRST, name
             LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(candidate_from_row).collect()
    }

    async fn record_crawl_attempt(
        &self,
        id: Uuid,
        found: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE crawl_candidates
               SET last_crawled_at = $2,
                   items_found_count = items_found_count + $3
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .bind(found)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl CanonicalStore for PgStore {
    async fn existing_external_ids(&self, ids: &[String]) -> Result<HashSet<String>, StoreError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let rows = sqlx::query("SELECT external_id FROM published_items WHERE external_id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("external_id").map_err(StoreError::from))
            .collect()
    }
}

#[async_trait]
impl RunStore for PgStore {
    async fn begin_run(&self, run: &BatchRun) -> Result<(), StoreError> {
        let result = sqlx::query(INSERT_RUN)
            .bind(run.id)
            .bind(run.status.as_str())
            .bind(run.batch_size)
            .bind(run.cooldown_secs)
            .bind(run.total_items)
            .bind(run.processed_items)
            .bind(run.successful_items)
            .bind(run.failed_items)
            .bind(run.retried_items)
            .bind(run.skipped_items)
            .bind(run.current_batch)
            .bind(run.started_at)
            .bind(run.completed_at)
            .bind(run.updated_at)
            .bind(&run.last_error)
            .bind(Json(&run.recent_errors))
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::RunAlreadyActive)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn save_run(&self, run: &BatchRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE batch_runs
               SET status = $2,
                   total_items = $3,
                   processed_items = $4,
                   successful_items = $5,
                   failed_items = $6,
                   retried_items = $7,
                   skipped_items = $8,
                   current_batch = $9,
                   completed_at = $10,
                   updated_at = $11,
                   last_error = $12,
                   recent_errors = $13
             WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(run.total_items)
        .bind(run.processed_items)
        .bind(run.successful_items)
        .bind(run.failed_items)
        .bind(run.retried_items)
        .bind(run.skipped_items)
        .bind(run.current_batch)
        .bind(run.completed_at)
        .bind(run.updated_at)
        .bind(&run.last_error)
        .bind(Json(&run.recent_errors))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_run(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE batch_runs SET updated_at = $2 WHERE id = $1 AND status = 'running'")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn latest_run(&self) -> Result<Option<BatchRun>, StoreError> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM batch_runs ORDER BY started_at DESC NULLS LAST LIMIT 1"
        );
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.map(|row| BatchRunRow::from_row(&row).and_then(BatchRun::try_from))
            .transpose()
    }

    async fn abandon_stale_runs(&self, updated_before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE batch_runs
               SET status = 'failed',
                   completed_at = NOW(),
                   updated_at = NOW(),
                   last_error = 'run stopped reporting progress'
             WHERE status = 'running'
               AND updated_at < $1
            "#,
        )
        .bind(updated_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
