//! Per-item import: fetch detail, hand off to the content generator, record the outcome.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cip_catalog::{
    classify_reqwest_error, classify_status, CatalogApi, CatalogError, RawDetail,
    RetryDisposition,
};
use cip_core::{ItemOutcome, QueueItem, TerminalStatus};
use cip_storage::{ImportQueue, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

/// Metadata handed to the content generator for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemMetadata {
    pub external_id: String,
    pub aggregate_id: Option<String>,
    pub title: String,
    pub artists: Vec<String>,
    pub year: Option<i32>,
    pub formats: Vec<String>,
    pub genres: Vec<String>,
    pub styles: Vec<String>,
    pub tracklist: Vec<String>,
    pub notes: Option<String>,
}

impl ItemMetadata {
    pub fn from_detail(item: &QueueItem, detail: RawDetail) -> Self {
        let artists = match detail.artist_names() {
            names if names.is_empty() => item.artist.iter().cloned().collect(),
            names => names,
        };
        let formats = match detail.format_tokens() {
            tokens if tokens.is_empty() => item.formats.clone(),
            tokens => tokens,
        };
        Self {
            external_id: item.external_id.clone(),
            aggregate_id: item.aggregate_id.clone(),
            artists,
            year: detail.year.or(item.year),
            formats,
            genres: detail.genres,
            styles: detail.styles,
            tracklist: detail
                .tracklist
                .into_iter()
                .map(|t| match t.position.trim() {
                    "" => t.title,
                    position => format!("{position}. {}", t.title),
                })
                .collect(),
            notes: detail.notes,
            title: detail.title,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedArtifact {
    pub artifact_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct GenerationError {
    pub message: String,
    pub retryable: bool,
}

#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, metadata: &ItemMetadata) -> Result<GeneratedArtifact, GenerationError>;
}

/// POSTs item metadata as JSON and reads back `{"artifactId": ...}`.
#[derive(Debug, Clone)]
pub struct HttpContentGenerator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpContentGenerator {
    pub fn new(endpoint: impl Into<String>, timeout: Duration, user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent.to_string())
            .build()
            .context("building generator http client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl ContentGenerator for HttpContentGenerator {
    async fn generate(&self, metadata: &ItemMetadata) -> Result<GeneratedArtifact, GenerationError> {
        let transport = |err: reqwest::Error| GenerationError {
            retryable: classify_reqwest_error(&err) == RetryDisposition::Retryable,
            message: format!("generator request failed: {err}"),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(metadata)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(GenerationError {
                message: format!("generator returned http {}", status.as_u16()),
                retryable: classify_status(status) == RetryDisposition::Retryable,
            });
        }

        let body = response.bytes().await.map_err(transport)?;
        let artifact: GeneratedArtifact =
            serde_json::from_slice(&body).map_err(|e| GenerationError {
                message: format!("malformed generator response: {e}"),
                retryable: false,
            })?;
        if artifact.artifact_id.trim().is_empty() {
            return Err(GenerationError {
                message: "generator returned an empty artifact id".to_string(),
                retryable: false,
            });
        }
        Ok(artifact)
    }
}

enum Failure {
    NotFound(String),
    Permanent(String),
    Transient(String),
}

impl From<CatalogError> for Failure {
    fn from(err: CatalogError) -> Self {
        let message = err.to_string();
        if err.is_not_found() {
            Failure::NotFound(message)
        } else if err.is_retryable() {
            Failure::Transient(message)
        } else {
            Failure::Permanent(message)
        }
    }
}

impl From<GenerationError> for Failure {
    fn from(err: GenerationError) -> Self {
        if err.retryable {
            Failure::Transient(err.message)
        } else {
            Failure::Permanent(err.message)
        }
    }
}

pub struct ItemPipeline {
    catalog: Arc<dyn CatalogApi>,
    generator: Arc<dyn ContentGenerator>,
    queue: Arc<dyn ImportQueue>,
}

impl ItemPipeline {
    pub fn new(
        catalog: Arc<dyn CatalogApi>,
        generator: Arc<dyn ContentGenerator>,
        queue: Arc<dyn ImportQueue>,
    ) -> Self {
        Self {
            catalog,
            generator,
            queue,
        }
    }

    /// Runs one claimed item to its next state. Only queue write failures
    /// surface as errors; every catalog or generator failure becomes an outcome.
    pub async fn process(
        &self,
        item: QueueItem,
        max_retries: i32,
    ) -> Result<ItemOutcome, StoreError> {
        let span = info_span!(
            "process_item",
            item_id = %item.id,
            external_id = %item.external_id,
            retry_count = item.retry_count
        );
        async {
            let attempt = self.attempt(&item).await;
            self.record(&item, attempt, max_retries).await
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, item: &QueueItem) -> Result<GeneratedArtifact, Failure> {
        let detail = self.catalog.fetch_detail(&item.external_id).await?;
        let metadata = ItemMetadata::from_detail(item, detail);
        let artifact = self.generator.generate(&metadata).await?;
        Ok(artifact)
    }

    async fn record(
        &self,
        item: &QueueItem,
        attempt: Result<GeneratedArtifact, Failure>,
        max_retries: i32,
    ) -> Result<ItemOutcome, StoreError> {
        match attempt {
            Ok(artifact) => {
                let refs = vec![artifact.artifact_id];
                self.queue
                    .mark_terminal(item.id, TerminalStatus::Completed, None, &refs)
                    .await?;
                debug!(artifact_refs = ?refs, "item completed");
                Ok(ItemOutcome::Completed { artifact_refs: refs })
            }
            Err(Failure::NotFound(reason)) => {
                self.queue
                    .mark_terminal(item.id, TerminalStatus::Skipped, Some(&reason), &[])
                    .await?;
                debug!(%reason, "item skipped");
                Ok(ItemOutcome::Skipped { reason })
            }
            Err(Failure::Permanent(error)) => self.fail(item, error).await,
            Err(Failure::Transient(error)) if item.retry_count < max_retries => {
                let retry_count = self.queue.increment_retry(item.id, &error).await?;
                warn!(retry_count, %error, "item will be retried");
                Ok(ItemOutcome::Retried { retry_count, error })
            }
            Err(Failure::Transient(error)) => {
                let error = format!("retry limit {max_retries} reached: {error}");
                self.fail(item, error).await
            }
        }
    }

    async fn fail(&self, item: &QueueItem, error: String) -> Result<ItemOutcome, StoreError> {
        self.queue
            .mark_terminal(item.id, TerminalStatus::Failed, Some(&error), &[])
            .await?;
        warn!(%error, "item failed");
        Ok(ItemOutcome::Failed { error })
    }
}
