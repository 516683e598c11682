//! Crawl, deduplicate, enqueue and batch-process catalog imports.

pub mod config;
pub mod crawler;
pub mod dedup;
pub mod orchestrator;
pub mod pipeline;
pub mod scheduler;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::{Context, Result};
use cip_catalog::{CatalogApi, FormatFilter, HttpCatalogClient};
use cip_storage::{
    CandidateStore, CanonicalStore, ImportQueue, MemoryStore, PgStore, QueueMonitor, RunStore,
};
use tracing::info;

pub use config::{BatchSettings, ImportConfig};
pub use crawler::{CrawlReport, CrawlSettings, Crawler};
pub use dedup::DeduplicationGate;
pub use orchestrator::{BatchOrchestrator, OrchestratorError, RecoverySummary};
pub use pipeline::{
    ContentGenerator, GeneratedArtifact, GenerationError, HttpContentGenerator, ItemMetadata,
    ItemPipeline,
};
pub use scheduler::maybe_build_scheduler;

pub const CRATE_NAME: &str = "cip-sync";

/// Everything the binary and the web surface drive, wired against one store.
#[derive(Clone)]
pub struct ImportServices {
    pub crawler: Arc<Crawler>,
    pub orchestrator: BatchOrchestrator,
    pub monitor: Arc<dyn QueueMonitor>,
    pub settings: BatchSettings,
}

impl ImportServices {
    pub fn new<S>(
        config: &ImportConfig,
        store: Arc<S>,
        catalog: Arc<dyn CatalogApi>,
        generator: Arc<dyn ContentGenerator>,
        formats: FormatFilter,
    ) -> Self
    where
        S: ImportQueue + QueueMonitor + CandidateStore + CanonicalStore + RunStore + 'static,
    {
        let queue: Arc<dyn ImportQueue> = store.clone();
        let gate = DeduplicationGate::new(store.clone(), queue.clone());
        let crawler = Crawler::new(
            catalog.clone(),
            store.clone(),
            queue.clone(),
            gate,
            formats,
            CrawlSettings {
                candidate_limit: config.candidate_limit,
                ..CrawlSettings::default()
            },
        );
        let pipeline = ItemPipeline::new(catalog, generator, queue.clone());
        let orchestrator =
            BatchOrchestrator::new(queue, store.clone(), Arc::new(pipeline), config.stale_after());

        Self {
            crawler: Arc::new(crawler),
            orchestrator,
            monitor: store,
            settings: config.batch_settings(),
        }
    }

    /// Production wiring: Postgres store, HTTP catalog client and HTTP generator.
    pub async fn connect(config: &ImportConfig) -> Result<(Arc<PgStore>, Self)> {
        let store = Arc::new(
            PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?,
        );
        let catalog = HttpCatalogClient::new(config.catalog_client_config())?;
        let generator = HttpContentGenerator::new(
            config.generator_url.clone(),
            config.http_timeout(),
            &config.user_agent,
        )?;
        let formats = FormatFilter::from_yaml_file(&config.format_rules)?;
        info!(
            include = formats.include.len(),
            exclude = formats.exclude.len(),
            "format rules loaded"
        );

        let services = Self::new(
            config,
            store.clone(),
            Arc::new(catalog),
            Arc::new(generator),
            formats,
        );
        Ok((store, services))
    }

    /// Wiring over [`MemoryStore`] with an accept-all format filter.
    pub fn in_memory(
        config: &ImportConfig,
        catalog: Arc<dyn CatalogApi>,
        generator: Arc<dyn ContentGenerator>,
    ) -> (Arc<MemoryStore>, Self) {
        let store = Arc::new(MemoryStore::new());
        let services = Self::new(config, store.clone(), catalog, generator, FormatFilter::default());
        (store, services)
    }
}
