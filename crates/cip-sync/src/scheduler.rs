use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::orchestrator::OrchestratorError;
use crate::{ImportConfig, ImportServices};

/// Builds (without starting) the crawl and batch cron jobs, if enabled.
pub async fn maybe_build_scheduler(
    config: &ImportConfig,
    services: &ImportServices,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let crawler = services.crawler.clone();
    let crawl_job = Job::new_async(config.crawl_cron.as_str(), move |_uuid, _l| {
        let crawler = crawler.clone();
        Box::pin(async move {
            match crawler.run_cycle(&CancellationToken::new()).await {
                Ok(report) => info!(enqueued = report.enqueued, "scheduled crawl finished"),
                Err(err) => error!(error = %err, "scheduled crawl failed"),
            }
        })
    })
    .with_context(|| format!("creating crawl job for cron {}", config.crawl_cron))?;
    sched.add(crawl_job).await.context("adding crawl job")?;

    let orchestrator = services.orchestrator.clone();
    let settings = services.settings;
    let batch_job = Job::new_async(config.batch_cron.as_str(), move |_uuid, _l| {
        let orchestrator = orchestrator.clone();
        Box::pin(async move {
            match orchestrator.start(settings).await {
                Ok(run) => info!(run_id = %run.id, "scheduled batch run started"),
                Err(OrchestratorError::AlreadyRunning) => {
                    warn!("scheduled batch run skipped; a run is already active")
                }
                Err(err) => error!(error = %err, "scheduled batch run failed to start"),
            }
        })
    })
    .with_context(|| format!("creating batch job for cron {}", config.batch_cron))?;
    sched.add(batch_job).await.context("adding batch job")?;

    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::test_support::{FakeGenerator, ScriptedCatalog};

    fn config(pairs: &[(&str, &str)]) -> ImportConfig {
        let vars = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        ImportConfig::from_lookup(|key| vars.get(key).cloned())
    }

    fn services(config: &ImportConfig) -> ImportServices {
        ImportServices::in_memory(
            config,
            std::sync::Arc::new(ScriptedCatalog::default()),
            std::sync::Arc::new(FakeGenerator::default()),
        )
        .1
    }

    #[tokio::test]
    async fn disabled_scheduler_builds_nothing() {
        let config = config(&[]);
        let sched = maybe_build_scheduler(&config, &services(&config)).await.unwrap();
        assert!(sched.is_none());
    }

    #[tokio::test]
    async fn enabled_scheduler_registers_both_jobs() {
        let config = config(&[("CIP_SCHEDULER_ENABLED", "1")]);
        let sched = maybe_build_scheduler(&config, &services(&config)).await.unwrap();
        assert!(sched.is_some());
    }

    #[tokio::test]
    async fn bad_cron_is_reported() {
        let config = config(&[("CIP_SCHEDULER_ENABLED", "1"), ("CIP_BATCH_CRON", "whenever")]);
        let err = maybe_build_scheduler(&config, &services(&config)).await.err().expect("expected scheduler build to fail");
        assert!(err.to_string().contains("whenever"));
    }
}
