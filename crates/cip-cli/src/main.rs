use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cip_core::RunStatus;
use cip_sync::{maybe_build_scheduler, BatchSettings, ImportConfig, ImportServices};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "cip")]
#[command(about = "Catalog import pipeline: crawl, queue and batch-process catalog items")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply pending database migrations.
    Migrate,
    /// Run one crawl cycle over the least recently crawled candidates.
    Crawl,
    /// Process the queue in batches until it drains or ctrl-c is pressed.
    Run(RunArgs),
    /// Print the latest run and per-status queue counts.
    Status,
    /// Requeue or fail items left in processing and close abandoned runs.
    Recover,
    /// Serve the run monitor, with the cron scheduler when enabled.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Manage crawl candidates.
    Candidates {
        #[command(subcommand)]
        command: CandidateCommands,
    },
}

#[derive(Debug, Subcommand)]
enum CandidateCommands {
    /// Add candidates by name, reactivating any that already exist.
    Add { names: Vec<String> },
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    cooldown_secs: Option<u64>,
    #[arg(long)]
    max_retries: Option<i32>,
}

impl RunArgs {
    fn settings(&self, defaults: BatchSettings) -> BatchSettings {
        BatchSettings {
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            cooldown: self
                .cooldown_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.cooldown),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cip_sync=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Cancels the returned token on the first ctrl-c.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let signalled = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current batch");
            signalled.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = ImportConfig::from_env();

    let (store, services) = ImportServices::connect(&config).await?;

    match cli.command {
        Commands::Migrate => {
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Crawl => {
            let report = services.crawler.run_cycle(&cancel_on_ctrl_c()).await?;
            print_json(&report)?;
        }
        Commands::Run(args) => {
            let settings = args.settings(services.settings);
            let run = services
                .orchestrator
                .run(settings, cancel_on_ctrl_c())
                .await?;
            print_json(&run)?;
            if run.status == RunStatus::Failed {
                anyhow::bail!(
                    "batch run failed: {}",
                    run.last_error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Commands::Status => {
            let run = services.orchestrator.status().await?;
            let counts = services.monitor.status_counts().await?;
            print_json(&json!({
                "run": run,
                "queue": { "total": counts.total(), "counts": counts },
            }))?;
        }
        Commands::Recover => {
            let summary = services.orchestrator.recover(config.max_retries).await?;
            print_json(&summary)?;
        }
        Commands::Serve { port } => {
            let scheduler = maybe_build_scheduler(&config, &services).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(
                    crawl = %config.crawl_cron,
                    batch = %config.batch_cron,
                    "scheduler started"
                );
            }
            cip_web::serve(services, port.unwrap_or(config.web_port)).await?;
        }
        Commands::Candidates {
            command: CandidateCommands::Add { names },
        } => {
            if names.is_empty() {
                anyhow::bail!("no candidate names given");
            }
            for name in names {
                let candidate = store.upsert_candidate(&name).await?;
                println!("{}\t{}", candidate.id, candidate.name);
            }
        }
    }

    Ok(())
}
