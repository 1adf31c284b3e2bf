use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use rcd_core::Job;
use rcd_harvest::{
    generate_insights, HarvestConfig, HarvestOrchestrator, OpenAiInsightGenerator,
    StaticPageDriver,
};
use rcd_queue::{JobQueueManager, JobRunner};
use rcd_storage::RecordStore;
use rcd_web::AppState;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Headroom past the harvest's own budget before the worker aborts a job
/// outright. The orchestrator stops itself at `job_timeout` and merges
/// what it has; the hard abort only catches a run stuck inside a single
/// external call.
const JOB_ABORT_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "rcd-cli")]
#[command(about = "Roofing contractor directory harvester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one harvest pass and exit.
    Harvest,
    /// Enrich stored records with generated insights and exit.
    Insights,
    /// Serve the API with a background refresh worker.
    Serve {
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
}

/// Queue-driven refresh: one full harvest, then the insight pass when an
/// API key is configured. Insight failures are logged, not fatal; the
/// harvested records are already merged by then.
struct RefreshRunner {
    config: HarvestConfig,
}

#[async_trait]
impl JobRunner for RefreshRunner {
    async fn run(&self, _job: Job) -> Result<()> {
        let summary = run_harvest(&self.config).await?;
        info!(
            run_id = %summary.run_id,
            pages = summary.pages_visited,
            fetched = summary.items_fetched,
            skipped = summary.items_skipped,
            failed = summary.items_failed,
            total = summary.records_total,
            "refresh harvest complete"
        );

        if self.config.insight_api_key.is_some() {
            let generator = OpenAiInsightGenerator::new(&self.config)?;
            let store = RecordStore::new(self.config.records_path());
            if let Err(err) = generate_insights(&store, &generator).await {
                warn!(error = %err, "insight pass failed");
            }
        }
        Ok(())
    }
}

async fn run_harvest(config: &HarvestConfig) -> Result<rcd_harvest::HarvestRunSummary> {
    let listing = StaticPageDriver::new(config)?;
    let detail = StaticPageDriver::new(config)?;
    let orchestrator =
        HarvestOrchestrator::new(config.clone(), Box::new(listing), Box::new(detail));
    orchestrator.run().await.context("harvest run failed")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = HarvestConfig::from_env();

    match cli.command.unwrap_or(Commands::Harvest) {
        Commands::Harvest => {
            let summary = run_harvest(&config).await?;
            println!(
                "harvest complete: run_id={} pages={} fetched={} skipped={} failed={} total={}",
                summary.run_id,
                summary.pages_visited,
                summary.items_fetched,
                summary.items_skipped,
                summary.items_failed,
                summary.records_total
            );
        }
        Commands::Insights => {
            let generator = OpenAiInsightGenerator::new(&config)?;
            let store = RecordStore::new(config.records_path());
            let count = generate_insights(&store, &generator).await?;
            println!("insights complete: records={count}");
        }
        Commands::Serve { port } => {
            let queue = Arc::new(JobQueueManager::new(config.queue_max_depth));
            let runner = Arc::new(RefreshRunner {
                config: config.clone(),
            });
            rcd_queue::spawn_worker(
                queue.clone(),
                runner,
                config.job_timeout.saturating_add(JOB_ABORT_GRACE),
            );

            let store = RecordStore::new(config.records_path());
            rcd_web::serve(AppState::new(queue, store), port).await?;
        }
    }

    Ok(())
}
