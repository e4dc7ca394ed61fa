use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use jobscrape_storage::{ListingStore, MemoryListingStore, PgListingStore};
use jobscrape_sync::{SyncConfig, SyncPipeline, SyncRunSummary};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "jobscrape-cli")]
#[command(about = "Scrape configured career pages into the job listings database")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl every configured source once and reconcile its listings.
    Scrape {
        /// Reconcile against an in-memory store instead of Postgres.
        #[arg(long)]
        dry_run: bool,
        /// Source registry (JSON or YAML); overrides JOBSCRAPE_SOURCES.
        #[arg(long)]
        sources: Option<PathBuf>,
    },
    /// Apply database migrations.
    Migrate,
    /// Delete listings older than the retention window.
    Clean {
        #[arg(long)]
        days: Option<i64>,
    },
    /// Resolve the state of listings whose location is more specific than the country.
    Locate,
    /// Run scheduled scrapes until Ctrl-C.
    Schedule,
}

async fn postgres(config: &SyncConfig) -> Result<Arc<dyn ListingStore>> {
    let store = PgListingStore::connect(&config.database_url).await?;
    store.migrate().await?;
    Ok(Arc::new(store))
}

fn print_summary(summary: &SyncRunSummary) {
    println!(
        "scrape complete: run_id={} sources={} skipped={} scopes_ok={} scopes_failed={} listings={} new={} pruned={} reports={}",
        summary.run_id,
        summary.sources,
        summary.sources_skipped,
        summary.scopes_ok,
        summary.scopes_failed,
        summary.records,
        summary.created,
        summary.pruned,
        summary.reports_dir
    );
    println!("elapsed: {:.2}s", summary.elapsed_secs);
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    let command = cli.command.unwrap_or(Commands::Scrape {
        dry_run: false,
        sources: None,
    });
    match command {
        Commands::Scrape { dry_run, sources } => {
            if let Some(path) = sources {
                config.sources_path = path;
            }
            let store: Arc<dyn ListingStore> = if dry_run {
                info!("dry run: listings are kept in memory only");
                Arc::new(MemoryListingStore::new())
            } else {
                postgres(&config).await?
            };
            let summary = SyncPipeline::new(config, Arc::clone(&store)).run_once().await?;
            print_summary(&summary);
            if dry_run {
                println!("listings held in memory: {}", store.count_listings(None).await?);
            }
        }
        Commands::Migrate => {
            let store = PgListingStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Clean { days } => {
            let days = days.unwrap_or(config.retention_days);
            let store = postgres(&config).await?;
            let removed = SyncPipeline::new(config, store).clean_expired(days).await?;
            println!("removed {removed} listing(s) older than {days} day(s)");
        }
        Commands::Locate => {
            let store = postgres(&config).await?;
            let pipeline = SyncPipeline::new(config, store);
            let geocoder = pipeline.build_geocoder()?;
            let summary = pipeline.resolve_states(&geocoder).await?;
            println!(
                "states added: {} ({} resolved, {} defaulted, {} failed)",
                summary.updated(),
                summary.resolved,
                summary.defaulted,
                summary.failed
            );
        }
        Commands::Schedule => {
            let store = postgres(&config).await?;
            let pipeline = Arc::new(SyncPipeline::new(config, store));
            jobscrape_sync::run_scheduler_until_ctrl_c(pipeline).await?;
        }
    }

    Ok(())
}
