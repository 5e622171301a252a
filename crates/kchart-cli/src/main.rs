use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use kchart_core::{current_hour, parse_kst_stamp};
use kchart_storage::{CatalogRepository, MemoryCatalogRepository};
use kchart_sync::{FetchOptions, PgCatalogRepository, SyncConfig, SyncPipeline};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "kchart-cli")]
#[command(about = "Korean realtime chart aggregator")]
struct Cli {
    /// Keep everything in memory instead of PostgreSQL.
    #[arg(long, global = true)]
    memory: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every enabled service and regenerate the current aggregate.
    Run,
    /// Fetch one service's live chart.
    Update {
        service: String,
        #[arg(long)]
        dry_run: bool,
        /// Re-fetch even when the hour is already populated.
        #[arg(long)]
        force: bool,
        /// Regenerate the current hour's aggregate afterwards.
        #[arg(long)]
        aggregate: bool,
    },
    /// Re-fetch hours that have no populated chart.
    Refresh {
        #[arg(required = true)]
        services: Vec<String>,
        #[arg(long, default_value_t = 24)]
        hours: u32,
        #[arg(long)]
        dry_run: bool,
    },
    /// Build the aggregate chart for an hour.
    Aggregate {
        /// `YYYYMMDDHH` in Korea Standard Time; defaults to the current hour.
        #[arg(long, value_parser = parse_hour)]
        hour: Option<DateTime<Utc>>,
        #[arg(long)]
        regenerate: bool,
    },
    /// Export an hour's aggregate chart to parquet.
    Export {
        #[arg(long, value_parser = parse_hour)]
        hour: DateTime<Utc>,
    },
    /// Apply database migrations.
    Migrate,
    /// Run the hourly scheduler until interrupted.
    Schedule,
}

fn parse_hour(value: &str) -> Result<DateTime<Utc>, String> {
    parse_kst_stamp(value).map_err(|e| format!("expected YYYYMMDDHH: {e}"))
}

fn init_tracing() {
    let filter = std::env::var("LOG_LEVEL")
        .ok()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

async fn open_repository(config: &SyncConfig, memory: bool) -> Result<Arc<dyn CatalogRepository>> {
    if memory {
        return Ok(Arc::new(MemoryCatalogRepository::new()));
    }
    let repo = PgCatalogRepository::connect(&config.database_url).await?;
    repo.migrate().await?;
    Ok(Arc::new(repo))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    let command = cli.command.unwrap_or(Commands::Run);
    if let Commands::Schedule = command {
        config.scheduler_enabled = true;
    }

    let repo = open_repository(&config, cli.memory).await?;
    let pipeline = Arc::new(SyncPipeline::new(config, repo)?);

    match command {
        Commands::Run => {
            let summary = pipeline.run_hour().await?;
            print_json(&summary)?;
        }
        Commands::Update {
            service,
            dry_run,
            force,
            aggregate,
        } => {
            let outcome = pipeline
                .fetch_hourly(
                    &service,
                    FetchOptions {
                        hour: None,
                        dry_run,
                        force_update: force,
                    },
                )
                .await?;
            print_json(&outcome)?;
            if aggregate && !dry_run {
                let chart = pipeline.generate_aggregate(current_hour(), true).await?;
                println!("aggregate {}: {} entries", chart.hour, chart.entries.len());
            }
        }
        Commands::Refresh {
            services,
            hours,
            dry_run,
        } => {
            for service in services {
                let outcomes = pipeline.refresh_incomplete(&service, hours, dry_run).await?;
                info!(service = %service, refreshed = outcomes.len(), "refresh finished");
                print_json(&outcomes)?;
            }
        }
        Commands::Aggregate { hour, regenerate } => {
            let chart = pipeline
                .generate_aggregate(hour.unwrap_or_else(current_hour), regenerate)
                .await?;
            print_json(&chart)?;
        }
        Commands::Export { hour } => {
            let manifest = pipeline.export_aggregate_parquet(hour).await?;
            println!("wrote {}", manifest.display());
        }
        Commands::Schedule => {
            let mut scheduler = pipeline
                .maybe_build_scheduler()
                .await?
                .context("scheduler disabled")?;
            scheduler.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            if cli.memory {
                warn!("in-memory repository has no schema to migrate");
            }
        }
    }

    Ok(())
}
