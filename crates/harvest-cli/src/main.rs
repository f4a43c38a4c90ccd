use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use harvest_adapters::SourceRegistry;
use harvest_sync::{maybe_build_scheduler, CrawlService, SyncConfig};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "harvest-cli")]
#[command(about = "Event harvester command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one crawl now. Without --source every enabled source is crawled.
    Crawl {
        #[arg(long = "source", value_name = "NAME")]
        sources: Vec<String>,
    },
    /// Run the cron buckets until Ctrl-C.
    Schedule,
    /// Serve the HTTP surface.
    Serve,
    /// List configured sources.
    Sources,
}

fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("harvest=info,warn"));
    let json = std::env::var("HARVEST_LOG_JSON").is_ok_and(|v| v == "1");
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Crawl { sources: Vec::new() }) {
        Commands::Crawl { sources } => {
            let summary = harvest_sync::run_crawl_once_from_env(Some(sources)).await?;
            println!(
                "crawl complete: job_id={} sources={} found={} rejected={} duplicates={} saved={}",
                summary.job_id,
                summary.sources.len(),
                summary.events_found,
                summary.rejected,
                summary.duplicates,
                summary.events_saved
            );
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..SyncConfig::from_env()
            };
            let service = Arc::new(CrawlService::from_config(&config)?);
            let Some(mut sched) = maybe_build_scheduler(service, &config).await? else {
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            harvest_web::serve_from_env().await?;
        }
        Commands::Sources => {
            let config = SyncConfig::from_env();
            let registry = SourceRegistry::load(&config.sources_file)?;
            for source in &registry.sources {
                println!(
                    "{}\t{}\t{}\t{} page(s)\t{}",
                    source.name,
                    source.schedule,
                    if source.enabled { "enabled" } else { "disabled" },
                    source.event_urls.len(),
                    source.base_url
                );
            }
        }
    }

    Ok(())
}
