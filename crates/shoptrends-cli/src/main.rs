use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shoptrends_core::{IdentityKey, SOURCE_SHOPEE_AFFILIATE};
use shoptrends_sync::{build_scheduler, pipeline_from_env, SyncConfig};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "shoptrends-cli")]
#[command(about = "Shop Trends affiliate catalog sync")]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync over every configured category
    Sync,
    /// Run a sync on every SYNC_CRON tick until Ctrl-C
    Schedule,
    /// Serve the read-only catalog view
    Serve,
    /// Attach a curated link to a catalog item
    Curate {
        #[arg(long)]
        source_id: String,
        #[arg(long)]
        url: String,
        #[arg(long, default_value = SOURCE_SHOPEE_AFFILIATE)]
        source: String,
    },
    /// Print catalog totals per category
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = pipeline_from_env()?.run_once().await?;
            println!(
                "sync complete: run_id={} categories={} skipped={} inserted={} updated={} total={}",
                summary.run_id,
                summary.categories,
                summary.skipped_categories,
                summary.inserted,
                summary.updated,
                summary.total_items
            );
        }
        Commands::Schedule => {
            let pipeline = Arc::new(pipeline_from_env()?);
            if !pipeline.config().scheduler_enabled {
                anyhow::bail!("scheduler disabled; set SHOPTRENDS_SCHEDULER_ENABLED=true");
            }
            let cron = pipeline.config().sync_cron.clone();
            let mut sched = build_scheduler(pipeline).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Serve => {
            shoptrends_web::serve_from_env().await?;
        }
        Commands::Curate { source_id, url, source } => {
            let config = SyncConfig::from_env()?;
            let store = config.catalog_store();
            let mut catalog = store.load().await?;
            let key = IdentityKey::new(source, source_id);
            if !store.curate(&mut catalog, &key, &url)? {
                anyhow::bail!("no catalog item {key} in {}", store.path().display());
            }
            store.save(&mut catalog).await?;
            println!("curated {key}");
        }
        Commands::Show => {
            let config = SyncConfig::from_env()?;
            let catalog = config.catalog_store().load().await?;
            let updated_at = if catalog.updated_at().is_empty() {
                "never"
            } else {
                catalog.updated_at()
            };
            println!("updated_at={} items={}", updated_at, catalog.len());
            for (slug, count) in catalog.category_counts() {
                println!("  {slug}: {count}");
            }
        }
    }

    Ok(())
}
