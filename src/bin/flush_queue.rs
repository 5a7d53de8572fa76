use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use stac_ingestor::catalog::SqliteCatalog;
use stac_ingestor::config;
use stac_ingestor::db;
use stac_ingestor::model::Status;
use stac_ingestor::queue::{BatchPolicy, BatchQueue};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Publish every queued submission now and exit when the queue is empty"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Keep going while batches are backing off instead of exiting with them pending
    #[arg(long)]
    wait_backoff: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let catalog = Arc::new(SqliteCatalog::new(pool.clone()));
    let queue = BatchQueue::new(pool.clone(), catalog, BatchPolicy::from_config(&cfg.batch));
    queue.recover().await?;

    let queued = db::count_by_status(&pool, Status::Queued).await?;
    info!(queued, "flushing batch queue");

    let mut published = 0;
    let mut failed = 0;
    loop {
        let report = queue.drain().await?;
        published += report.published;
        failed += report.failed;

        let pending = db::count_batches(&pool).await?;
        if pending == 0 {
            break;
        }
        if !args.wait_backoff {
            warn!(pending, "batches are backing off; rerun with --wait-backoff to wait for them");
            break;
        }
        info!(pending, "waiting for batches in backoff");
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    info!(published, failed, "flush complete");
    Ok(())
}
