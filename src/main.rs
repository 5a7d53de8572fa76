use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use stac_ingestor::api::{self, AppState};
use stac_ingestor::catalog::{CatalogStore, SqliteCatalog};
use stac_ingestor::config;
use stac_ingestor::db;
use stac_ingestor::probe::{AssetProbe, HttpAssetProbe};
use stac_ingestor::queue::{BatchPolicy, BatchQueue};
use stac_ingestor::workflow::{AirflowClient, WorkflowDispatcher};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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

    let catalog: Arc<dyn CatalogStore> = Arc::new(SqliteCatalog::new(pool.clone()));
    let probe: Arc<dyn AssetProbe> = Arc::new(HttpAssetProbe::new(
        Duration::from_millis(cfg.validation.asset_timeout_ms),
        cfg.validation.raster_url.as_deref(),
    )?);
    let dispatcher = AirflowClient::from_config(&cfg.workflows)?
        .map(|c| Arc::new(c) as Arc<dyn WorkflowDispatcher>);
    if dispatcher.is_none() {
        info!("no workflow orchestrator configured; workflow endpoints will refuse runs");
    }

    // Batch worker runs beside the API and is dropped with the runtime.
    let queue = BatchQueue::new(pool.clone(), Arc::clone(&catalog), BatchPolicy::from_config(&cfg.batch));
    queue.recover().await?;
    let queue_handle = queue.handle();
    let worker = tokio::spawn(queue.run());

    let addr = cfg.listen_addr()?;
    let state = AppState::new(pool, cfg, catalog, probe, dispatcher, queue_handle);
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "starting STAC ingestor");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(?err, "failed to listen for shutdown signal");
            }
            info!("shutting down");
        })
        .await;
    worker.abort();
    served?;
    Ok(())
}
