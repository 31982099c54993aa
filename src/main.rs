use anyhow::Result;
use attendance_sync::config;
use attendance_sync::db;
use attendance_sync::identity::HttpIdentityClient;
use attendance_sync::photo::FsPhotoStore;
use attendance_sync::validation::IdentityValidator;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run the identity validation worker for persisted attendance events"
)]
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

    let photos = Arc::new(FsPhotoStore::new(cfg.photo_root()));
    let identity = Arc::new(HttpIdentityClient::from_config(&cfg)?);
    let validator = IdentityValidator::from_config(&cfg, pool.clone(), photos, identity);
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);

    // Single worker: tasks are validated one at a time.
    let worker = tokio::spawn(async move {
        loop {
            match validator.process_next_task().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(poll_sleep).await,
                Err(err) => {
                    error!(?err, "validation worker error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    info!(
        pending = db::count_validation_tasks(&pool).await?,
        "validation worker running"
    );
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    worker.abort();
    pool.close().await;
    Ok(())
}
