use anyhow::Result;
use attendance_sync::config;
use attendance_sync::db;
use attendance_sync::photo::FsPhotoStore;
use attendance_sync::submitter::AttendanceSubmitter;
use attendance_sync::sync_queue::{store, SyncQueue};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Replay every queued device submission and exit when the queue is empty"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Give up after this many cycles that ended on a failing item
    #[arg(long, default_value = "5")]
    max_cycles: u32,

    /// Print dead-lettered submissions and exit
    #[arg(long)]
    list_rejected: bool,

    /// Move the item blocking the head of the queue to sync_rejected, with this reason
    #[arg(long, value_name = "REASON")]
    dead_letter_head: Option<String>,
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

    let queue_pool = store::open(&cfg.device_queue_url()).await?;
    if args.list_rejected {
        for (key, reason) in store::rejected(&queue_pool).await? {
            println!("{}\t{}", key, reason);
        }
        return Ok(());
    }

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let photos = Arc::new(FsPhotoStore::new(cfg.photo_root()));
    let sink = Arc::new(AttendanceSubmitter::new(pool, photos, cfg.sequencer()));
    let queue = SyncQueue::new(queue_pool, sink, cfg.flush_interval());

    if let Some(reason) = &args.dead_letter_head {
        match queue.dead_letter_head(reason).await? {
            Some(key) => info!(key, "head item dead-lettered"),
            None => info!("queue is empty, nothing to dead-letter"),
        }
    }

    let pending = queue.pending().await?;
    info!(pending, "starting device queue drain");
    if pending == 0 {
        info!("nothing queued, exiting");
        return Ok(());
    }

    let mut failed_cycles = 0;
    loop {
        let report = queue.flush().await?;
        info!(
            persisted = report.persisted.len(),
            remaining = report.remaining,
            "cycle finished"
        );
        if report.remaining == 0 {
            break;
        }
        if report.blocked {
            warn!(
                stopped_at = ?report.stopped_at,
                failure = report.failure.as_deref().unwrap_or_default(),
                "head item is refused by the server; resolve it or rerun with --dead-letter-head"
            );
            break;
        }
        failed_cycles += 1;
        if failed_cycles >= args.max_cycles {
            warn!(
                remaining = report.remaining,
                stopped_at = ?report.stopped_at,
                "queue still blocked after {} cycles, exiting",
                failed_cycles
            );
            break;
        }
        tokio::time::sleep(Duration::from_secs(cfg.device.flush_interval_secs.max(1))).await;
    }

    info!("device queue drain completed");
    Ok(())
}
