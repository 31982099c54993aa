use anyhow::{anyhow, Result};
use attendance_sync::config;
use attendance_sync::db;
use attendance_sync::model::parse_timestamp;
use attendance_sync::review::{self, SupervisorId};
use chrono::{DateTime, Utc};
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Force a full identity match on an attendance event (supervisor only)"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Attendance event id (logId)
    #[arg(long)]
    event: i64,

    /// Authenticated supervisor applying the override
    #[arg(long)]
    supervisor: String,

    /// Corrected capture time, RFC 3339
    #[arg(long, value_parser = parse_corrected)]
    timestamp: Option<DateTime<Utc>>,
}

fn parse_corrected(s: &str) -> Result<DateTime<Utc>, String> {
    parse_timestamp(s).ok_or_else(|| format!("not an RFC 3339 timestamp: '{}'", s))
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

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let supervisor = SupervisorId::new(args.supervisor)?;
    let event = review::override_validation(&pool, args.event, &supervisor, args.timestamp)
        .await
        .map_err(|err| anyhow!("override failed: {:#}", err))?;

    println!("{}", serde_json::to_string_pretty(&event.to_record())?);
    Ok(())
}
