use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use attendance_sync::capture::{CameraFailure, CaptureClient, CaptureContext, CaptureDevice};
use attendance_sync::config;
use attendance_sync::db;
use attendance_sync::geofence::LocationFailure;
use attendance_sync::identity::HttpIdentityClient;
use attendance_sync::model::{ClockAction, Coordinate};
use attendance_sync::photo::{FsPhotoStore, ImagePayload};
use attendance_sync::submitter::{self, AttendanceSubmitter};
use attendance_sync::sync_queue::{store, NetworkStatus, SyncQueue};
use attendance_sync::validation::IdentityValidator;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Register one clock action, queueing it on this device when offline"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Collaborator id
    #[arg(long)]
    user: String,

    /// clock_in, break_start, break_end or clock_out
    #[arg(long, value_parser = parse_action)]
    action: ClockAction,

    /// Captured photo (image file or a file holding a data URI)
    #[arg(long)]
    photo: PathBuf,

    #[arg(long, allow_hyphen_values = true, requires = "longitude")]
    latitude: Option<f64>,

    #[arg(long, allow_hyphen_values = true, requires = "latitude")]
    longitude: Option<f64>,

    /// Simulate a refused location permission
    #[arg(long, conflicts_with = "latitude")]
    location_denied: bool,

    /// Simulate being without connectivity
    #[arg(long)]
    offline: bool,
}

fn parse_action(s: &str) -> Result<ClockAction, String> {
    ClockAction::parse(s).ok_or_else(|| format!("unknown action '{}'", s))
}

/// Device backed by command-line inputs.
struct CliDevice {
    position: Result<Coordinate, LocationFailure>,
    photo: Option<ImagePayload>,
}

#[async_trait]
impl CaptureDevice for CliDevice {
    async fn locate(&self) -> Result<Coordinate, LocationFailure> {
        self.position
    }

    async fn take_photo(&self) -> Result<ImagePayload, CameraFailure> {
        self.photo.clone().ok_or(CameraFailure::Unavailable)
    }
}

async fn read_photo(path: &Path) -> Result<ImagePayload> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read photo: {}", path.display()))?;
    if bytes.starts_with(b"data:") {
        let text = String::from_utf8(bytes).context("data URI is not UTF-8")?;
        return ImagePayload::from_data_uri(&text);
    }
    let content_type = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => return Err(anyhow!("unsupported photo type: {}", path.display())),
    };
    Ok(ImagePayload::new(content_type, bytes))
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
    let queue_pool = store::open(&cfg.device_queue_url()).await?;

    let photos = Arc::new(FsPhotoStore::new(cfg.photo_root()));
    let mut attendance = AttendanceSubmitter::new(pool.clone(), photos.clone(), cfg.sequencer());
    if cfg.identity.inline {
        let identity = Arc::new(HttpIdentityClient::from_config(&cfg)?);
        attendance = attendance.with_inline_validation(IdentityValidator::from_config(
            &cfg,
            pool.clone(),
            photos,
            identity,
        ));
    }
    let sink = Arc::new(attendance);

    let network = NetworkStatus::new(!args.offline);
    let queue = SyncQueue::new(queue_pool, sink.clone(), cfg.flush_interval());
    // Leftovers from earlier sessions go first so the new action is sequenced after them.
    let sync = queue.start(&network);
    let drained = sync.flush_now().await?;
    if !drained.skipped {
        info!(
            persisted = drained.persisted.len(),
            remaining = drained.remaining,
            "replayed queued captures"
        );
    }

    let ctx = CaptureContext::load(&pool, &args.user).await?;
    let position = match (args.location_denied, args.latitude, args.longitude) {
        (true, _, _) => Err(LocationFailure::PermissionDenied),
        (false, Some(lat), Some(lon)) => Ok(Coordinate::new(lat, lon)),
        _ => Err(LocationFailure::Unavailable),
    };
    let device = CliDevice {
        position,
        photo: Some(read_photo(&args.photo).await?),
    };

    let client = CaptureClient::new(queue.clone(), sink, network, cfg.sequencer());
    let result = client.punch(&ctx, args.action, &device).await;

    sync.stop().await?;
    info!(pending = queue.pending().await?, "device queue");

    match result {
        Ok(outcome) => {
            println!("{}", outcome.message());
            Ok(())
        }
        Err(err) => {
            let response = submitter::response_for(&Err(err));
            println!("{}", serde_json::to_string_pretty(&response)?);
            std::process::exit(1);
        }
    }
}
