use anyhow::{Context, Result};
use attendance_sync::config;
use attendance_sync::db;
use attendance_sync::model::WorkSite;
use attendance_sync::photo::{FsPhotoStore, ImagePayload, PhotoStore};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Create or update a work site and assign a collaborator to it"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[arg(long)]
    site: String,

    #[arg(long)]
    site_name: Option<String>,

    #[arg(long, allow_hyphen_values = true)]
    latitude: f64,

    #[arg(long, allow_hyphen_values = true)]
    longitude: f64,

    /// Geofence radius in meters
    #[arg(long, default_value = "100")]
    radius: f64,

    /// Collaborator to assign to the site
    #[arg(long)]
    user: String,

    #[arg(long)]
    full_name: Option<String>,

    /// Reference photo (JPEG) identity comparisons are made against
    #[arg(long)]
    reference_photo: Option<PathBuf>,
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

    let site = WorkSite {
        id: args.site.clone(),
        center_latitude: args.latitude,
        center_longitude: args.longitude,
        radius_meters: args.radius,
    };
    db::upsert_work_site(&pool, &site, args.site_name.as_deref()).await?;

    let reference = match &args.reference_photo {
        Some(path) => {
            let bytes = tokio::fs::read(path)
                .await
                .with_context(|| format!("failed to read reference photo: {}", path.display()))?;
            let photos = FsPhotoStore::new(cfg.photo_root());
            let key = format!("reference/{}.jpg", args.user);
            Some(photos.put(&key, &ImagePayload::jpeg(bytes)).await?)
        }
        None => db::reference_photo_for_user(&pool, &args.user).await?,
    };
    db::upsert_collaborator(
        &pool,
        &args.user,
        args.full_name.as_deref(),
        Some(&site.id),
        reference.as_deref(),
    )
    .await?;

    info!(
        user_id = %args.user,
        site_id = %site.id,
        radius_m = site.radius_meters,
        has_reference = reference.is_some(),
        "collaborator assigned"
    );
    Ok(())
}
