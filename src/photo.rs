//! Captured photos: data-URI payloads and the object store they land in.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

use crate::model::ClockAction;

static DATA_URI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^data:(image/[A-Za-z0-9.+-]+);base64,([A-Za-z0-9+/=\s]+)$")
        .expect("valid data uri regex")
});

/// Encoded image as produced by the capture collaborator.
#[derive(Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for ImagePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImagePayload")
            .field("content_type", &self.content_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl ImagePayload {
    pub fn new(content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            content_type: content_type.into(),
            bytes,
        }
    }

    pub fn jpeg(bytes: Vec<u8>) -> Self {
        Self::new("image/jpeg", bytes)
    }

    /// Parse `data:image/<type>;base64,<bytes>`.
    pub fn from_data_uri(uri: &str) -> Result<Self> {
        let caps = DATA_URI
            .captures(uri.trim())
            .ok_or_else(|| anyhow!("not a base64 image data URI"))?;
        let body: String = caps[2].split_whitespace().collect();
        let bytes = general_purpose::STANDARD
            .decode(body)
            .context("invalid base64 image payload")?;
        Ok(Self::new(&caps[1], bytes))
    }

    pub fn to_data_uri(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.content_type,
            general_purpose::STANDARD.encode(&self.bytes)
        )
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn extension(&self) -> &'static str {
        content_type_extension(&self.content_type)
    }
}

fn content_type_extension(content_type: &str) -> &'static str {
    match content_type.to_ascii_lowercase().as_str() {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "bin",
    }
}

fn extension_content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|s| s.to_ascii_lowercase())
    {
        Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg",
        Some(ext) if ext == "png" => "image/png",
        Some(ext) if ext == "webp" => "image/webp",
        Some(ext) if ext == "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}

/// Object-store path for a captured photo, keyed by user and capture time.
pub fn photo_key(user_id: &str, captured_at: DateTime<Utc>, action: ClockAction, ext: &str) -> String {
    let safe_user: String = user_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!(
        "attendance/{}/{}_{}.{}",
        safe_user,
        captured_at.format("%Y%m%dT%H%M%S%.3fZ"),
        action.as_str(),
        ext
    )
}

#[async_trait]
pub trait PhotoStore: Send + Sync {
    /// Store `photo` under `key`; returns a durable reference.
    async fn put(&self, key: &str, photo: &ImagePayload) -> Result<String>;

    async fn get(&self, reference: &str) -> Result<ImagePayload>;

    /// Remove a stored photo. Removing a missing one is not an error.
    async fn delete(&self, reference: &str) -> Result<()>;
}

/// Photo store rooted at a local directory; references are paths relative
/// to the root.
#[derive(Debug, Clone)]
pub struct FsPhotoStore {
    root: PathBuf,
}

impl FsPhotoStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, reference: &str) -> Result<PathBuf> {
        let rel = Path::new(reference);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(anyhow!("invalid photo reference: {}", reference));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl PhotoStore for FsPhotoStore {
    async fn put(&self, key: &str, photo: &ImagePayload) -> Result<String> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create photo dir: {}", parent.display()))?;
        }
        fs::write(&path, &photo.bytes)
            .await
            .with_context(|| format!("failed to write photo: {}", path.display()))?;
        Ok(key.to_string())
    }

    async fn get(&self, reference: &str) -> Result<ImagePayload> {
        let path = self.resolve(reference)?;
        let bytes = fs::read(&path)
            .await
            .with_context(|| format!("failed to read photo: {}", path.display()))?;
        Ok(ImagePayload::new(extension_content_type(&path), bytes))
    }

    async fn delete(&self, reference: &str) -> Result<()> {
        let path = self.resolve(reference)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed to delete photo: {}", path.display()))
            }
        }
    }
}
