//! Durable device-local queue table.
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

use crate::db::{self, Pool};
use crate::model::{format_timestamp, parse_timestamp, ClockAction, Coordinate};
use crate::photo::ImagePayload;
use crate::submitter::SubmitRequest;

/// A capture waiting to be replayed. `key` is assigned by the queue and
/// only ever grows, so key order is enqueue order.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedSubmission {
    pub key: i64,
    pub submission_id: Uuid,
    pub user_id: String,
    pub action: ClockAction,
    pub photo: ImagePayload,
    pub location: Option<Coordinate>,
    pub captured_at: DateTime<Utc>,
}

impl QueuedSubmission {
    pub fn to_request(&self) -> SubmitRequest {
        SubmitRequest {
            submission_id: self.submission_id,
            user_id: self.user_id.clone(),
            action: Some(self.action),
            photo: Some(self.photo.clone()),
            location: self.location,
            captured_at: self.captured_at,
        }
    }
}

/// Open (creating if needed) the device queue database.
pub async fn open(url: &str) -> Result<Pool> {
    let pool = db::init_pool(url).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./device_migrations").run(pool).await?;
    Ok(())
}

fn queued_from_row(row: &SqliteRow) -> Result<QueuedSubmission> {
    let key: i64 = row.get("key");
    let submission_id: String = row.get("submission_id");
    let action: String = row.get("action");
    let image: String = row.get("captured_image");
    let timestamp: String = row.get("timestamp");
    let latitude: Option<f64> = row.get("latitude");
    let longitude: Option<f64> = row.get("longitude");

    Ok(QueuedSubmission {
        key,
        submission_id: Uuid::parse_str(&submission_id)
            .with_context(|| format!("queue item {} has a bad submission id", key))?,
        user_id: row.get("user_id"),
        action: ClockAction::parse(&action)
            .ok_or_else(|| anyhow!("queue item {} has unknown action {}", key, action))?,
        photo: ImagePayload::from_data_uri(&image)
            .with_context(|| format!("queue item {} has an unreadable photo", key))?,
        location: match (latitude, longitude) {
            (Some(lat), Some(lon)) => Some(Coordinate::new(lat, lon)),
            _ => None,
        },
        captured_at: parse_timestamp(&timestamp)
            .ok_or_else(|| anyhow!("queue item {} has bad timestamp {}", key, timestamp))?,
    })
}

/// Append a submission. Enqueuing the same submission twice keeps the
/// original position and returns its key.
#[instrument(skip_all)]
pub async fn enqueue(pool: &Pool, req: &SubmitRequest) -> Result<i64> {
    let action = req
        .action
        .ok_or_else(|| anyhow!("cannot queue a submission without an action"))?;
    let photo = req
        .photo
        .as_ref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| anyhow!("cannot queue a submission without a photo"))?;
    let submission_id = req.submission_id.to_string();

    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO sync_queue (submission_id, user_id, action, captured_image, latitude, longitude, timestamp)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(submission_id) DO NOTHING",
    )
    .bind(&submission_id)
    .bind(&req.user_id)
    .bind(action.as_str())
    .bind(photo.to_data_uri())
    .bind(req.location.map(|c| c.latitude))
    .bind(req.location.map(|c| c.longitude))
    .bind(format_timestamp(&req.captured_at))
    .execute(&mut *tx)
    .await?;
    let key: i64 = sqlx::query_scalar("SELECT key FROM sync_queue WHERE submission_id = ?")
        .bind(&submission_id)
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(key)
}

/// Oldest item, i.e. the next one to replay.
#[instrument(skip_all)]
pub async fn peek_next(pool: &Pool) -> Result<Option<QueuedSubmission>> {
    let row = sqlx::query("SELECT * FROM sync_queue ORDER BY key ASC LIMIT 1")
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(queued_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list(pool: &Pool) -> Result<Vec<QueuedSubmission>> {
    let rows = sqlx::query("SELECT * FROM sync_queue ORDER BY key ASC")
        .fetch_all(pool)
        .await?;
    rows.iter().map(queued_from_row).collect()
}

/// Newest pending item of a user; it is what the server will see last once
/// the queue drains.
#[instrument(skip_all)]
pub async fn last_for_user(pool: &Pool, user_id: &str) -> Result<Option<QueuedSubmission>> {
    let row = sqlx::query("SELECT * FROM sync_queue WHERE user_id = ? ORDER BY key DESC LIMIT 1")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(queued_from_row).transpose()
}

/// Remove an item after its replay was acknowledged. Returns false if it
/// was already gone.
#[instrument(skip_all)]
pub async fn delete(pool: &Pool, key: i64) -> Result<bool> {
    let res = sqlx::query("DELETE FROM sync_queue WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

/// Move an item into `sync_rejected`, keeping the capture and the reason.
#[instrument(skip_all)]
pub async fn reject(pool: &Pool, key: i64, reason: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let moved = sqlx::query(
        "INSERT INTO sync_rejected (key, submission_id, user_id, action, captured_image, latitude, longitude, timestamp, reason)
         SELECT key, submission_id, user_id, action, captured_image, latitude, longitude, timestamp, ?
         FROM sync_queue WHERE key = ?",
    )
    .bind(reason)
    .bind(key)
    .execute(&mut *tx)
    .await?;
    if moved.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }
    sqlx::query("DELETE FROM sync_queue WHERE key = ?")
        .bind(key)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(true)
}

#[instrument(skip_all)]
pub async fn count(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Dead-lettered items as `(key, reason)`, oldest first.
#[instrument(skip_all)]
pub async fn rejected(pool: &Pool) -> Result<Vec<(i64, String)>> {
    let rows: Vec<(i64, String)> =
        sqlx::query_as("SELECT key, reason FROM sync_rejected ORDER BY key ASC")
            .fetch_all(pool)
            .await?;
    Ok(rows)
}
