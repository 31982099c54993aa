use super::model::{NewEvent, ValidationTask};
use crate::model::{
    format_timestamp, parse_timestamp, AttendanceEvent, ClockAction, Coordinate, Validation,
    Verdict, WorkSite,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized)
        .await
        .with_context(|| format!("failed to open {}", normalized))?;
    // WAL plus full sync: an acknowledged write must survive a crash.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// Normalize a file-backed SQLite URL: expand a leading `~/`, create the
/// parent directory and ask SQLite to create the file. In-memory and
/// non-sqlite URLs pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) if q.contains("mode=") => format!("sqlite://{}?{}", path, q),
        Some(q) => format!("sqlite://{}?{}&mode=rwc", path, q),
        None => format!("sqlite://{}?mode=rwc", path),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn upsert_work_site(pool: &Pool, site: &WorkSite, name: Option<&str>) -> Result<()> {
    sqlx::query(
        "INSERT INTO work_sites (id, name, latitude, longitude, radius_meters) VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name, latitude = excluded.latitude,
           longitude = excluded.longitude, radius_meters = excluded.radius_meters",
    )
    .bind(&site.id)
    .bind(name)
    .bind(site.center_latitude)
    .bind(site.center_longitude)
    .bind(site.radius_meters)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn upsert_collaborator(
    pool: &Pool,
    user_id: &str,
    full_name: Option<&str>,
    work_site_id: Option<&str>,
    reference_photo: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO collaborators (id, full_name, work_site_id, reference_photo) VALUES (?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET full_name = excluded.full_name,
           work_site_id = excluded.work_site_id, reference_photo = excluded.reference_photo",
    )
    .bind(user_id)
    .bind(full_name)
    .bind(work_site_id)
    .bind(reference_photo)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn work_site_for_user(pool: &Pool, user_id: &str) -> Result<Option<WorkSite>> {
    let row = sqlx::query(
        "SELECT w.id, w.latitude, w.longitude, w.radius_meters
         FROM collaborators c JOIN work_sites w ON w.id = c.work_site_id
         WHERE c.id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| WorkSite {
        id: row.get("id"),
        center_latitude: row.get("latitude"),
        center_longitude: row.get("longitude"),
        radius_meters: row.get("radius_meters"),
    }))
}

#[instrument(skip_all)]
pub async fn reference_photo_for_user(pool: &Pool, user_id: &str) -> Result<Option<String>> {
    let photo: Option<Option<String>> =
        sqlx::query_scalar("SELECT reference_photo FROM collaborators WHERE id = ?")
            .bind(user_id)
            .fetch_optional(pool)
            .await?;
    Ok(photo.flatten().filter(|p| !p.trim().is_empty()))
}

fn event_from_row(row: &SqliteRow) -> Result<AttendanceEvent> {
    let action: String = row.get("action");
    let action = ClockAction::parse(&action).ok_or_else(|| anyhow!("unknown action {}", action))?;
    let timestamp: String = row.get("timestamp");
    let timestamp =
        parse_timestamp(&timestamp).ok_or_else(|| anyhow!("bad timestamp {}", timestamp))?;

    let latitude: Option<f64> = row.get("latitude");
    let longitude: Option<f64> = row.get("longitude");
    let location = match (latitude, longitude) {
        (Some(lat), Some(lon)) => Some(Coordinate::new(lat, lon)),
        _ => None,
    };

    let state: String = row.get("validation");
    let validation = match state.as_str() {
        "unvalidated" => Validation::Unvalidated,
        "validated" => Validation::Validated {
            is_match: row.get::<Option<bool>, _>("is_match").unwrap_or(false),
            confidence: row.get::<Option<f64>, _>("confidence").unwrap_or(0.0),
            reason: row.get::<Option<String>, _>("reason").unwrap_or_default(),
        },
        "overridden" => {
            let at: Option<String> = row.get("overridden_at");
            Validation::Overridden {
                by: row.get::<Option<String>, _>("overridden_by").unwrap_or_default(),
                at: at
                    .as_deref()
                    .and_then(parse_timestamp)
                    .ok_or_else(|| anyhow!("override without timestamp"))?,
            }
        }
        other => return Err(anyhow!("unknown validation state {}", other)),
    };

    Ok(AttendanceEvent {
        id: row.get("id"),
        submission_id: row.get("submission_id"),
        user_id: row.get("user_id"),
        action,
        timestamp,
        photo_ref: row.get("photo_url"),
        location,
        validation,
    })
}

/// Most recent event of the user by capture time.
#[instrument(skip_all)]
pub async fn latest_event(pool: &Pool, user_id: &str) -> Result<Option<AttendanceEvent>> {
    let row = sqlx::query(
        "SELECT * FROM attendance_events WHERE user_id = ? ORDER BY timestamp DESC, id DESC LIMIT 1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(event_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn get_event(pool: &Pool, event_id: i64) -> Result<Option<AttendanceEvent>> {
    let row = sqlx::query("SELECT * FROM attendance_events WHERE id = ?")
        .bind(event_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(event_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn event_id_for_submission(pool: &Pool, submission_id: &str) -> Result<Option<i64>> {
    let id = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM attendance_events WHERE submission_id = ?",
    )
    .bind(submission_id)
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn photo_ref_in_use(pool: &Pool, photo_ref: &str) -> Result<bool> {
    let used = sqlx::query_scalar::<_, i64>(
        "SELECT EXISTS(SELECT 1 FROM attendance_events WHERE photo_ref = ?)",
    )
    .bind(photo_ref)
    .fetch_one(pool)
    .await?;
    Ok(used != 0)
}

#[instrument(skip_all)]
pub async fn events_for_user(pool: &Pool, user_id: &str) -> Result<Vec<AttendanceEvent>> {
    let rows = sqlx::query(
        "SELECT * FROM attendance_events WHERE user_id = ? ORDER BY timestamp ASC, id ASC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(event_from_row).collect()
}

/// Insert `ev` only if the user's latest event is still `expected_latest`
/// (`None`: the user has no events). The check and the insert are one
/// statement, so a concurrent writer that got there first makes this
/// return `Ok(None)` instead of stacking a second transition.
///
/// A validation task for the new event is queued in the same transaction.
#[instrument(skip_all)]
pub async fn insert_event_guarded(
    pool: &Pool,
    ev: &NewEvent,
    expected_latest: Option<i64>,
) -> Result<Option<i64>> {
    let mut tx = pool.begin().await?;
    let id: Option<i64> = sqlx::query_scalar(
        "INSERT INTO attendance_events (submission_id, user_id, action, timestamp, photo_url, latitude, longitude)
         SELECT ?, ?, ?, ?, ?, ?, ?
         WHERE COALESCE(
           (SELECT id FROM attendance_events WHERE user_id = ? ORDER BY timestamp DESC, id DESC LIMIT 1),
           0) = ?
         RETURNING id",
    )
    .bind(&ev.submission_id)
    .bind(&ev.user_id)
    .bind(ev.action.as_str())
    .bind(format_timestamp(&ev.timestamp))
    .bind(&ev.photo_ref)
    .bind(ev.location.map(|c| c.latitude))
    .bind(ev.location.map(|c| c.longitude))
    .bind(&ev.user_id)
    .bind(expected_latest.unwrap_or(0))
    .fetch_optional(&mut *tx)
    .await?;

    let Some(id) = id else {
        tx.rollback().await?;
        return Ok(None);
    };

    sqlx::query("INSERT INTO validation_tasks (event_id, attempt, due_at) VALUES (?, 0, datetime('now'))")
        .bind(id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(Some(id))
}

/// Attach a comparison verdict. Write-once: returns false when the event is
/// missing or already carries a verdict or override.
#[instrument(skip_all)]
pub async fn record_verdict(pool: &Pool, event_id: i64, verdict: &Verdict) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE attendance_events
         SET validation = 'validated', is_match = ?, confidence = ?, reason = ?
         WHERE id = ? AND validation = 'unvalidated'",
    )
    .bind(verdict.is_match)
    .bind(verdict.confidence)
    .bind(&verdict.reason)
    .bind(event_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Supervisor override: full match regardless of the current state,
/// optionally correcting the capture timestamp. Any pending validation is
/// cancelled. Returns false when the event does not exist.
#[instrument(skip_all)]
pub async fn apply_override(
    pool: &Pool,
    event_id: i64,
    supervisor_id: &str,
    at: DateTime<Utc>,
    corrected_timestamp: Option<DateTime<Utc>>,
) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        "UPDATE attendance_events
         SET validation = 'overridden', is_match = 1, confidence = 1.0,
             reason = 'supervisor override', overridden_by = ?, overridden_at = ?,
             timestamp = COALESCE(?, timestamp)
         WHERE id = ?",
    )
    .bind(supervisor_id)
    .bind(format_timestamp(&at))
    .bind(corrected_timestamp.as_ref().map(format_timestamp))
    .bind(event_id)
    .execute(&mut *tx)
    .await?;
    if res.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }
    sqlx::query("DELETE FROM validation_tasks WHERE event_id = ?")
        .bind(event_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(true)
}

#[instrument(skip_all)]
pub async fn next_due_validation(pool: &Pool) -> Result<Option<ValidationTask>> {
    let row = sqlx::query(
        "SELECT id, event_id, attempt FROM validation_tasks
         WHERE datetime(due_at) <= CURRENT_TIMESTAMP
           AND (claimed_until IS NULL OR datetime(claimed_until) <= CURRENT_TIMESTAMP)
         ORDER BY datetime(due_at) ASC, id ASC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| ValidationTask {
        id: row.get("id"),
        event_id: row.get("event_id"),
        attempt: row.get("attempt"),
    }))
}

#[instrument(skip_all)]
pub async fn validation_task_for_event(pool: &Pool, event_id: i64) -> Result<Option<ValidationTask>> {
    let row = sqlx::query("SELECT id, event_id, attempt FROM validation_tasks WHERE event_id = ?")
        .bind(event_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|row| ValidationTask {
        id: row.get("id"),
        event_id: row.get("event_id"),
        attempt: row.get("attempt"),
    }))
}

/// Take the task for `lease_secs`. Returns false if someone else holds an
/// unexpired claim.
#[instrument(skip_all)]
pub async fn claim_validation_task(pool: &Pool, id: i64, lease_secs: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE validation_tasks
         SET claimed_until = datetime('now', ? || ' seconds')
         WHERE id = ?
           AND (claimed_until IS NULL OR datetime(claimed_until) <= CURRENT_TIMESTAMP)",
    )
    .bind(lease_secs)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn delete_validation_task(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM validation_tasks WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Push the task back by `5s * 2^attempt`, capped at `max_cap_secs`
/// (no cap when <= 0).
#[instrument(skip_all)]
pub async fn backoff_validation_task(
    pool: &Pool,
    id: i64,
    attempt: i32,
    max_cap_secs: i64,
    error: &str,
) -> Result<()> {
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    let secs = if max_cap_secs > 0 {
        secs.min(max_cap_secs)
    } else {
        secs
    };
    sqlx::query(
        "UPDATE validation_tasks
         SET attempt = ?, due_at = datetime('now', ? || ' seconds'), last_error = ?,
             claimed_until = NULL
         WHERE id = ?",
    )
    .bind(attempt + 1)
    .bind(secs)
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn count_validation_tasks(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM validation_tasks")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn new_event(sub: &str, action: ClockAction, minute: u32) -> NewEvent {
        NewEvent {
            submission_id: sub.into(),
            user_id: "u-1".into(),
            action,
            timestamp: Utc.with_ymd_and_hms(2024, 6, 3, 12, minute, 0).unwrap(),
            photo_ref: format!("attendance/u-1/{sub}.jpg"),
            location: Some(Coordinate::new(-23.5, -46.6)),
        }
    }

    #[test]
    fn sqlite_url_normalization() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
        let td = tempfile::tempdir().unwrap();
        let file = td.path().join("nested/q.db");
        let url = prepare_sqlite_url(&format!("sqlite://{}", file.display()));
        assert_eq!(url, format!("sqlite://{}?mode=rwc", file.display()));
        assert!(td.path().join("nested").exists());
    }

    #[tokio::test]
    async fn site_lookup_follows_assignment() {
        let pool = setup_pool().await;
        let site = WorkSite {
            id: "hq".into(),
            center_latitude: 1.0,
            center_longitude: 2.0,
            radius_meters: 80.0,
        };
        upsert_work_site(&pool, &site, Some("Head office")).await.unwrap();
        upsert_collaborator(&pool, "u-1", Some("Ana"), None, None)
            .await
            .unwrap();
        assert!(work_site_for_user(&pool, "u-1").await.unwrap().is_none());
        assert!(reference_photo_for_user(&pool, "u-1").await.unwrap().is_none());

        upsert_collaborator(&pool, "u-1", Some("Ana"), Some("hq"), Some("refs/u-1.jpg"))
            .await
            .unwrap();
        assert_eq!(work_site_for_user(&pool, "u-1").await.unwrap(), Some(site));
        assert_eq!(
            reference_photo_for_user(&pool, "u-1").await.unwrap().as_deref(),
            Some("refs/u-1.jpg")
        );
    }

    #[tokio::test]
    async fn guarded_insert_rejects_stale_expectation() {
        let pool = setup_pool().await;
        let first = insert_event_guarded(&pool, &new_event("a", ClockAction::ClockIn, 0), None)
            .await
            .unwrap()
            .expect("first insert wins");

        // A second writer that also read "no events" loses.
        let lost = insert_event_guarded(&pool, &new_event("b", ClockAction::ClockIn, 1), None)
            .await
            .unwrap();
        assert!(lost.is_none());

        let second = insert_event_guarded(
            &pool,
            &new_event("c", ClockAction::BreakStart, 2),
            Some(first),
        )
        .await
        .unwrap();
        assert!(second.is_some());

        let latest = latest_event(&pool, "u-1").await.unwrap().unwrap();
        assert_eq!(latest.action, ClockAction::BreakStart);
        assert_eq!(latest.validation, Validation::Unvalidated);
        assert_eq!(count_validation_tasks(&pool).await.unwrap(), 2);
        assert_eq!(
            event_id_for_submission(&pool, "a").await.unwrap(),
            Some(first)
        );
    }

    #[tokio::test]
    async fn verdict_is_write_once_but_override_always_applies() {
        let pool = setup_pool().await;
        let id = insert_event_guarded(&pool, &new_event("a", ClockAction::ClockIn, 0), None)
            .await
            .unwrap()
            .unwrap();
        let verdict = Verdict {
            is_match: false,
            confidence: 0.1,
            reason: "different person".into(),
        };
        assert!(record_verdict(&pool, id, &verdict).await.unwrap());
        let again = Verdict {
            is_match: true,
            confidence: 0.9,
            reason: "same".into(),
        };
        assert!(!record_verdict(&pool, id, &again).await.unwrap());
        let ev = get_event(&pool, id).await.unwrap().unwrap();
        assert_eq!(ev.validation, Validation::from(verdict));

        let at = Utc.with_ymd_and_hms(2024, 6, 3, 18, 0, 0).unwrap();
        let corrected = Utc.with_ymd_and_hms(2024, 6, 3, 11, 55, 0).unwrap();
        assert!(apply_override(&pool, id, "sup-9", at, Some(corrected))
            .await
            .unwrap());
        let ev = get_event(&pool, id).await.unwrap().unwrap();
        assert_eq!(
            ev.validation,
            Validation::Overridden {
                by: "sup-9".into(),
                at
            }
        );
        assert_eq!(ev.timestamp, corrected);
        assert_eq!(ev.validation.confidence(), Some(1.0));
        assert!(validation_task_for_event(&pool, id).await.unwrap().is_none());
        assert!(!apply_override(&pool, 999, "sup-9", at, None).await.unwrap());
    }

    #[tokio::test]
    async fn backoff_pushes_task_out_of_due_window() {
        let pool = setup_pool().await;
        let id = insert_event_guarded(&pool, &new_event("a", ClockAction::ClockIn, 0), None)
            .await
            .unwrap()
            .unwrap();
        let task = next_due_validation(&pool).await.unwrap().unwrap();
        assert_eq!(task.event_id, id);
        assert_eq!(task.attempt, 0);

        backoff_validation_task(&pool, task.id, task.attempt, 60, "timeout")
            .await
            .unwrap();
        assert!(next_due_validation(&pool).await.unwrap().is_none());
        let task = validation_task_for_event(&pool, id).await.unwrap().unwrap();
        assert_eq!(task.attempt, 1);

        delete_validation_task(&pool, task.id).await.unwrap();
        assert_eq!(count_validation_tasks(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn claimed_task_is_hidden_until_released() {
        let pool = setup_pool().await;
        insert_event_guarded(&pool, &new_event("a", ClockAction::ClockIn, 0), None)
            .await
            .unwrap()
            .unwrap();
        let task = next_due_validation(&pool).await.unwrap().unwrap();

        assert!(claim_validation_task(&pool, task.id, 60).await.unwrap());
        assert!(!claim_validation_task(&pool, task.id, 60).await.unwrap());
        assert!(next_due_validation(&pool).await.unwrap().is_none());

        // Backoff releases the claim; an expired claim can be taken again.
        backoff_validation_task(&pool, task.id, task.attempt, 60, "timeout")
            .await
            .unwrap();
        assert!(claim_validation_task(&pool, task.id, -1).await.unwrap());
        assert!(claim_validation_task(&pool, task.id, 60).await.unwrap());
    }
}
