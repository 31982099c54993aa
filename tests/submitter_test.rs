use anyhow::{anyhow, Result};
use async_trait::async_trait;
use attendance_sync::db::{self, NewEvent};
use attendance_sync::identity::IdentityService;
use attendance_sync::model::{ClockAction, Coordinate, Validation, Verdict};
use attendance_sync::photo::{ImagePayload, PhotoStore};
use attendance_sync::review::{override_validation, SupervisorId};
use attendance_sync::sequencer::{ActionSequencer, DayBoundary};
use attendance_sync::submitter::{AttendanceSubmitter, ChangeNotifier, SubmitRequest};
use attendance_sync::validation::IdentityValidator;
use attendance_sync::AttendanceError;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn utc_sequencer() -> ActionSequencer {
    ActionSequencer::new(DayBoundary::from_offset_minutes(Some(0)))
}

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 3, h, m, 0).unwrap()
}

fn photo() -> ImagePayload {
    ImagePayload::jpeg(vec![0xff, 0xd8, 0xff, 0xe0])
}

fn request(user: &str, action: ClockAction, captured_at: DateTime<Utc>) -> SubmitRequest {
    let mut req = SubmitRequest::new(user, action, photo(), Some(Coordinate::new(-23.55, -46.63)));
    req.captured_at = captured_at;
    req
}

#[derive(Clone, Default)]
struct MemoryPhotos {
    objects: Arc<Mutex<HashMap<String, ImagePayload>>>,
}

impl MemoryPhotos {
    async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }
}

#[async_trait]
impl PhotoStore for MemoryPhotos {
    async fn put(&self, key: &str, photo: &ImagePayload) -> Result<String> {
        self.objects
            .lock()
            .await
            .insert(key.to_string(), photo.clone());
        Ok(key.to_string())
    }

    async fn get(&self, reference: &str) -> Result<ImagePayload> {
        self.objects
            .lock()
            .await
            .get(reference)
            .cloned()
            .ok_or_else(|| anyhow!("no photo at {}", reference))
    }

    async fn delete(&self, reference: &str) -> Result<()> {
        self.objects.lock().await.remove(reference);
        Ok(())
    }
}

/// Lets another writer persist an event for the same user while the photo
/// upload is in flight.
#[derive(Clone)]
struct RacingPhotos {
    inner: MemoryPhotos,
    pool: sqlx::SqlitePool,
    competing: Arc<Mutex<Option<NewEvent>>>,
}

#[async_trait]
impl PhotoStore for RacingPhotos {
    async fn put(&self, key: &str, photo: &ImagePayload) -> Result<String> {
        if let Some(ev) = self.competing.lock().await.take() {
            let expected = db::latest_event(&self.pool, &ev.user_id).await?.map(|e| e.id);
            db::insert_event_guarded(&self.pool, &ev, expected)
                .await?
                .ok_or_else(|| anyhow!("competing insert lost"))?;
        }
        self.inner.put(key, photo).await
    }

    async fn get(&self, reference: &str) -> Result<ImagePayload> {
        self.inner.get(reference).await
    }

    async fn delete(&self, reference: &str) -> Result<()> {
        self.inner.delete(reference).await
    }
}

#[derive(Clone, Default)]
struct RecordingNotifier {
    calls: Arc<Mutex<Vec<(String, NaiveDate)>>>,
}

impl RecordingNotifier {
    async fn calls(&self) -> Vec<(String, NaiveDate)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl ChangeNotifier for RecordingNotifier {
    async fn attendance_changed(&self, user_id: &str, day: NaiveDate) {
        self.calls.lock().await.push((user_id.to_string(), day));
    }
}

#[derive(Clone, Default)]
struct ScriptedIdentity {
    responses: Arc<Mutex<VecDeque<Result<Verdict>>>>,
}

impl ScriptedIdentity {
    fn with_responses(responses: Vec<Result<Verdict>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
        }
    }
}

#[async_trait]
impl IdentityService for ScriptedIdentity {
    async fn compare(&self, _reference: &ImagePayload, _submitted: &ImagePayload) -> Result<Verdict> {
        self.responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(anyhow!("identity service unavailable")))
    }
}

#[tokio::test]
async fn missing_inputs_are_rejected_before_any_write() {
    let pool = setup_pool().await;
    let photos = MemoryPhotos::default();
    let submitter = AttendanceSubmitter::new(pool.clone(), Arc::new(photos.clone()), utc_sequencer());

    let mut no_user = request("  ", ClockAction::ClockIn, at(8, 0));
    no_user.user_id = "  ".into();
    let err = submitter.submit(no_user).await.unwrap_err();
    assert!(matches!(err, AttendanceError::MissingInput("userId")));

    let mut no_action = request("u-1", ClockAction::ClockIn, at(8, 0));
    no_action.action = None;
    let err = submitter.submit(no_action).await.unwrap_err();
    assert!(matches!(err, AttendanceError::MissingInput("action")));

    let mut empty_photo = request("u-1", ClockAction::ClockIn, at(8, 0));
    empty_photo.photo = Some(ImagePayload::jpeg(Vec::new()));
    let err = submitter.submit(empty_photo).await.unwrap_err();
    assert!(matches!(err, AttendanceError::MissingInput("photo")));

    assert_eq!(photos.len().await, 0);
    assert!(db::events_for_user(&pool, "u-1").await.unwrap().is_empty());
}

#[tokio::test]
async fn full_day_is_persisted_in_order() {
    let pool = setup_pool().await;
    let photos = MemoryPhotos::default();
    let submitter = AttendanceSubmitter::new(pool.clone(), Arc::new(photos.clone()), utc_sequencer());

    let steps = [
        (ClockAction::ClockIn, at(8, 0)),
        (ClockAction::BreakStart, at(12, 0)),
        (ClockAction::BreakEnd, at(13, 0)),
        (ClockAction::ClockOut, at(17, 0)),
    ];
    for (action, ts) in steps {
        let receipt = submitter.submit(request("u-1", action, ts)).await.unwrap();
        assert!(!receipt.replayed);
    }

    let events = db::events_for_user(&pool, "u-1").await.unwrap();
    let actions: Vec<ClockAction> = events.iter().map(|e| e.action).collect();
    assert_eq!(actions, steps.map(|(a, _)| a).to_vec());
    assert!(events.iter().all(|e| e.validation == Validation::Unvalidated));
    assert_eq!(photos.len().await, 4);
    assert_eq!(db::count_validation_tasks(&pool).await.unwrap(), 4);
}

#[tokio::test]
async fn invalid_transition_is_rejected_without_writes() {
    let pool = setup_pool().await;
    let photos = MemoryPhotos::default();
    let submitter = AttendanceSubmitter::new(pool.clone(), Arc::new(photos.clone()), utc_sequencer());

    let err = submitter
        .submit(request("u-1", ClockAction::BreakStart, at(8, 0)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AttendanceError::InvalidTransition {
            last: None,
            requested: ClockAction::BreakStart
        }
    ));

    submitter
        .submit(request("u-1", ClockAction::ClockIn, at(8, 0)))
        .await
        .unwrap();
    let err = submitter
        .submit(request("u-1", ClockAction::ClockIn, at(8, 5)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AttendanceError::InvalidTransition {
            last: Some(ClockAction::ClockIn),
            requested: ClockAction::ClockIn
        }
    ));
    assert!(!err.is_retryable());
    assert_eq!(db::events_for_user(&pool, "u-1").await.unwrap().len(), 1);
    assert_eq!(photos.len().await, 1);
}

#[tokio::test]
async fn yesterdays_events_do_not_constrain_today() {
    let pool = setup_pool().await;
    let submitter =
        AttendanceSubmitter::new(pool.clone(), Arc::new(MemoryPhotos::default()), utc_sequencer());

    submitter
        .submit(request("u-1", ClockAction::ClockIn, at(8, 0)))
        .await
        .unwrap();
    // Forgot to clock out; the next day starts fresh.
    let next_day = Utc.with_ymd_and_hms(2024, 6, 4, 8, 0, 0).unwrap();
    submitter
        .submit(request("u-1", ClockAction::ClockIn, next_day))
        .await
        .unwrap();
    assert_eq!(db::events_for_user(&pool, "u-1").await.unwrap().len(), 2);
}

#[tokio::test]
async fn concurrent_writer_wins_and_loser_is_rejected() {
    let pool = setup_pool().await;
    let competing = NewEvent {
        submission_id: "other-device".into(),
        user_id: "u-1".into(),
        action: ClockAction::ClockIn,
        timestamp: at(7, 59),
        photo_ref: "attendance/u-1/other.jpg".into(),
        location: None,
    };
    let photos = RacingPhotos {
        inner: MemoryPhotos::default(),
        pool: pool.clone(),
        competing: Arc::new(Mutex::new(Some(competing))),
    };
    let submitter =
        AttendanceSubmitter::new(pool.clone(), Arc::new(photos.clone()), utc_sequencer());

    let err = submitter
        .submit(request("u-1", ClockAction::ClockIn, at(8, 0)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AttendanceError::InvalidTransition {
            last: Some(ClockAction::ClockIn),
            requested: ClockAction::ClockIn
        }
    ));

    let events = db::events_for_user(&pool, "u-1").await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].submission_id, "other-device");
    // The losing upload is removed again.
    assert_eq!(photos.inner.len().await, 0);
}

#[tokio::test]
async fn replaying_a_persisted_submission_is_idempotent() {
    let pool = setup_pool().await;
    let notifier = RecordingNotifier::default();
    let submitter =
        AttendanceSubmitter::new(pool.clone(), Arc::new(MemoryPhotos::default()), utc_sequencer())
            .with_notifier(Arc::new(notifier.clone()));

    let req = request("u-1", ClockAction::ClockIn, at(8, 0));
    let first = submitter.submit(req.clone()).await.unwrap();
    let again = submitter.submit(req).await.unwrap();

    assert_eq!(first.log_id, again.log_id);
    assert!(!first.replayed);
    assert!(again.replayed);
    assert_eq!(db::events_for_user(&pool, "u-1").await.unwrap().len(), 1);
    assert_eq!(notifier.calls().await.len(), 1);
}

#[tokio::test]
async fn notifier_runs_only_after_a_successful_persist() {
    let pool = setup_pool().await;
    let notifier = RecordingNotifier::default();
    let submitter =
        AttendanceSubmitter::new(pool.clone(), Arc::new(MemoryPhotos::default()), utc_sequencer())
            .with_notifier(Arc::new(notifier.clone()));

    let _ = submitter
        .submit(request("u-1", ClockAction::ClockOut, at(8, 0)))
        .await
        .unwrap_err();
    assert!(notifier.calls().await.is_empty());

    submitter
        .submit(request("u-1", ClockAction::ClockIn, at(8, 0)))
        .await
        .unwrap();
    assert_eq!(
        notifier.calls().await,
        vec![("u-1".to_string(), NaiveDate::from_ymd_opt(2024, 6, 3).unwrap())]
    );
}

#[tokio::test]
async fn identity_failure_does_not_block_the_write() {
    let pool = setup_pool().await;
    let photos = MemoryPhotos::default();
    photos.put("reference/u-1.jpg", &photo()).await.unwrap();
    db::upsert_collaborator(&pool, "u-1", None, None, Some("reference/u-1.jpg"))
        .await
        .unwrap();

    let identity = ScriptedIdentity::with_responses(vec![Err(anyhow!("timeout"))]);
    let validator = IdentityValidator::new(
        pool.clone(),
        Arc::new(photos.clone()),
        Arc::new(identity),
        Duration::from_secs(2),
        5,
        60,
    );
    let submitter = AttendanceSubmitter::new(pool.clone(), Arc::new(photos), utc_sequencer())
        .with_inline_validation(validator);

    let receipt = submitter
        .submit(request("u-1", ClockAction::ClockIn, at(8, 0)))
        .await
        .unwrap();
    let event = db::get_event(&pool, receipt.log_id).await.unwrap().unwrap();
    assert_eq!(event.validation, Validation::Unvalidated);

    let task = db::validation_task_for_event(&pool, receipt.log_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.attempt, 1);
}

#[tokio::test]
async fn inline_validation_records_the_verdict() {
    let pool = setup_pool().await;
    let photos = MemoryPhotos::default();
    photos.put("reference/u-1.jpg", &photo()).await.unwrap();
    db::upsert_collaborator(&pool, "u-1", None, None, Some("reference/u-1.jpg"))
        .await
        .unwrap();

    let identity = ScriptedIdentity::with_responses(vec![Ok(Verdict {
        is_match: true,
        confidence: 0.93,
        reason: "same person".into(),
    })]);
    let validator = IdentityValidator::new(
        pool.clone(),
        Arc::new(photos.clone()),
        Arc::new(identity),
        Duration::from_secs(2),
        5,
        60,
    );
    let submitter = AttendanceSubmitter::new(pool.clone(), Arc::new(photos), utc_sequencer())
        .with_inline_validation(validator);

    let receipt = submitter
        .submit(request("u-1", ClockAction::ClockIn, at(8, 0)))
        .await
        .unwrap();
    let event = db::get_event(&pool, receipt.log_id).await.unwrap().unwrap();
    assert_eq!(event.validation.is_match(), Some(true));
    assert_eq!(event.validation.confidence(), Some(0.93));
    assert_eq!(db::count_validation_tasks(&pool).await.unwrap(), 0);
}

#[tokio::test]
async fn supervisor_override_forces_a_full_match() {
    let pool = setup_pool().await;
    let submitter =
        AttendanceSubmitter::new(pool.clone(), Arc::new(MemoryPhotos::default()), utc_sequencer());
    let receipt = submitter
        .submit(request("u-1", ClockAction::ClockIn, at(8, 0)))
        .await
        .unwrap();
    db::record_verdict(
        &pool,
        receipt.log_id,
        &Verdict {
            is_match: false,
            confidence: 0.12,
            reason: "different person".into(),
        },
    )
    .await
    .unwrap();

    let supervisor = SupervisorId::new("sup-7").unwrap();
    let corrected = at(7, 58);
    let event = override_validation(&pool, receipt.log_id, &supervisor, Some(corrected))
        .await
        .unwrap();

    assert!(matches!(
        &event.validation,
        Validation::Overridden { by, .. } if by == "sup-7"
    ));
    assert_eq!(event.validation.is_match(), Some(true));
    assert_eq!(event.validation.confidence(), Some(1.0));
    assert_eq!(event.timestamp, corrected);
    assert!(db::validation_task_for_event(&pool, receipt.log_id)
        .await
        .unwrap()
        .is_none());

    assert!(override_validation(&pool, 9_999, &supervisor, None)
        .await
        .is_err());
}
