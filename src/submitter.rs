//! Boundary operation that persists a clock action.
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::db::{self, NewEvent, Pool};
use crate::error::AttendanceError;
use crate::model::{ClockAction, Coordinate, SubmitResponse};
use crate::photo::{photo_key, ImagePayload, PhotoStore};
use crate::sequencer::ActionSequencer;
use crate::validation::IdentityValidator;

/// One clock action as handed over by the capture side. `action` and
/// `photo` are optional here because the boundary may receive them absent;
/// `submit` rejects that before any I/O.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Client-generated; makes replays of the same capture idempotent.
    pub submission_id: Uuid,
    pub user_id: String,
    pub action: Option<ClockAction>,
    pub photo: Option<ImagePayload>,
    pub location: Option<Coordinate>,
    pub captured_at: DateTime<Utc>,
}

impl SubmitRequest {
    pub fn new(
        user_id: impl Into<String>,
        action: ClockAction,
        photo: ImagePayload,
        location: Option<Coordinate>,
    ) -> Self {
        Self {
            submission_id: Uuid::new_v4(),
            user_id: user_id.into(),
            action: Some(action),
            photo: Some(photo),
            location,
            captured_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub log_id: i64,
    /// The submission had already been persisted by an earlier attempt.
    pub replayed: bool,
}

/// Wire reply for a submission attempt.
pub fn response_for(result: &Result<SubmitReceipt, AttendanceError>) -> SubmitResponse {
    match result {
        Ok(receipt) => SubmitResponse {
            success: true,
            message: None,
            log_id: Some(receipt.log_id.to_string()),
        },
        Err(err) => SubmitResponse {
            success: false,
            message: Some(err.to_string()),
            log_id: None,
        },
    }
}

/// Anything that can take a submission: the in-process submitter, or a
/// remote transport in front of it.
#[async_trait]
pub trait SubmissionSink: Send + Sync {
    async fn submit(&self, req: SubmitRequest) -> Result<SubmitReceipt, AttendanceError>;
}

/// Told after every successful persist so views and caches of that user's
/// day can be refreshed.
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    async fn attendance_changed(&self, user_id: &str, day: NaiveDate);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl ChangeNotifier for LogNotifier {
    async fn attendance_changed(&self, user_id: &str, day: NaiveDate) {
        info!(user_id, %day, "attendance changed");
    }
}

#[derive(Clone)]
pub struct AttendanceSubmitter {
    pool: Pool,
    photos: Arc<dyn PhotoStore>,
    sequencer: ActionSequencer,
    notifier: Arc<dyn ChangeNotifier>,
    inline_validator: Option<IdentityValidator>,
}

impl AttendanceSubmitter {
    pub fn new(pool: Pool, photos: Arc<dyn PhotoStore>, sequencer: ActionSequencer) -> Self {
        Self {
            pool,
            photos,
            sequencer,
            notifier: Arc::new(LogNotifier),
            inline_validator: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ChangeNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Try identity validation right after persisting. Without this the
    /// background worker picks the task up.
    pub fn with_inline_validation(mut self, validator: IdentityValidator) -> Self {
        self.inline_validator = Some(validator);
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    #[instrument(skip_all, fields(user_id = %req.user_id, submission_id = %req.submission_id))]
    pub async fn submit(&self, req: SubmitRequest) -> Result<SubmitReceipt, AttendanceError> {
        let user_id = req.user_id.trim();
        if user_id.is_empty() {
            return Err(AttendanceError::MissingInput("userId"));
        }
        let action = req.action.ok_or(AttendanceError::MissingInput("action"))?;
        let photo = req
            .photo
            .filter(|p| !p.is_empty())
            .ok_or(AttendanceError::MissingInput("photo"))?;
        let submission_id = req.submission_id.to_string();

        if let Some(log_id) = self.already_persisted(&submission_id).await? {
            return Ok(SubmitReceipt {
                log_id,
                replayed: true,
            });
        }

        let latest = db::latest_event(&self.pool, user_id)
            .await
            .map_err(AttendanceError::PersistenceFailure)?;
        self.sequencer.decide(
            latest.as_ref().map(|ev| (ev.action, ev.timestamp)),
            action,
            req.captured_at,
        )?;

        let key = photo_key(user_id, req.captured_at, action, photo.extension());
        let photo_ref = self
            .photos
            .put(&key, &photo)
            .await
            .map_err(AttendanceError::PersistenceFailure)?;

        let new_event = NewEvent {
            submission_id: submission_id.clone(),
            user_id: user_id.to_string(),
            action,
            timestamp: req.captured_at,
            photo_ref: photo_ref.clone(),
            location: req.location,
        };
        let expected_latest = latest.as_ref().map(|ev| ev.id);
        let inserted = match db::insert_event_guarded(&self.pool, &new_event, expected_latest).await
        {
            Ok(inserted) => inserted,
            Err(err) => {
                // A concurrent replay of the same submission may have won the unique index.
                if let Some(log_id) = self.already_persisted(&submission_id).await? {
                    return Ok(SubmitReceipt {
                        log_id,
                        replayed: true,
                    });
                }
                self.discard_photo(&photo_ref).await;
                return Err(AttendanceError::PersistenceFailure(err));
            }
        };

        let Some(log_id) = inserted else {
            if let Some(log_id) = self.already_persisted(&submission_id).await? {
                return Ok(SubmitReceipt {
                    log_id,
                    replayed: true,
                });
            }
            self.discard_photo(&photo_ref).await;
            let fresh = db::latest_event(&self.pool, user_id)
                .await
                .map_err(AttendanceError::PersistenceFailure)?;
            let last = self
                .sequencer
                .last_action_on_day(fresh.map(|ev| (ev.action, ev.timestamp)), req.captured_at);
            warn!(%action, ?last, "concurrent submission won; rejecting");
            return Err(AttendanceError::InvalidTransition {
                last,
                requested: action,
            });
        };
        info!(log_id, %action, "attendance event persisted");

        if let Some(validator) = &self.inline_validator {
            match validator.validate_event(log_id).await {
                Ok(outcome) => debug!(log_id, ?outcome, "inline validation finished"),
                Err(err) => warn!(?err, log_id, "inline validation failed; worker will retry"),
            }
        }

        self.notifier
            .attendance_changed(user_id, self.sequencer.day_of(req.captured_at))
            .await;

        Ok(SubmitReceipt {
            log_id,
            replayed: false,
        })
    }

    /// Best effort: drop a photo no event ended up pointing at. A stored
    /// event with the same reference keeps it.
    async fn discard_photo(&self, photo_ref: &str) {
        match db::photo_ref_in_use(&self.pool, photo_ref).await {
            Ok(false) => {
                if let Err(err) = self.photos.delete(photo_ref).await {
                    warn!(?err, photo_ref, "failed to remove orphaned photo");
                }
            }
            Ok(true) => {}
            Err(err) => warn!(?err, photo_ref, "could not check photo reference; keeping it"),
        }
    }

    async fn already_persisted(&self, submission_id: &str) -> Result<Option<i64>, AttendanceError> {
        let existing = db::event_id_for_submission(&self.pool, submission_id)
            .await
            .map_err(AttendanceError::PersistenceFailure)?;
        if let Some(log_id) = existing {
            info!(log_id, "submission already persisted");
        }
        Ok(existing)
    }
}

#[async_trait]
impl SubmissionSink for AttendanceSubmitter {
    async fn submit(&self, req: SubmitRequest) -> Result<SubmitReceipt, AttendanceError> {
        AttendanceSubmitter::submit(self, req).await
    }
}
