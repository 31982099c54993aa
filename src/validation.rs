//! Identity validation as a post-write follow-up.
//!
//! Every persisted event gets a validation task in the same transaction.
//! Tasks are worked one at a time; a failing comparison never touches the
//! event itself, it only reschedules the task with capped exponential
//! backoff. After `max_attempts` the task is dropped and the event stays
//! `Unvalidated` for manual review.
use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::db::{self, Pool, ValidationTask};
use crate::identity::IdentityService;
use crate::model::{AttendanceEvent, Validation, Verdict};
use crate::photo::PhotoStore;

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Recorded(Verdict),
    /// Event gone, already validated, or overridden.
    AlreadySettled,
    /// Nothing to compare against; left for a supervisor.
    ManualReview(&'static str),
    /// Another run holds the task.
    InProgress,
    Retrying { attempt: i32 },
    GaveUp { attempts: i32 },
}

#[derive(Clone)]
pub struct IdentityValidator {
    pool: Pool,
    photos: Arc<dyn PhotoStore>,
    identity: Arc<dyn IdentityService>,
    timeout: Duration,
    max_attempts: u32,
    max_backoff_secs: i64,
}

impl IdentityValidator {
    pub fn new(
        pool: Pool,
        photos: Arc<dyn PhotoStore>,
        identity: Arc<dyn IdentityService>,
        timeout: Duration,
        max_attempts: u32,
        max_backoff_secs: i64,
    ) -> Self {
        Self {
            pool,
            photos,
            identity,
            timeout,
            max_attempts,
            max_backoff_secs,
        }
    }

    pub fn from_config(
        cfg: &Config,
        pool: Pool,
        photos: Arc<dyn PhotoStore>,
        identity: Arc<dyn IdentityService>,
    ) -> Self {
        Self::new(
            pool,
            photos,
            identity,
            cfg.identity_timeout(),
            cfg.identity.max_attempts,
            cfg.app.max_backoff_seconds as i64,
        )
    }

    /// Work the next due task, if any. Returns whether a task was handled.
    #[instrument(skip_all)]
    pub async fn process_next_task(&self) -> Result<bool> {
        let Some(task) = db::next_due_validation(&self.pool).await? else {
            return Ok(false);
        };
        let outcome = self.run_task(task).await?;
        Ok(outcome != ValidationOutcome::InProgress)
    }

    /// Validate one event right away, regardless of its task's due time.
    #[instrument(skip(self))]
    pub async fn validate_event(&self, event_id: i64) -> Result<ValidationOutcome> {
        match db::validation_task_for_event(&self.pool, event_id).await? {
            Some(task) => self.run_task(task).await,
            None => Ok(ValidationOutcome::AlreadySettled),
        }
    }

    async fn run_task(&self, task: ValidationTask) -> Result<ValidationOutcome> {
        if !db::claim_validation_task(&self.pool, task.id, self.lease_secs()).await? {
            debug!(task_id = task.id, event_id = task.event_id, "task already claimed");
            return Ok(ValidationOutcome::InProgress);
        }
        let event = match db::get_event(&self.pool, task.event_id).await? {
            Some(ev) if ev.validation == Validation::Unvalidated => ev,
            _ => {
                db::delete_validation_task(&self.pool, task.id).await?;
                return Ok(ValidationOutcome::AlreadySettled);
            }
        };

        let Some(reference) = db::reference_photo_for_user(&self.pool, &event.user_id).await?
        else {
            warn!(
                event_id = event.id,
                user_id = %event.user_id,
                "no reference photo; event left for manual review"
            );
            db::delete_validation_task(&self.pool, task.id).await?;
            return Ok(ValidationOutcome::ManualReview("no reference photo"));
        };

        match self.compare(&reference, &event).await {
            Ok(verdict) => {
                if db::record_verdict(&self.pool, event.id, &verdict).await? {
                    info!(
                        event_id = event.id,
                        is_match = verdict.is_match,
                        confidence = verdict.confidence,
                        "identity verdict recorded"
                    );
                }
                db::delete_validation_task(&self.pool, task.id).await?;
                Ok(ValidationOutcome::Recorded(verdict))
            }
            Err(err) => {
                let attempts = task.attempt + 1;
                if attempts as u32 >= self.max_attempts {
                    warn!(
                        ?err,
                        event_id = event.id,
                        attempts,
                        "identity validation abandoned; event left for manual review"
                    );
                    db::delete_validation_task(&self.pool, task.id).await?;
                    return Ok(ValidationOutcome::GaveUp { attempts });
                }
                warn!(?err, event_id = event.id, attempts, "identity validation failed; backoff");
                db::backoff_validation_task(
                    &self.pool,
                    task.id,
                    task.attempt,
                    self.max_backoff_secs,
                    &format!("{:#}", err),
                )
                .await?;
                Ok(ValidationOutcome::Retrying { attempt: attempts })
            }
        }
    }

    /// Long enough to cover both photo reads and the timed comparison.
    fn lease_secs(&self) -> i64 {
        self.timeout.as_secs() as i64 + 30
    }

    async fn compare(&self, reference: &str, event: &AttendanceEvent) -> Result<Verdict> {
        let reference = self.photos.get(reference).await?;
        let submitted = self.photos.get(&event.photo_ref).await?;
        tokio::time::timeout(self.timeout, self.identity.compare(&reference, &submitted))
            .await
            .map_err(|_| anyhow!("identity comparison timed out after {:?}", self.timeout))?
    }
}
