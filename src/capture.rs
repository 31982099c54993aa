//! Client capture pipeline: site check, sequencing pre-check, location
//! gate, photo, then either a direct submission or the offline queue.
//! While anything is still queued a new capture goes behind it, so the
//! server always sees captures in the order they were taken.
use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::db::{self, Pool};
use crate::error::{AttendanceError, DeviceKind};
use crate::geofence::{self, LocationFailure};
use crate::model::{ClockAction, Coordinate, WorkSite};
use crate::photo::ImagePayload;
use crate::sequencer::ActionSequencer;
use crate::submitter::{SubmissionSink, SubmitReceipt, SubmitRequest};
use crate::sync_queue::{store, NetworkStatus, SyncQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraFailure {
    PermissionDenied,
    Unavailable,
}

/// Camera and geolocation of the device. Both are one-shot: a failure is
/// reported as is and never retried here.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    async fn locate(&self) -> Result<Coordinate, LocationFailure>;
    async fn take_photo(&self) -> Result<ImagePayload, CameraFailure>;
}

/// What the client knew about the user when the capture screen opened.
#[derive(Debug, Clone)]
pub struct CaptureContext {
    pub user_id: String,
    pub work_site: Option<WorkSite>,
    /// Most recent synced event, as `(action, captured_at)`.
    pub last_event: Option<(ClockAction, DateTime<Utc>)>,
}

impl CaptureContext {
    /// Read the user's site assignment and latest event from the store.
    pub async fn load(pool: &Pool, user_id: &str) -> AnyResult<Self> {
        let work_site = db::work_site_for_user(pool, user_id).await?;
        let last_event = db::latest_event(pool, user_id)
            .await?
            .map(|ev| (ev.action, ev.timestamp));
        Ok(Self {
            user_id: user_id.to_string(),
            work_site,
            last_event,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Submitted(SubmitReceipt),
    /// Went through the queue behind earlier captures and was delivered in
    /// the same flush.
    Synced { key: i64 },
    /// Saved on the device; the sync queue will deliver it.
    Queued { key: i64, cause: QueueCause },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueCause {
    Offline,
    /// Earlier captures were still waiting to sync.
    BehindQueue,
    SubmitFailed(String),
}

impl CaptureOutcome {
    pub fn message(&self) -> String {
        match self {
            CaptureOutcome::Submitted(_) | CaptureOutcome::Synced { .. } => {
                "attendance registered".to_string()
            }
            CaptureOutcome::Queued {
                cause: QueueCause::Offline,
                ..
            } => "saved, will sync when you are back online".to_string(),
            CaptureOutcome::Queued {
                cause: QueueCause::BehindQueue,
                ..
            } => "saved, will sync after your earlier captures".to_string(),
            CaptureOutcome::Queued {
                cause: QueueCause::SubmitFailed(reason),
                ..
            } => format!("could not save now ({}); kept on this device and will retry", reason),
        }
    }
}

#[derive(Clone)]
pub struct CaptureClient {
    queue: SyncQueue,
    sink: Arc<dyn SubmissionSink>,
    network: NetworkStatus,
    sequencer: ActionSequencer,
}

impl CaptureClient {
    pub fn new(
        queue: SyncQueue,
        sink: Arc<dyn SubmissionSink>,
        network: NetworkStatus,
        sequencer: ActionSequencer,
    ) -> Self {
        Self {
            queue,
            sink,
            network,
            sequencer,
        }
    }

    /// Register `action` for the user in `ctx`. Gate failures are returned
    /// as errors and nothing is queued for them.
    #[instrument(skip_all, fields(user_id = %ctx.user_id, action = %action))]
    pub async fn punch(
        &self,
        ctx: &CaptureContext,
        action: ClockAction,
        device: &dyn CaptureDevice,
    ) -> Result<CaptureOutcome, AttendanceError> {
        let site = ctx.work_site.as_ref().ok_or(AttendanceError::NoSiteAssigned)?;
        let captured_at = Utc::now();

        let last = self.last_known(ctx).await?;
        self.sequencer.decide(last, action, captured_at)?;

        let admitted = geofence::check(Some(site), device.locate().await)?;
        let photo = device.take_photo().await.map_err(|failure| match failure {
            CameraFailure::PermissionDenied => AttendanceError::PermissionDenied(DeviceKind::Camera),
            CameraFailure::Unavailable => AttendanceError::MissingInput("photo"),
        })?;

        let req = SubmitRequest {
            submission_id: Uuid::new_v4(),
            user_id: ctx.user_id.clone(),
            action: Some(action),
            photo: Some(photo),
            location: Some(admitted.position),
            captured_at,
        };

        if !self.network.is_online() {
            let key = self.enqueue(&req).await?;
            return Ok(CaptureOutcome::Queued {
                key,
                cause: QueueCause::Offline,
            });
        }

        let pending = self
            .queue
            .pending()
            .await
            .map_err(AttendanceError::PersistenceFailure)?;
        if pending > 0 {
            return self.submit_behind_queue(&req, pending).await;
        }

        match self.sink.submit(req.clone()).await {
            Ok(receipt) => {
                info!(log_id = receipt.log_id, "attendance submitted");
                Ok(CaptureOutcome::Submitted(receipt))
            }
            Err(err) if err.is_retryable() => {
                warn!(error = %err, "submission failed; queueing");
                let key = self.enqueue(&req).await?;
                Ok(CaptureOutcome::Queued {
                    key,
                    cause: QueueCause::SubmitFailed(err.to_string()),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Append `req` after the `pending` queued items and flush. A flush that
    /// is skipped or stops early leaves the capture queued.
    async fn submit_behind_queue(
        &self,
        req: &SubmitRequest,
        pending: i64,
    ) -> Result<CaptureOutcome, AttendanceError> {
        let key = self.enqueue(req).await?;
        debug!(key, pending, "earlier captures still queued; flushing in order");
        match self.queue.flush().await {
            Ok(report) if report.persisted.contains(&key) => Ok(CaptureOutcome::Synced { key }),
            Ok(report) => {
                if let Some(failure) = &report.failure {
                    warn!(key, stopped_at = ?report.stopped_at, failure = %failure, "capture left queued");
                }
                Ok(CaptureOutcome::Queued {
                    key,
                    cause: QueueCause::BehindQueue,
                })
            }
            Err(err) => {
                warn!(?err, key, "flush after capture failed");
                Ok(CaptureOutcome::Queued {
                    key,
                    cause: QueueCause::BehindQueue,
                })
            }
        }
    }

    /// Captures still waiting in the queue come after anything synced.
    async fn last_known(
        &self,
        ctx: &CaptureContext,
    ) -> Result<Option<(ClockAction, DateTime<Utc>)>, AttendanceError> {
        let pending = store::last_for_user(self.queue.pool(), &ctx.user_id)
            .await
            .map_err(AttendanceError::PersistenceFailure)?;
        Ok(pending
            .map(|item| (item.action, item.captured_at))
            .or(ctx.last_event))
    }

    async fn enqueue(&self, req: &SubmitRequest) -> Result<i64, AttendanceError> {
        self.queue
            .enqueue(req)
            .await
            .map_err(AttendanceError::PersistenceFailure)
    }
}
