//! Error taxonomy for the attendance pipeline.
use crate::model::ClockAction;
use std::fmt;
use thiserror::Error;

/// Device capability that needs user permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Camera,
    Location,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Camera => f.write_str("camera"),
            DeviceKind::Location => f.write_str("location"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AttendanceError {
    #[error("missing required input: {0}")]
    MissingInput(&'static str),

    #[error("you are not assigned to a site; contact your supervisor")]
    NoSiteAssigned,

    #[error("{requested} is not allowed {}", describe_last(.last))]
    InvalidTransition {
        last: Option<ClockAction>,
        requested: ClockAction,
    },

    #[error("you are {distance_m} m from your site (allowed radius {radius_m} m)")]
    GeofenceViolation { distance_m: u64, radius_m: f64 },

    #[error("{0} permission denied; enable it in your browser settings and try again")]
    PermissionDenied(DeviceKind),

    #[error("could not determine your location; please try again")]
    LocationUnavailable,

    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("failed to save attendance: {0:#}")]
    PersistenceFailure(anyhow::Error),
}

fn describe_last(last: &Option<ClockAction>) -> String {
    match last {
        Some(action) => format!("after {}", action),
        None => "before clock_in".to_string(),
    }
}

impl AttendanceError {
    /// Whether the failed submission may be buffered and replayed later.
    /// Everything else is surfaced to the user and never queued.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AttendanceError::NetworkUnavailable(_) | AttendanceError::PersistenceFailure(_)
        )
    }
}

impl From<sqlx::Error> for AttendanceError {
    fn from(err: sqlx::Error) -> Self {
        AttendanceError::PersistenceFailure(err.into())
    }
}
