use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One clock action a collaborator can register during a shift.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ClockAction {
    ClockIn,
    BreakStart,
    BreakEnd,
    ClockOut,
}

impl ClockAction {
    pub const ALL: [ClockAction; 4] = [
        ClockAction::ClockIn,
        ClockAction::BreakStart,
        ClockAction::BreakEnd,
        ClockAction::ClockOut,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClockAction::ClockIn => "clock_in",
            ClockAction::BreakStart => "break_start",
            ClockAction::BreakEnd => "break_end",
            ClockAction::ClockOut => "clock_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clock_in" => Some(ClockAction::ClockIn),
            "break_start" => Some(ClockAction::BreakStart),
            "break_end" => Some(ClockAction::BreakEnd),
            "clock_out" => Some(ClockAction::ClockOut),
            _ => None,
        }
    }
}

impl fmt::Display for ClockAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// WGS-84 position in decimal degrees.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Finite and within [-90, 90] x [-180, 180].
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Administratively defined site with a circular geofence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkSite {
    pub id: String,
    pub center_latitude: f64,
    pub center_longitude: f64,
    pub radius_meters: f64,
}

impl WorkSite {
    pub fn center(&self) -> Coordinate {
        Coordinate::new(self.center_latitude, self.center_longitude)
    }
}

/// Result returned by the identity comparison capability.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub is_match: bool,
    pub confidence: f64,
    pub reason: String,
}

/// Identity validation state of a stored event.
///
/// `Unvalidated` may move to `Validated` once. `Overridden` can be applied
/// at any time by a supervisor and always counts as a full match.
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Unvalidated,
    Validated {
        is_match: bool,
        confidence: f64,
        reason: String,
    },
    Overridden {
        by: String,
        at: DateTime<Utc>,
    },
}

impl Validation {
    pub fn state_str(&self) -> &'static str {
        match self {
            Validation::Unvalidated => "unvalidated",
            Validation::Validated { .. } => "validated",
            Validation::Overridden { .. } => "overridden",
        }
    }

    pub fn is_match(&self) -> Option<bool> {
        match self {
            Validation::Unvalidated => None,
            Validation::Validated { is_match, .. } => Some(*is_match),
            Validation::Overridden { .. } => Some(true),
        }
    }

    pub fn confidence(&self) -> Option<f64> {
        match self {
            Validation::Unvalidated => None,
            Validation::Validated { confidence, .. } => Some(*confidence),
            Validation::Overridden { .. } => Some(1.0),
        }
    }
}

impl From<Verdict> for Validation {
    fn from(v: Verdict) -> Self {
        Validation::Validated {
            is_match: v.is_match,
            confidence: v.confidence,
            reason: v.reason,
        }
    }
}

/// One persisted clock action.
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceEvent {
    pub id: i64,
    pub submission_id: String,
    pub user_id: String,
    pub action: ClockAction,
    /// Instant the action was captured on the device, not when it synced.
    pub timestamp: DateTime<Utc>,
    pub photo_ref: String,
    pub location: Option<Coordinate>,
    pub validation: Validation,
}

/// Document-store shape of an event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: String,
    pub user_id: String,
    pub action: ClockAction,
    pub timestamp: String,
    pub photo_url: String,
    pub location: Option<Coordinate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRecord {
    pub is_validated: bool,
    pub confidence: f64,
    pub reason: String,
}

impl AttendanceEvent {
    pub fn to_record(&self) -> EventRecord {
        let validation = match &self.validation {
            Validation::Unvalidated => None,
            Validation::Validated {
                is_match,
                confidence,
                reason,
            } => Some(ValidationRecord {
                is_validated: *is_match,
                confidence: *confidence,
                reason: reason.clone(),
            }),
            Validation::Overridden { by, at } => Some(ValidationRecord {
                is_validated: true,
                confidence: 1.0,
                reason: format!("overridden by {} at {}", by, format_timestamp(at)),
            }),
        };
        EventRecord {
            id: self.id.to_string(),
            user_id: self.user_id.clone(),
            action: self.action,
            timestamp: format_timestamp(&self.timestamp),
            photo_url: self.photo_ref.clone(),
            location: self.location,
            validation,
        }
    }
}

/// Reply shape of the submission operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_id: Option<String>,
}

/// Canonical textual form used for every stored timestamp. Fixed width so
/// lexical order matches chronological order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
