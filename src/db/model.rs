//! Row shapes used by repositories.
//!
//! Keep these structs focused on the data written or returned by queries.
//! Business rules live in `sequencer`, `submitter` and `validation`.

use chrono::{DateTime, Utc};

use crate::model::{ClockAction, Coordinate};

/// Event about to be inserted; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub submission_id: String,
    pub user_id: String,
    pub action: ClockAction,
    pub timestamp: DateTime<Utc>,
    pub photo_ref: String,
    pub location: Option<Coordinate>,
}

/// Pending identity validation for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationTask {
    pub id: i64,
    pub event_id: i64,
    pub attempt: i32,
}
