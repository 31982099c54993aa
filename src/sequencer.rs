//! Per-user, per-day clock action state machine.
use crate::error::AttendanceError;
use crate::model::ClockAction;
use chrono::{DateTime, FixedOffset, Local, NaiveDate, Utc};

/// Where a calendar day starts: local midnight of the host, or of a fixed
/// UTC offset when one is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayBoundary {
    Local,
    Fixed(FixedOffset),
}

impl DayBoundary {
    pub fn from_offset_minutes(minutes: Option<i32>) -> Self {
        minutes
            .and_then(|m| FixedOffset::east_opt(m * 60))
            .map(DayBoundary::Fixed)
            .unwrap_or(DayBoundary::Local)
    }

    pub fn day_of(&self, ts: DateTime<Utc>) -> NaiveDate {
        match self {
            DayBoundary::Local => ts.with_timezone(&Local).date_naive(),
            DayBoundary::Fixed(offset) => ts.with_timezone(offset).date_naive(),
        }
    }
}

/// Actions that may legally follow `last`.
pub fn legal_next(last: Option<ClockAction>) -> &'static [ClockAction] {
    match last {
        None | Some(ClockAction::ClockOut) => &[ClockAction::ClockIn],
        Some(ClockAction::ClockIn) | Some(ClockAction::BreakEnd) => {
            &[ClockAction::BreakStart, ClockAction::ClockOut]
        }
        Some(ClockAction::BreakStart) => &[ClockAction::BreakEnd],
    }
}

pub fn check_transition(
    last: Option<ClockAction>,
    requested: ClockAction,
) -> Result<(), AttendanceError> {
    if legal_next(last).contains(&requested) {
        Ok(())
    } else {
        Err(AttendanceError::InvalidTransition { last, requested })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ActionSequencer {
    boundary: DayBoundary,
}

impl ActionSequencer {
    pub fn new(boundary: DayBoundary) -> Self {
        Self { boundary }
    }

    pub fn day_of(&self, ts: DateTime<Utc>) -> NaiveDate {
        self.boundary.day_of(ts)
    }

    /// The action of `latest` if it was captured on the same calendar day
    /// as `at`; events from other days do not count.
    pub fn last_action_on_day(
        &self,
        latest: Option<(ClockAction, DateTime<Utc>)>,
        at: DateTime<Utc>,
    ) -> Option<ClockAction> {
        let (action, ts) = latest?;
        (self.boundary.day_of(ts) == self.boundary.day_of(at)).then_some(action)
    }

    /// Decide whether `requested`, captured at `at`, may follow `latest`.
    pub fn decide(
        &self,
        latest: Option<(ClockAction, DateTime<Utc>)>,
        requested: ClockAction,
        at: DateTime<Utc>,
    ) -> Result<(), AttendanceError> {
        check_transition(self.last_action_on_day(latest, at), requested)
    }
}
