//! Supervisor corrections. Kept apart from the submission path: nothing in
//! `submitter` or `sync_queue` calls into this module.
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::db::{self, Pool};
use crate::model::AttendanceEvent;

/// Identity of the privileged actor applying an override. Authorization
/// happens before a value of this type is constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorId(String);

impl SupervisorId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(anyhow!("supervisor id must be non-empty"));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Force a full match on `event_id`, optionally correcting its capture
/// timestamp. Applies whatever the current validation state is.
#[instrument(skip_all, fields(event_id = event_id, supervisor = %supervisor.as_str()))]
pub async fn override_validation(
    pool: &Pool,
    event_id: i64,
    supervisor: &SupervisorId,
    corrected_timestamp: Option<DateTime<Utc>>,
) -> Result<AttendanceEvent> {
    let at = Utc::now();
    if !db::apply_override(pool, event_id, supervisor.as_str(), at, corrected_timestamp).await? {
        return Err(anyhow!("attendance event {} not found", event_id));
    }
    let event = db::get_event(pool, event_id)
        .await?
        .ok_or_else(|| anyhow!("attendance event {} vanished after override", event_id))?;
    info!(
        event_id,
        corrected = corrected_timestamp.is_some(),
        "validation overridden"
    );
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervisor_id_must_be_present() {
        assert!(SupervisorId::new("  ").is_err());
        assert_eq!(SupervisorId::new("sup-1").unwrap().as_str(), "sup-1");
    }
}
