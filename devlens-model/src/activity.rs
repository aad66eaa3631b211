use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::{EventCategory, EventId, EventSeverity, ts_milliseconds};

/// Human-readable derivation of an event, kept for the activity log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub id: Uuid,
    pub event_id: EventId,
    pub category: EventCategory,
    pub severity: EventSeverity,
    /// One-line summary, e.g. `Git commit: feat(auth): add login`.
    pub summary: String,
    #[serde(with = "ts_milliseconds")]
    pub at: DateTime<Utc>,
}
