//! Row <-> model mapping for the SQLite store.

use chrono::{DateTime, TimeZone, Utc};
use devlens_model::{
    ActivityEntry, Event, EventCategory, EventId, EventSeverity, Stage,
    StageTransition,
};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use crate::error::{Result, TelemetryError};

pub(crate) fn ts_from_ms(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
        TelemetryError::Internal(format!("timestamp out of range: {ms}"))
    })
}

pub(crate) fn event_from_row(row: &SqliteRow) -> Result<Event> {
    let id: String = row.try_get("id")?;
    let id = Uuid::parse_str(&id)
        .map_err(|e| TelemetryError::Internal(format!("bad event id: {e}")))?;
    let category: String = row.try_get("category")?;
    let category = EventCategory::parse(&category).ok_or_else(|| {
        TelemetryError::Internal(format!("unknown category in store: {category}"))
    })?;
    let severity: String = row.try_get("severity")?;
    let severity = EventSeverity::parse(&severity).ok_or_else(|| {
        TelemetryError::Internal(format!("unknown severity in store: {severity}"))
    })?;
    let data: String = row.try_get("data")?;
    let metadata: Option<String> = row.try_get("metadata")?;

    Ok(Event {
        id: EventId(id),
        event_type: row.try_get("type")?,
        category,
        severity,
        timestamp: ts_from_ms(row.try_get("timestamp")?)?,
        source: row.try_get("source")?,
        data: serde_json::from_str(&data)?,
        metadata: metadata
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?,
    })
}

pub(crate) fn activity_from_row(row: &SqliteRow) -> Result<ActivityEntry> {
    let id: String = row.try_get("id")?;
    let event_id: String = row.try_get("event_id")?;
    let category: String = row.try_get("category")?;
    let severity: String = row.try_get("severity")?;
    Ok(ActivityEntry {
        id: Uuid::parse_str(&id)
            .map_err(|e| TelemetryError::Internal(format!("bad activity id: {e}")))?,
        event_id: EventId(Uuid::parse_str(&event_id).map_err(|e| {
            TelemetryError::Internal(format!("bad activity event id: {e}"))
        })?),
        category: EventCategory::parse(&category).ok_or_else(|| {
            TelemetryError::Internal(format!("unknown category: {category}"))
        })?,
        severity: EventSeverity::parse(&severity).ok_or_else(|| {
            TelemetryError::Internal(format!("unknown severity: {severity}"))
        })?,
        summary: row.try_get("summary")?,
        at: ts_from_ms(row.try_get("timestamp")?)?,
    })
}

pub(crate) fn transition_from_row(row: &SqliteRow) -> Result<StageTransition> {
    let from: Option<String> = row.try_get("from_stage")?;
    let to: String = row.try_get("to_stage")?;
    Ok(StageTransition {
        from: from.as_deref().and_then(Stage::parse),
        to: Stage::parse(&to).ok_or_else(|| {
            TelemetryError::Internal(format!("unknown stage in store: {to}"))
        })?,
        confidence: row.try_get("confidence")?,
        reason: row.try_get("reason")?,
        at: ts_from_ms(row.try_get("timestamp")?)?,
    })
}
