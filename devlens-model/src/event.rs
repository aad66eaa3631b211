use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Strongly typed event id. UUIDv7 so ids sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        EventId(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Top-level grouping of events. The payload subschema is keyed off this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    File,
    Git,
    Test,
    Build,
    Process,
    Stage,
    Ai,
    Api,
    System,
    Activity,
}

impl EventCategory {
    pub const ALL: [EventCategory; 10] = [
        EventCategory::File,
        EventCategory::Git,
        EventCategory::Test,
        EventCategory::Build,
        EventCategory::Process,
        EventCategory::Stage,
        EventCategory::Ai,
        EventCategory::Api,
        EventCategory::System,
        EventCategory::Activity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::File => "file",
            EventCategory::Git => "git",
            EventCategory::Test => "test",
            EventCategory::Build => "build",
            EventCategory::Process => "process",
            EventCategory::Stage => "stage",
            EventCategory::Ai => "ai",
            EventCategory::Api => "api",
            EventCategory::System => "system",
            EventCategory::Activity => "activity",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity ladder, ordered from least to most urgent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
}

impl EventSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSeverity::Debug => "debug",
            EventSeverity::Info => "info",
            EventSeverity::Notice => "notice",
            EventSeverity::Warning => "warning",
            EventSeverity::Error => "error",
            EventSeverity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(EventSeverity::Debug),
            "info" => Some(EventSeverity::Info),
            "notice" => Some(EventSeverity::Notice),
            "warning" => Some(EventSeverity::Warning),
            "error" => Some(EventSeverity::Error),
            "critical" => Some(EventSeverity::Critical),
            _ => None,
        }
    }

    /// High-urgency events get routed to the priority queue.
    pub fn is_high(&self) -> bool {
        matches!(self, EventSeverity::Error | EventSeverity::Critical)
    }
}

impl fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional correlation context attached to an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<EventId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Producer-estimated impact, 0..=100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impact: Option<u8>,
}

impl EventMetadata {
    pub fn is_empty(&self) -> bool {
        self.correlation_id.is_none()
            && self.parent_event_id.is_none()
            && self.actor.is_none()
            && self.branch.is_none()
            && self.impact.is_none()
    }
}

/// The atomic record the whole system moves.
///
/// Wire shape (also the persisted JSON column):
/// `{id, type, category, severity, timestamp, source, data, metadata?}`
/// with `timestamp` as integer milliseconds since the epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub id: EventId,
    /// Free-form dotted type string, e.g. `file:changed`, `git:commit`.
    #[serde(rename = "type")]
    pub event_type: String,
    pub category: EventCategory,
    pub severity: EventSeverity,
    #[serde(with = "ts_milliseconds", default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Producer name, e.g. `file-monitor`.
    pub source: String,
    /// Opaque structured payload; validated against the category subschema
    /// at the bus boundary and round-tripped unchanged by the store.
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventMetadata>,
}

impl Event {
    pub fn builder(
        event_type: impl Into<String>,
        category: EventCategory,
    ) -> EventBuilder {
        EventBuilder::new(event_type, category)
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        self.metadata.as_ref().and_then(|m| m.correlation_id)
    }

    pub fn parent_event_id(&self) -> Option<EventId> {
        self.metadata.as_ref().and_then(|m| m.parent_event_id)
    }

    /// Approximate in-memory/on-wire cost used for queue byte accounting.
    pub fn approx_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

/// Builder for [`Event`]. Stamps id and timestamp at build time so callers
/// that don't care get sensible defaults.
#[derive(Debug)]
pub struct EventBuilder {
    event_type: String,
    category: EventCategory,
    severity: EventSeverity,
    timestamp: Option<DateTime<Utc>>,
    source: String,
    data: serde_json::Value,
    metadata: Option<EventMetadata>,
}

impl EventBuilder {
    pub fn new(event_type: impl Into<String>, category: EventCategory) -> Self {
        Self {
            event_type: event_type.into(),
            category,
            severity: EventSeverity::Info,
            timestamp: None,
            source: String::new(),
            data: serde_json::Value::Object(Default::default()),
            metadata: None,
        }
    }

    pub fn severity(mut self, severity: EventSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = Some(ts);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn correlation_id(mut self, id: Uuid) -> Self {
        self.metadata
            .get_or_insert_with(EventMetadata::default)
            .correlation_id = Some(id);
        self
    }

    pub fn build(self) -> Event {
        Event {
            id: EventId::new(),
            event_type: self.event_type,
            category: self.category,
            severity: self.severity,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            source: self.source,
            data: self.data,
            metadata: self.metadata,
        }
    }
}

/// Serialize `DateTime<Utc>` as integer milliseconds since the epoch.
pub mod ts_milliseconds {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        ts: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(ts.timestamp_millis())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let ms = i64::deserialize(deserializer)?;
        Utc.timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| serde::de::Error::custom("timestamp out of range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_round_trips_with_integer_timestamp() {
        let event = Event::builder("git:commit", EventCategory::Git)
            .severity(EventSeverity::Notice)
            .source("git-monitor")
            .data(serde_json::json!({"action": "commit", "hash": "a1b2"}))
            .build();

        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "git:commit");
        assert_eq!(json["category"], "git");
        assert!(json["timestamp"].is_i64(), "timestamp must be integer ms");

        let back: Event = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, event);
    }

    #[test]
    fn missing_id_and_timestamp_are_assigned_on_deserialize() {
        let raw = serde_json::json!({
            "type": "ai:suggestion",
            "category": "ai",
            "severity": "info",
            "source": "copilot-bridge",
            "data": {},
        });
        let event: Event = serde_json::from_value(raw).expect("deserialize");
        assert_ne!(event.id.0, Uuid::nil());
        assert!(event.timestamp <= Utc::now());
    }

    #[test]
    fn event_ids_sort_by_creation_order() {
        let a = EventId::new();
        let b = EventId::new();
        assert!(a < b);
    }

    #[test]
    fn severity_ordering_matches_urgency() {
        assert!(EventSeverity::Critical > EventSeverity::Error);
        assert!(EventSeverity::Error > EventSeverity::Info);
        assert!(EventSeverity::Critical.is_high());
        assert!(!EventSeverity::Notice.is_high());
    }
}
