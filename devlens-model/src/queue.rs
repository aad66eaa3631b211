use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{Event, ts_milliseconds};

/// Named queues. Four reserved queues always exist; the rest are
/// operator-defined.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    Default,
    Priority,
    Batch,
    Failed,
    #[serde(untagged)]
    Custom(String),
}

impl QueueName {
    pub const RESERVED: [QueueName; 4] = [
        QueueName::Default,
        QueueName::Priority,
        QueueName::Batch,
        QueueName::Failed,
    ];

    pub fn as_str(&self) -> &str {
        match self {
            QueueName::Default => "default",
            QueueName::Priority => "priority",
            QueueName::Batch => "batch",
            QueueName::Failed => "failed",
            QueueName::Custom(name) => name.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "default" => QueueName::Default,
            "priority" => QueueName::Priority,
            "batch" => QueueName::Batch,
            "failed" => QueueName::Failed,
            other => QueueName::Custom(other.to_string()),
        }
    }

    pub fn is_reserved(&self) -> bool {
        !matches!(self, QueueName::Custom(_))
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event while it sits in a queue. Owned by exactly one queue at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub event: Event,
    #[serde(with = "ts_milliseconds")]
    pub enqueued_at: DateTime<Utc>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueueEntry {
    pub fn new(event: Event) -> Self {
        Self {
            event,
            enqueued_at: Utc::now(),
            attempts: 0,
            next_attempt_at: None,
            last_error: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }
}
