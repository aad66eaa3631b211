use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::ts_milliseconds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BottleneckKind {
    Threshold,
    TrendAnomaly,
    StuckStage,
    Hotspot,
    QueueBacklog,
    SubscriberErrors,
}

impl BottleneckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BottleneckKind::Threshold => "threshold",
            BottleneckKind::TrendAnomaly => "trend_anomaly",
            BottleneckKind::StuckStage => "stuck_stage",
            BottleneckKind::Hotspot => "hotspot",
            BottleneckKind::QueueBacklog => "queue_backlog",
            BottleneckKind::SubscriberErrors => "subscriber_errors",
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BottleneckSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// A detected pattern of inefficiency with impact and suggested actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bottleneck {
    pub id: Uuid,
    pub kind: BottleneckKind,
    pub severity: BottleneckSeverity,
    pub title: String,
    /// Where it was observed: a file, a stage, a queue, a metric id.
    pub location: String,
    /// 0..=100.
    pub impact: f64,
    /// 0.0..=1.0.
    pub confidence: f64,
    /// How many times this was re-detected while active.
    pub frequency: u64,
    #[serde(with = "ts_milliseconds")]
    pub first_detected_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub last_occurred_at: DateTime<Utc>,
    pub suggested_actions: Vec<String>,
}
