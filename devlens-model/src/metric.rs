use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::ts_milliseconds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Productivity,
    Quality,
    Performance,
    Collaboration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricUnit {
    Count,
    Percent,
    Milliseconds,
    LinesPerHour,
    PerDay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricAggregation {
    Sum,
    Average,
    Latest,
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricDefinition {
    /// Stable identifier, e.g. `productivity.commits_per_day`.
    pub id: String,
    pub name: String,
    pub kind: MetricKind,
    pub unit: MetricUnit,
    pub aggregation: MetricAggregation,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    #[serde(with = "ts_milliseconds")]
    pub ts: DateTime<Utc>,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Up,
    Down,
    Flat,
}

/// Rolling summary recomputed on every insert.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSummary {
    pub current: f64,
    pub previous: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub median: f64,
    pub trend: TrendDirection,
}

impl Default for MetricSummary {
    fn default() -> Self {
        Self {
            current: 0.0,
            previous: 0.0,
            min: 0.0,
            max: 0.0,
            avg: 0.0,
            median: 0.0,
            trend: TrendDirection::Flat,
        }
    }
}
