//! Wire-visible structures returned by the tool facade. Field names are
//! the external contract; changes here are breaking.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use devlens_model::{
    ActivityEntry, Bottleneck, BottleneckSeverity, CodingSubStage,
    EventCategory, EventSeverity, Methodology, MethodologyScore, Stage,
    StageTransition, TrendDirection,
};
use serde::{Deserialize, Serialize};

use crate::analyzer::AiUsageSnapshot;
use crate::analyzer::methodology::MethodologyTrend;
use crate::error::TelemetryError;
use crate::monitor::MonitorStatus;
use crate::queue::QueueStatsSnapshot;

/// Query window accepted by the reporting operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeRange {
    #[serde(rename = "1h")]
    Hour,
    #[serde(rename = "1d")]
    Day,
    #[serde(rename = "1w")]
    Week,
    #[serde(rename = "1m")]
    Month,
}

impl TimeRange {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1h" => Some(TimeRange::Hour),
            "1d" => Some(TimeRange::Day),
            "1w" => Some(TimeRange::Week),
            "1m" => Some(TimeRange::Month),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeRange::Hour => "1h",
            TimeRange::Day => "1d",
            TimeRange::Week => "1w",
            TimeRange::Month => "1m",
        }
    }

    pub fn duration(&self) -> ChronoDuration {
        match self {
            TimeRange::Hour => ChronoDuration::hours(1),
            TimeRange::Day => ChronoDuration::days(1),
            TimeRange::Week => ChronoDuration::weeks(1),
            TimeRange::Month => ChronoDuration::days(30),
        }
    }
}

/// Which activity kinds a metrics/activity query narrows to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricsKind {
    #[default]
    All,
    Commits,
    Files,
    Tests,
    Builds,
}

impl MetricsKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(MetricsKind::All),
            "commits" => Some(MetricsKind::Commits),
            "files" => Some(MetricsKind::Files),
            "tests" => Some(MetricsKind::Tests),
            "builds" => Some(MetricsKind::Builds),
            _ => None,
        }
    }

    pub fn categories(&self) -> Vec<EventCategory> {
        match self {
            MetricsKind::All => Vec::new(),
            MetricsKind::Commits => vec![EventCategory::Git],
            MetricsKind::Files => vec![EventCategory::File],
            MetricsKind::Tests => vec![EventCategory::Test],
            MetricsKind::Builds => vec![EventCategory::Build],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    pub stage: Stage,
    pub progress: f64,
    pub reached: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<Stage>,
    pub confidence: f64,
    pub active_sub_stages: Vec<CodingSubStage>,
    pub methodology_scores: HashMap<Methodology, f64>,
    pub milestones: Vec<Milestone>,
    pub monitors: Vec<MonitorStatus>,
    pub queues: HashMap<String, QueueStatsSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent_activity: Option<Vec<ActivityEntry>>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsAggregates {
    pub commits: u64,
    pub files_changed: u64,
    pub test_runs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_pass_rate: Option<f64>,
    pub builds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_build_ms: Option<f64>,
    pub ai_interactions: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsReport {
    pub period: &'static str,
    #[serde(with = "devlens_model::event::ts_milliseconds")]
    pub from: DateTime<Utc>,
    #[serde(with = "devlens_model::event::ts_milliseconds")]
    pub to: DateTime<Utc>,
    pub aggregates: MetricsAggregates,
    pub trends: HashMap<String, TrendDirection>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySummary {
    pub by_category: HashMap<EventCategory, u64>,
    pub by_severity: HashMap<EventSeverity, u64>,
    /// Entries per hour over the returned slice.
    pub activity_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityLog {
    pub activities: Vec<ActivityEntry>,
    pub summary: ActivitySummary,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BottleneckQuery {
    pub min_severity: Option<BottleneckSeverity>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BottleneckReport {
    pub bottlenecks: Vec<Bottleneck>,
    pub summary: HashMap<BottleneckSeverity, u64>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MethodologyFilter {
    #[default]
    All,
    Ddd,
    Tdd,
    Bdd,
    Eda,
}

impl MethodologyFilter {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "all" => Some(MethodologyFilter::All),
            other => Methodology::parse(other).map(|m| match m {
                Methodology::Ddd => MethodologyFilter::Ddd,
                Methodology::Tdd => MethodologyFilter::Tdd,
                Methodology::Bdd => MethodologyFilter::Bdd,
                Methodology::Eda => MethodologyFilter::Eda,
            }),
        }
    }

    pub fn selected(&self) -> Option<Methodology> {
        match self {
            MethodologyFilter::All => None,
            MethodologyFilter::Ddd => Some(Methodology::Ddd),
            MethodologyFilter::Tdd => Some(Methodology::Tdd),
            MethodologyFilter::Bdd => Some(Methodology::Bdd),
            MethodologyFilter::Eda => Some(Methodology::Eda),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodologyReport {
    pub scores: HashMap<Methodology, MethodologyScore>,
    pub overall: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dominant: Option<Methodology>,
    pub trend: MethodologyTrend,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StageQuery {
    pub history_limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<Stage>,
    pub confidence: f64,
    pub sub_stages: Vec<CodingSubStage>,
    pub stage_progress: HashMap<Stage, f64>,
    pub transitions: Vec<StageTransition>,
    /// Milliseconds between first entry and last activity, per stage.
    pub time_spent_ms: HashMap<Stage, i64>,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiCollabReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub usage: AiUsageSnapshot,
}

/// Structured failure payload: the facade never throws across the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

impl From<&TelemetryError> for ErrorPayload {
    fn from(err: &TelemetryError) -> Self {
        Self {
            error: ErrorBody {
                kind: err.kind().to_string(),
                message: err.to_string(),
            },
        }
    }
}
