//! Rolling metric series over the event stream: productivity, quality,
//! performance, and collaboration.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use devlens_model::{
    Event, EventCategory, GitAction, GitPayload, MetricAggregation,
    MetricDefinition, MetricKind, MetricPoint, MetricSummary, MetricUnit,
    RunPayload, TrendDirection,
};
use serde::{Deserialize, Serialize};

use crate::analyzer::{Analyzer, SnapshotCell, snapshot_cell};

pub const ANALYZER_NAME: &str = "metrics-collector";

pub mod ids {
    pub const COMMITS_PER_DAY: &str = "productivity.commits_per_day";
    pub const LOC_PER_HOUR: &str = "productivity.loc_per_hour";
    pub const TEST_COVERAGE: &str = "productivity.test_coverage";
    pub const TEST_PASS_RATE: &str = "quality.test_pass_rate";
    pub const REVIEW_APPROVAL_RATE: &str = "quality.review_approval_rate";
    pub const BUILD_TIME_MS: &str = "performance.build_time_ms";
    pub const TEST_TIME_MS: &str = "performance.test_time_ms";
    pub const ERROR_RATE: &str = "performance.error_rate";
    pub const PRS_PER_DAY: &str = "collaboration.prs_per_day";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct MetricsConfig {
    /// Points kept per series ring.
    pub ring_capacity: usize,
    /// Test outcomes considered for the pass-rate window.
    pub pass_rate_window: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 512,
            pass_rate_window: 20,
        }
    }
}

/// One bounded series plus its on-insert summary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSeries {
    pub definition: MetricDefinition,
    pub points: VecDeque<MetricPoint>,
    pub summary: MetricSummary,
}

impl MetricSeries {
    fn new(definition: MetricDefinition) -> Self {
        Self {
            definition,
            points: VecDeque::new(),
            summary: MetricSummary::default(),
        }
    }

    fn insert(&mut self, point: MetricPoint, capacity: usize) {
        self.points.push_back(point);
        while self.points.len() > capacity.max(2) {
            self.points.pop_front();
        }
        self.summary = summarize(&self.points);
    }
}

fn summarize(points: &VecDeque<MetricPoint>) -> MetricSummary {
    let values: Vec<f64> = points.iter().map(|p| p.value).collect();
    let len = values.len();
    if len == 0 {
        return MetricSummary::default();
    }
    let current = values[len - 1];
    let previous = if len >= 2 { values[len - 2] } else { current };
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let avg = values.iter().sum::<f64>() / len as f64;
    let median = {
        let mut sorted = values.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        if len % 2 == 1 {
            sorted[len / 2]
        } else {
            (sorted[len / 2 - 1] + sorted[len / 2]) / 2.0
        }
    };
    // Trend: recent third vs the rest, with a small dead band.
    let trend = {
        let split = (len * 2) / 3;
        let (head, tail) = values.split_at(split.max(1).min(len - 1).max(1));
        if head.is_empty() || tail.is_empty() {
            TrendDirection::Flat
        } else {
            let head_avg = head.iter().sum::<f64>() / head.len() as f64;
            let tail_avg = tail.iter().sum::<f64>() / tail.len() as f64;
            let band = head_avg.abs().max(1e-9) * 0.05;
            if tail_avg > head_avg + band {
                TrendDirection::Up
            } else if tail_avg < head_avg - band {
                TrendDirection::Down
            } else {
                TrendDirection::Flat
            }
        }
    };
    MetricSummary {
        current,
        previous,
        min,
        max,
        avg,
        median,
        trend,
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub series: HashMap<String, MetricSeries>,
}

impl MetricsSnapshot {
    pub fn summary(&self, id: &str) -> Option<&MetricSummary> {
        self.series.get(id).map(|series| &series.summary)
    }
}

fn definitions() -> Vec<MetricDefinition> {
    use MetricAggregation::*;
    use MetricKind::*;
    use MetricUnit::*;
    let define = |id: &str, name: &str, kind, unit, aggregation| MetricDefinition {
        id: id.to_string(),
        name: name.to_string(),
        kind,
        unit,
        aggregation,
    };
    vec![
        define(ids::COMMITS_PER_DAY, "Commits per day", Productivity, PerDay, Latest),
        define(ids::LOC_PER_HOUR, "Changed lines per hour", Productivity, LinesPerHour, Latest),
        define(ids::TEST_COVERAGE, "Test coverage", Productivity, Percent, Latest),
        define(ids::TEST_PASS_RATE, "Test pass rate", Quality, Percent, Latest),
        define(ids::REVIEW_APPROVAL_RATE, "Review approval rate", Quality, Percent, Latest),
        define(ids::BUILD_TIME_MS, "Build time", Performance, Milliseconds, Average),
        define(ids::TEST_TIME_MS, "Test execution time", Performance, Milliseconds, Average),
        define(ids::ERROR_RATE, "Error events per hour", Performance, Count, Latest),
        define(ids::PRS_PER_DAY, "Pull requests per day", Collaboration, PerDay, Latest),
    ]
}

pub struct MetricsCollector {
    config: MetricsConfig,
    series: HashMap<String, MetricSeries>,
    commit_times: VecDeque<DateTime<Utc>>,
    churn: VecDeque<(DateTime<Utc>, u64)>,
    pr_times: VecDeque<DateTime<Utc>>,
    error_times: VecDeque<DateTime<Utc>>,
    test_outcomes: VecDeque<bool>,
    snapshot: SnapshotCell<MetricsSnapshot>,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("series", &self.series.len())
            .finish()
    }
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig) -> Self {
        let series = definitions()
            .into_iter()
            .map(|definition| {
                (definition.id.clone(), MetricSeries::new(definition))
            })
            .collect();
        Self {
            config,
            series,
            commit_times: VecDeque::new(),
            churn: VecDeque::new(),
            pr_times: VecDeque::new(),
            error_times: VecDeque::new(),
            test_outcomes: VecDeque::new(),
            snapshot: snapshot_cell(),
        }
    }

    pub fn snapshot_cell(&self) -> SnapshotCell<MetricsSnapshot> {
        self.snapshot.clone()
    }

    /// Record an explicit point on a series (facade/testing entry point).
    pub fn record(&mut self, id: &str, at: DateTime<Utc>, value: f64) {
        if let Some(series) = self.series.get_mut(id) {
            series.insert(MetricPoint { ts: at, value }, self.config.ring_capacity);
        }
        self.publish();
    }

    fn publish(&self) {
        self.snapshot.store(Arc::new(MetricsSnapshot {
            series: self.series.clone(),
        }));
    }

    fn insert(&mut self, id: &str, at: DateTime<Utc>, value: f64) {
        if let Some(series) = self.series.get_mut(id) {
            series.insert(MetricPoint { ts: at, value }, self.config.ring_capacity);
        }
    }

    fn ingest_git(&mut self, at: DateTime<Utc>, payload: &GitPayload) {
        match payload.action {
            GitAction::Commit | GitAction::Merge => {
                self.commit_times.push_back(at);
                prune_window(&mut self.commit_times, at, ChronoDuration::days(1));
                self.insert(ids::COMMITS_PER_DAY, at, self.commit_times.len() as f64);

                if let Some(stats) = &payload.stats {
                    self.churn.push_back((at, stats.churn()));
                    let hour = ChronoDuration::hours(1);
                    while let Some((ts, _)) = self.churn.front() {
                        if at - *ts > hour {
                            self.churn.pop_front();
                        } else {
                            break;
                        }
                    }
                    let lines: u64 =
                        self.churn.iter().map(|(_, lines)| *lines).sum();
                    self.insert(ids::LOC_PER_HOUR, at, lines as f64);
                }
            }
            GitAction::Pr => {
                self.pr_times.push_back(at);
                prune_window(&mut self.pr_times, at, ChronoDuration::days(1));
                self.insert(ids::PRS_PER_DAY, at, self.pr_times.len() as f64);
            }
            _ => {}
        }
    }

    fn ingest_run(
        &mut self,
        at: DateTime<Utc>,
        category: EventCategory,
        payload: &RunPayload,
    ) {
        match category {
            EventCategory::Test => {
                self.test_outcomes.push_back(payload.status.is_ok());
                while self.test_outcomes.len() > self.config.pass_rate_window.max(1)
                {
                    self.test_outcomes.pop_front();
                }
                let passed =
                    self.test_outcomes.iter().filter(|ok| **ok).count() as f64;
                let rate = passed / self.test_outcomes.len() as f64 * 100.0;
                self.insert(ids::TEST_PASS_RATE, at, rate);
                self.insert(ids::TEST_TIME_MS, at, payload.duration_ms as f64);
                if let Some(coverage) = payload.coverage {
                    self.insert(ids::TEST_COVERAGE, at, coverage);
                }
            }
            EventCategory::Build => {
                self.insert(ids::BUILD_TIME_MS, at, payload.duration_ms as f64);
            }
            _ => {}
        }
    }

    fn ingest_error(&mut self, at: DateTime<Utc>) {
        self.error_times.push_back(at);
        prune_window(&mut self.error_times, at, ChronoDuration::hours(1));
        self.insert(ids::ERROR_RATE, at, self.error_times.len() as f64);
    }
}

fn prune_window(
    times: &mut VecDeque<DateTime<Utc>>,
    now: DateTime<Utc>,
    window: ChronoDuration,
) {
    while let Some(front) = times.front() {
        if now - *front > window {
            times.pop_front();
        } else {
            break;
        }
    }
}

impl Analyzer for MetricsCollector {
    fn name(&self) -> &'static str {
        ANALYZER_NAME
    }

    fn ingest(&mut self, event: &Event) {
        let at = event.timestamp;
        if event.severity.is_high() {
            self.ingest_error(at);
        }
        match event.category {
            EventCategory::Git => {
                if let Ok(payload) = GitPayload::from_value(&event.data) {
                    self.ingest_git(at, &payload);
                }
            }
            EventCategory::Test | EventCategory::Build => {
                if let Ok(payload) = RunPayload::from_value(&event.data) {
                    self.ingest_run(at, event.category, &payload);
                }
            }
            _ => {}
        }
        self.publish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use devlens_model::EventBuilder;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn commit(ms: i64, adds: u64, dels: u64) -> Event {
        EventBuilder::new("git:commit", EventCategory::Git)
            .timestamp(at(ms))
            .data(serde_json::json!({
                "action": "commit",
                "hash": format!("{ms:x}"),
                "stats": {"adds": adds, "dels": dels, "files": 2},
            }))
            .build()
    }

    fn test_run(ms: i64, passed: bool) -> Event {
        EventBuilder::new("test:run", EventCategory::Test)
            .timestamp(at(ms))
            .data(serde_json::json!({
                "status": if passed { "passed" } else { "failed" },
                "durationMs": 900,
                "coverage": 81.5,
            }))
            .build()
    }

    #[test]
    fn commits_per_day_counts_rolling_window() {
        let mut collector = MetricsCollector::new(MetricsConfig::default());
        collector.ingest(&commit(0, 10, 2));
        collector.ingest(&commit(3_600_000, 5, 1));
        // Third commit lands 25h after the first; the first expires.
        collector.ingest(&commit(25 * 3_600_000, 8, 0));
        let snapshot = collector.snapshot.load();
        assert_eq!(snapshot.summary(ids::COMMITS_PER_DAY).unwrap().current, 2.0);
    }

    #[test]
    fn pass_rate_reflects_recent_outcomes() {
        let mut collector = MetricsCollector::new(MetricsConfig::default());
        collector.ingest(&test_run(0, true));
        collector.ingest(&test_run(1_000, true));
        collector.ingest(&test_run(2_000, false));
        collector.ingest(&test_run(3_000, true));
        let snapshot = collector.snapshot.load();
        assert_eq!(snapshot.summary(ids::TEST_PASS_RATE).unwrap().current, 75.0);
        assert_eq!(snapshot.summary(ids::TEST_COVERAGE).unwrap().current, 81.5);
    }

    #[test]
    fn summary_recomputes_on_insert() {
        let mut collector = MetricsCollector::new(MetricsConfig::default());
        for (i, value) in [10.0, 20.0, 30.0].into_iter().enumerate() {
            collector.record(ids::BUILD_TIME_MS, at(i as i64 * 1000), value);
        }
        let snapshot = collector.snapshot.load();
        let summary = snapshot.summary(ids::BUILD_TIME_MS).unwrap();
        assert_eq!(summary.current, 30.0);
        assert_eq!(summary.previous, 20.0);
        assert_eq!(summary.min, 10.0);
        assert_eq!(summary.max, 30.0);
        assert_eq!(summary.median, 20.0);
        assert_eq!(summary.trend, TrendDirection::Up);
    }

    #[test]
    fn error_rate_tracks_high_severity_events() {
        let mut collector = MetricsCollector::new(MetricsConfig::default());
        for i in 0..3 {
            let event = EventBuilder::new("system:subscriber_error", EventCategory::System)
                .severity(devlens_model::EventSeverity::Error)
                .timestamp(at(i * 1_000))
                .data(serde_json::json!({}))
                .build();
            collector.ingest(&event);
        }
        let snapshot = collector.snapshot.load();
        assert_eq!(snapshot.summary(ids::ERROR_RATE).unwrap().current, 3.0);
    }
}
