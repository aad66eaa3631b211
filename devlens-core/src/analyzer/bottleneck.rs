//! Threshold/anomaly signals over the derived state: where the workflow is
//! losing time.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use devlens_model::{
    Bottleneck, BottleneckKind, BottleneckSeverity, Event, EventCategory,
    EventSeverity, FilePayload, StageSnapshot,
};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::analyzer::metrics::MetricsSnapshot;
use crate::analyzer::{Analyzer, SnapshotCell, snapshot_cell};
use crate::queue::QueueManager;
use crate::sink::SystemEventSink;

pub const ANALYZER_NAME: &str = "bottleneck-detector";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct BottleneckConfig {
    #[serde(with = "crate::duration")]
    pub analyze_interval_ms: u64,
    /// Time-in-stage ceiling before a stage counts as stuck.
    #[serde(with = "crate::duration")]
    pub stuck_stage_ms: u64,
    /// Edits per file per hour before it counts as a hotspot.
    pub hotspot_edits_per_hour: usize,
    /// Pending queue entries before backlog is flagged.
    pub backlog_threshold: usize,
    /// Subscriber errors per analysis interval before flagging.
    pub subscriber_error_threshold: u64,
    /// Z-score beyond which a metric trend counts as anomalous.
    pub zscore_threshold: f64,
    /// Re-detections inside this window update the existing record.
    #[serde(with = "crate::duration")]
    pub dedup_cooldown_ms: u64,
    /// min/max bounds per metric id for threshold signals.
    pub metric_bounds: HashMap<String, (Option<f64>, Option<f64>)>,
}

impl Default for BottleneckConfig {
    fn default() -> Self {
        Self {
            analyze_interval_ms: 30_000,
            stuck_stage_ms: 4 * 3_600_000,
            hotspot_edits_per_hour: 30,
            backlog_threshold: 5_000,
            subscriber_error_threshold: 25,
            zscore_threshold: 3.0,
            dedup_cooldown_ms: 10 * 60_000,
            metric_bounds: HashMap::from([
                (
                    super::metrics::ids::TEST_PASS_RATE.to_string(),
                    (Some(60.0), None),
                ),
                (
                    super::metrics::ids::BUILD_TIME_MS.to_string(),
                    (None, Some(600_000.0)),
                ),
            ]),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BottleneckSnapshot {
    pub bottlenecks: Vec<Bottleneck>,
}

fn suggested_actions(kind: BottleneckKind) -> Vec<String> {
    let actions: &[&str] = match kind {
        BottleneckKind::Threshold => &[
            "Inspect the metric's recent points for the regression",
            "Compare against the last known-good period",
        ],
        BottleneckKind::TrendAnomaly => &[
            "Check what changed around the anomaly window",
            "Confirm the signal is not a data artifact before acting",
        ],
        BottleneckKind::StuckStage => &[
            "Break the current stage into smaller deliverables",
            "Timebox the remaining work or escalate blockers",
        ],
        BottleneckKind::Hotspot => &[
            "Consider splitting the file along its responsibilities",
            "Add tests around the churned area before further edits",
        ],
        BottleneckKind::QueueBacklog => &[
            "Raise batch sizes or add queue workers",
            "Check for a slow or failing batch processor",
        ],
        BottleneckKind::SubscriberErrors => &[
            "Find the failing subscriber in the bus stats",
            "Move heavy handler work onto its own worker channel",
        ],
    };
    actions.iter().map(|action| action.to_string()).collect()
}

/// Detector state: periodic analysis over injected snapshots plus
/// event-driven hotspot/error tracking.
pub struct BottleneckDetector {
    config: BottleneckConfig,
    metrics: SnapshotCell<MetricsSnapshot>,
    stage: SnapshotCell<StageSnapshot>,
    queues: Arc<QueueManager>,
    sink: Arc<dyn SystemEventSink>,
    subscriber_errors: u64,
    last_subscriber_errors: u64,
    file_edits: HashMap<String, VecDeque<DateTime<Utc>>>,
    active: HashMap<String, Bottleneck>,
    snapshot: SnapshotCell<BottleneckSnapshot>,
}

impl std::fmt::Debug for BottleneckDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BottleneckDetector")
            .field("active", &self.active.len())
            .finish()
    }
}

impl BottleneckDetector {
    pub fn new(
        config: BottleneckConfig,
        metrics: SnapshotCell<MetricsSnapshot>,
        stage: SnapshotCell<StageSnapshot>,
        queues: Arc<QueueManager>,
        sink: Arc<dyn SystemEventSink>,
    ) -> Self {
        Self {
            config,
            metrics,
            stage,
            queues,
            sink,
            subscriber_errors: 0,
            last_subscriber_errors: 0,
            file_edits: HashMap::new(),
            active: HashMap::new(),
            snapshot: snapshot_cell(),
        }
    }

    pub fn snapshot_cell(&self) -> SnapshotCell<BottleneckSnapshot> {
        self.snapshot.clone()
    }

    fn report(
        &mut self,
        now: DateTime<Utc>,
        kind: BottleneckKind,
        severity: BottleneckSeverity,
        title: String,
        location: String,
        impact: f64,
        confidence: f64,
    ) {
        let key = format!("{}:{location}", kind.as_str());
        if let Some(existing) = self.active.get_mut(&key) {
            existing.frequency += 1;
            existing.last_occurred_at = now;
            existing.severity = existing.severity.max(severity);
            existing.impact = existing.impact.max(impact);
            return;
        }
        let bottleneck = Bottleneck {
            id: Uuid::new_v4(),
            kind,
            severity,
            title: title.clone(),
            location: location.clone(),
            impact: impact.clamp(0.0, 100.0),
            confidence: confidence.clamp(0.0, 1.0),
            frequency: 1,
            first_detected_at: now,
            last_occurred_at: now,
            suggested_actions: suggested_actions(kind),
        };
        debug!(kind = kind.as_str(), %location, "bottleneck detected");
        self.sink.emit(
            Event::builder("system:bottleneck_detected", EventCategory::System)
                .severity(EventSeverity::Notice)
                .source(ANALYZER_NAME)
                .data(serde_json::json!({
                    "kind": kind.as_str(),
                    "title": title,
                    "location": location,
                    "impact": impact,
                }))
                .build(),
        );
        self.active.insert(key, bottleneck);
    }

    fn expire_stale(&mut self, now: DateTime<Utc>) {
        let stale_after = ChronoDuration::milliseconds(
            (self.config.dedup_cooldown_ms * 4) as i64,
        );
        self.active
            .retain(|_, bottleneck| now - bottleneck.last_occurred_at < stale_after);
    }

    fn check_thresholds(&mut self, now: DateTime<Utc>) {
        let metrics = self.metrics.load();
        let bounds: Vec<(String, Option<f64>, Option<f64>, f64)> = self
            .config
            .metric_bounds
            .iter()
            .filter_map(|(id, (min, max))| {
                metrics
                    .summary(id)
                    .map(|summary| (id.clone(), *min, *max, summary.current))
            })
            .collect();
        for (id, min, max, current) in bounds {
            let breached = match (min, max) {
                (Some(min), _) if current < min => Some(format!(
                    "{id} fell below {min:.0} (now {current:.1})"
                )),
                (_, Some(max)) if current > max => Some(format!(
                    "{id} exceeded {max:.0} (now {current:.1})"
                )),
                _ => None,
            };
            if let Some(title) = breached {
                self.report(
                    now,
                    BottleneckKind::Threshold,
                    BottleneckSeverity::High,
                    title,
                    id,
                    70.0,
                    0.9,
                );
            }
        }
    }

    fn check_trend_anomalies(&mut self, now: DateTime<Utc>) {
        let metrics = self.metrics.load();
        let anomalies: Vec<(String, f64)> = metrics
            .series
            .iter()
            .filter_map(|(id, series)| {
                let values: Vec<f64> =
                    series.points.iter().map(|p| p.value).collect();
                zscore_of_recent(&values).map(|z| (id.clone(), z))
            })
            .filter(|(_, z)| z.abs() > self.config.zscore_threshold)
            .collect();
        for (id, z) in anomalies {
            self.report(
                now,
                BottleneckKind::TrendAnomaly,
                BottleneckSeverity::Medium,
                format!("{id} deviates from baseline (z = {z:.1})"),
                id,
                50.0,
                0.6,
            );
        }
    }

    fn check_stuck_stage(&mut self, now: DateTime<Utc>) {
        let stage = self.stage.load();
        let Some(current) = stage.current else {
            return;
        };
        let Some(entered) = stage.first_entered_at.get(&current) else {
            return;
        };
        let progress = stage
            .stage_progress
            .get(&current)
            .copied()
            .unwrap_or(0.0);
        let ceiling = ChronoDuration::milliseconds(self.config.stuck_stage_ms as i64);
        if now - *entered > ceiling && progress < 100.0 {
            let hours = (now - *entered).num_minutes() as f64 / 60.0;
            self.report(
                now,
                BottleneckKind::StuckStage,
                BottleneckSeverity::High,
                format!(
                    "{current} has been active {hours:.1}h at {progress:.0}% progress"
                ),
                current.as_str().to_string(),
                65.0,
                0.7,
            );
        }
    }

    fn check_hotspots(&mut self, now: DateTime<Utc>) {
        let hour = ChronoDuration::hours(1);
        let threshold = self.config.hotspot_edits_per_hour;
        let mut hotspots = Vec::new();
        self.file_edits.retain(|path, edits| {
            while let Some(front) = edits.front() {
                if now - *front > hour {
                    edits.pop_front();
                } else {
                    break;
                }
            }
            if edits.len() >= threshold {
                hotspots.push((path.clone(), edits.len()));
            }
            !edits.is_empty()
        });
        for (path, edits) in hotspots {
            self.report(
                now,
                BottleneckKind::Hotspot,
                BottleneckSeverity::Medium,
                format!("{path} modified {edits} times in the last hour"),
                path,
                45.0,
                0.8,
            );
        }
    }

    fn check_plumbing(&mut self, now: DateTime<Utc>) {
        let backlog = self.queues.backlog();
        if backlog > self.config.backlog_threshold {
            self.report(
                now,
                BottleneckKind::QueueBacklog,
                BottleneckSeverity::Critical,
                format!("{backlog} entries pending across queues"),
                "queues".to_string(),
                85.0,
                0.95,
            );
        }
        let errors = self.subscriber_errors - self.last_subscriber_errors;
        self.last_subscriber_errors = self.subscriber_errors;
        if errors > self.config.subscriber_error_threshold {
            self.report(
                now,
                BottleneckKind::SubscriberErrors,
                BottleneckSeverity::High,
                format!("{errors} subscriber failures since the last analysis"),
                "event-bus".to_string(),
                60.0,
                0.9,
            );
        }
    }

    fn publish(&self) {
        let mut bottlenecks: Vec<Bottleneck> =
            self.active.values().cloned().collect();
        bottlenecks.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(b.impact.partial_cmp(&a.impact).unwrap_or(std::cmp::Ordering::Equal))
        });
        self.snapshot
            .store(Arc::new(BottleneckSnapshot { bottlenecks }));
    }

    fn analyze(&mut self, now: DateTime<Utc>) {
        self.expire_stale(now);
        self.check_thresholds(now);
        self.check_trend_anomalies(now);
        self.check_stuck_stage(now);
        self.check_hotspots(now);
        self.check_plumbing(now);
        self.publish();
    }
}

/// Z-score of the recent quarter of a series against the preceding
/// baseline. None until there is enough history to be meaningful.
fn zscore_of_recent(values: &[f64]) -> Option<f64> {
    if values.len() < 12 {
        return None;
    }
    let split = values.len() - values.len() / 4;
    let (baseline, recent) = values.split_at(split);
    let mean = baseline.iter().sum::<f64>() / baseline.len() as f64;
    let variance = baseline
        .iter()
        .map(|value| (value - mean).powi(2))
        .sum::<f64>()
        / baseline.len() as f64;
    let stddev = variance.sqrt();
    if stddev < 1e-9 {
        return None;
    }
    let recent_mean = recent.iter().sum::<f64>() / recent.len() as f64;
    Some((recent_mean - mean) / stddev)
}

impl Analyzer for BottleneckDetector {
    fn name(&self) -> &'static str {
        ANALYZER_NAME
    }

    fn ingest(&mut self, event: &Event) {
        match event.category {
            EventCategory::File => {
                if let Ok(payload) = FilePayload::from_value(&event.data)
                    && let Some(path) = payload.new_path
                    && !payload.is_directory
                {
                    self.file_edits
                        .entry(path)
                        .or_default()
                        .push_back(event.timestamp);
                }
            }
            EventCategory::System
                if event.event_type == "system:subscriber_error" =>
            {
                self.subscriber_errors += 1;
            }
            _ => {}
        }
    }

    fn tick(&mut self) {
        self.analyze(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueuesConfig;
    use chrono::TimeZone;
    use devlens_model::EventBuilder;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<Event>>,
    }

    impl SystemEventSink for RecordingSink {
        fn emit(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn detector(config: BottleneckConfig) -> (BottleneckDetector, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let detector = BottleneckDetector::new(
            config,
            snapshot_cell(),
            snapshot_cell(),
            QueueManager::new(QueuesConfig::default()),
            sink.clone(),
        );
        (detector, sink)
    }

    fn edit(ms: i64, path: &str) -> Event {
        EventBuilder::new("file:changed", EventCategory::File)
            .timestamp(at(ms))
            .data(serde_json::json!({
                "action": "modify",
                "newPath": path,
                "extension": "rs",
                "contextTag": "source",
            }))
            .build()
    }

    #[test]
    fn hotspot_fires_past_the_edit_threshold() {
        let (mut detector, sink) = detector(BottleneckConfig {
            hotspot_edits_per_hour: 5,
            ..Default::default()
        });
        for i in 0..6 {
            detector.ingest(&edit(i * 1_000, "src/hot.rs"));
        }
        detector.ingest(&edit(0, "src/cold.rs"));
        detector.analyze(at(10_000));

        let snapshot = detector.snapshot.load();
        assert_eq!(snapshot.bottlenecks.len(), 1);
        let hotspot = &snapshot.bottlenecks[0];
        assert_eq!(hotspot.kind, BottleneckKind::Hotspot);
        assert_eq!(hotspot.location, "src/hot.rs");
        assert!(!hotspot.suggested_actions.is_empty());
        assert_eq!(sink.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn redetection_updates_frequency_not_identity() {
        let (mut detector, sink) = detector(BottleneckConfig {
            hotspot_edits_per_hour: 2,
            ..Default::default()
        });
        for i in 0..4 {
            detector.ingest(&edit(i * 1_000, "src/hot.rs"));
        }
        detector.analyze(at(5_000));
        detector.analyze(at(6_000));

        let snapshot = detector.snapshot.load();
        assert_eq!(snapshot.bottlenecks.len(), 1);
        assert_eq!(snapshot.bottlenecks[0].frequency, 2);
        assert_eq!(snapshot.bottlenecks[0].last_occurred_at, at(6_000));
        // Only the first detection publishes a system event.
        assert_eq!(sink.events.lock().unwrap().len(), 1);
    }

    #[test]
    fn threshold_breach_is_reported() {
        let (mut detector, _) = detector(BottleneckConfig::default());
        {
            let mut metrics = crate::analyzer::metrics::MetricsCollector::new(
                Default::default(),
            );
            for i in 0..4 {
                metrics.record(
                    crate::analyzer::metrics::ids::TEST_PASS_RATE,
                    at(i * 1_000),
                    40.0,
                );
            }
            detector.metrics = metrics.snapshot_cell();
        }
        detector.analyze(at(10_000));
        let snapshot = detector.snapshot.load();
        assert!(snapshot
            .bottlenecks
            .iter()
            .any(|b| b.kind == BottleneckKind::Threshold));
    }

    #[test]
    fn zscore_needs_history_and_flags_outliers() {
        let mut values = vec![10.0; 16];
        assert!(zscore_of_recent(&values).is_none(), "flat baseline");
        values.truncate(8);
        assert!(zscore_of_recent(&values).is_none(), "too short");

        let mut spiky: Vec<f64> = (0..12).map(|i| 10.0 + (i % 3) as f64).collect();
        spiky.extend([40.0, 42.0, 41.0, 43.0]);
        let z = zscore_of_recent(&spiky).expect("z-score");
        assert!(z > 3.0, "got {z}");
    }
}
