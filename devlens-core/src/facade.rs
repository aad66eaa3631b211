//! The stable query surface consumed by the external RPC layer. Read-only:
//! every answer is assembled from analyzer snapshots and store queries;
//! mutation only ever happens through published events.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use devlens_model::{
    EventCategory, GitAction, GitPayload, RunPayload, StageSnapshot,
};

use crate::analyzer::metrics::ids as metric_ids;
use crate::analyzer::{
    AiUsageSnapshot, BottleneckSnapshot, MethodologySnapshot, MetricsSnapshot,
    SnapshotCell,
};
use crate::api_types::{
    ActivityLog, ActivitySummary, AiCollabReport, BottleneckQuery,
    BottleneckReport, MethodologyFilter, MethodologyReport, MetricsAggregates,
    MetricsKind, MetricsReport, Milestone, ProjectStatus, StageQuery,
    StageReport, TimeRange,
};
use crate::bus::EventBus;
use crate::error::Result;
use crate::monitor::MonitorRegistry;
use crate::queue::QueueManager;
use crate::store::{EventFilter, EventStore};

const RECENT_ACTIVITY_LIMIT: u32 = 20;

/// Aggregated read access over the whole event plane.
pub struct ToolFacade {
    store: Arc<EventStore>,
    bus: Arc<EventBus>,
    queues: Arc<QueueManager>,
    monitors: Arc<MonitorRegistry>,
    stage: SnapshotCell<StageSnapshot>,
    methodology: SnapshotCell<MethodologySnapshot>,
    ai: SnapshotCell<AiUsageSnapshot>,
    metrics: SnapshotCell<MetricsSnapshot>,
    bottlenecks: SnapshotCell<BottleneckSnapshot>,
}

impl std::fmt::Debug for ToolFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolFacade").finish()
    }
}

#[allow(clippy::too_many_arguments)]
impl ToolFacade {
    pub fn new(
        store: Arc<EventStore>,
        bus: Arc<EventBus>,
        queues: Arc<QueueManager>,
        monitors: Arc<MonitorRegistry>,
        stage: SnapshotCell<StageSnapshot>,
        methodology: SnapshotCell<MethodologySnapshot>,
        ai: SnapshotCell<AiUsageSnapshot>,
        metrics: SnapshotCell<MetricsSnapshot>,
        bottlenecks: SnapshotCell<BottleneckSnapshot>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            queues,
            monitors,
            stage,
            methodology,
            ai,
            metrics,
            bottlenecks,
        })
    }

    pub async fn get_project_status(
        &self,
        include_details: bool,
    ) -> Result<ProjectStatus> {
        let stage = self.stage.load();
        let methodology = self.methodology.load();

        let milestones: Vec<Milestone> = devlens_model::Stage::ALL
            .iter()
            .filter_map(|stage_id| {
                let progress =
                    stage.stage_progress.get(stage_id).copied().unwrap_or(0.0);
                (progress > 0.0).then(|| Milestone {
                    stage: *stage_id,
                    progress,
                    reached: progress >= 100.0,
                })
            })
            .collect();

        let recent_activity = if include_details {
            Some(
                self.store
                    .recent_activities(RECENT_ACTIVITY_LIMIT, None)
                    .await?,
            )
        } else {
            None
        };

        Ok(ProjectStatus {
            current_stage: stage.current,
            confidence: stage.confidence,
            active_sub_stages: stage.active_sub_stages.clone(),
            methodology_scores: methodology
                .scores
                .iter()
                .map(|(methodology, score)| (*methodology, score.score))
                .collect(),
            milestones,
            monitors: self.monitors.snapshot(),
            queues: self.queues.stats(),
            recent_activity,
        })
    }

    pub async fn get_metrics(
        &self,
        range: TimeRange,
        kind: MetricsKind,
    ) -> Result<MetricsReport> {
        let to = Utc::now();
        let from = to - range.duration();
        let filter = EventFilter {
            categories: kind.categories(),
            ..Default::default()
        };
        let events = self.store.find_by_time_range(from, to, &filter).await?;

        let mut aggregates = MetricsAggregates::default();
        let mut test_passed = 0u64;
        let mut build_ms_total = 0u64;
        for event in &events {
            match event.category {
                EventCategory::Git => {
                    if let Ok(payload) = GitPayload::from_value(&event.data)
                        && matches!(
                            payload.action,
                            GitAction::Commit | GitAction::Merge
                        )
                    {
                        aggregates.commits += 1;
                    }
                }
                EventCategory::File => aggregates.files_changed += 1,
                EventCategory::Test => {
                    aggregates.test_runs += 1;
                    if let Ok(payload) = RunPayload::from_value(&event.data)
                        && payload.status.is_ok()
                    {
                        test_passed += 1;
                    }
                }
                EventCategory::Build => {
                    aggregates.builds += 1;
                    if let Ok(payload) = RunPayload::from_value(&event.data) {
                        build_ms_total += payload.duration_ms;
                    }
                }
                EventCategory::Ai => aggregates.ai_interactions += 1,
                _ => {}
            }
        }
        if aggregates.test_runs > 0 {
            aggregates.test_pass_rate =
                Some(test_passed as f64 / aggregates.test_runs as f64 * 100.0);
        }
        if aggregates.builds > 0 {
            aggregates.avg_build_ms =
                Some(build_ms_total as f64 / aggregates.builds as f64);
        }

        let metrics = self.metrics.load();
        let trends: HashMap<String, _> = metrics
            .series
            .iter()
            .filter(|(_, series)| !series.points.is_empty())
            .map(|(id, series)| (id.clone(), series.summary.trend))
            .collect();

        Ok(MetricsReport {
            period: range.as_str(),
            from,
            to,
            recommendations: recommend(&aggregates, &metrics),
            aggregates,
            trends,
        })
    }

    pub async fn get_activity_log(
        &self,
        limit: u32,
        kind: Option<EventCategory>,
    ) -> Result<ActivityLog> {
        let activities = self.store.recent_activities(limit.max(1), kind).await?;

        let mut summary = ActivitySummary::default();
        for activity in &activities {
            *summary.by_category.entry(activity.category).or_insert(0) += 1;
            *summary.by_severity.entry(activity.severity).or_insert(0) += 1;
        }
        if let (Some(newest), Some(oldest)) =
            (activities.first(), activities.last())
        {
            let span_hours = (newest.at - oldest.at).num_milliseconds().max(1)
                as f64
                / 3_600_000.0;
            summary.activity_rate =
                activities.len() as f64 / span_hours.max(1.0 / 60.0);
        }

        Ok(ActivityLog {
            activities,
            summary,
        })
    }

    pub fn analyze_bottlenecks(&self, query: BottleneckQuery) -> BottleneckReport {
        let snapshot = self.bottlenecks.load();
        let bottlenecks: Vec<_> = snapshot
            .bottlenecks
            .iter()
            .filter(|bottleneck| {
                query
                    .min_severity
                    .is_none_or(|min| bottleneck.severity >= min)
            })
            .cloned()
            .collect();

        let mut summary = HashMap::new();
        for bottleneck in &bottlenecks {
            *summary.entry(bottleneck.severity).or_insert(0) += 1;
        }
        // Deduplicated union of the per-bottleneck actions, worst first.
        let mut recommendations = Vec::new();
        for bottleneck in &bottlenecks {
            for action in &bottleneck.suggested_actions {
                if !recommendations.contains(action) {
                    recommendations.push(action.clone());
                }
            }
        }

        BottleneckReport {
            bottlenecks,
            summary,
            recommendations,
        }
    }

    pub fn check_methodology(&self, which: MethodologyFilter) -> MethodologyReport {
        let snapshot = self.methodology.load();
        let scores = match which.selected() {
            None => snapshot.scores.clone(),
            Some(selected) => snapshot
                .scores
                .iter()
                .filter(|(methodology, _)| **methodology == selected)
                .map(|(methodology, score)| (*methodology, score.clone()))
                .collect(),
        };
        MethodologyReport {
            scores,
            overall: snapshot.overall,
            dominant: snapshot.dominant,
            trend: snapshot.trend.clone(),
        }
    }

    pub fn analyze_stage(&self, query: StageQuery) -> StageReport {
        let snapshot = self.stage.load();
        let mut transitions = snapshot.transitions.clone();
        if let Some(limit) = query.history_limit
            && transitions.len() > limit
        {
            transitions.drain(..transitions.len() - limit);
        }

        let time_spent_ms = snapshot
            .first_entered_at
            .iter()
            .filter_map(|(stage, entered)| {
                snapshot
                    .last_active_at
                    .get(stage)
                    .map(|last| (*stage, (*last - *entered).num_milliseconds()))
            })
            .collect();

        StageReport {
            current_stage: snapshot.current,
            confidence: snapshot.confidence,
            sub_stages: snapshot.active_sub_stages.clone(),
            stage_progress: snapshot.stage_progress.clone(),
            transitions,
            time_spent_ms,
            suggestions: snapshot.suggestions.clone(),
        }
    }

    pub fn analyze_ai_collaboration(
        &self,
        tool: Option<String>,
        range: Option<TimeRange>,
    ) -> AiCollabReport {
        let snapshot = self.ai.load();
        let mut usage = (**snapshot).clone();
        if let Some(tool) = &tool {
            usage.per_tool.retain(|name, _| name == tool);
            usage.active_sessions.retain(|session| &session.tool == tool);
        }
        if let Some(range) = range {
            let from = Utc::now() - range.duration();
            usage
                .active_sessions
                .retain(|session| session.last_activity_at >= from);
        }
        AiCollabReport { tool, usage }
    }

    /// Bus-level statistics, exposed for the status surfaces.
    pub fn bus_stats(&self) -> crate::bus::BusStats {
        self.bus.stats()
    }

    pub fn store_handle(&self) -> &Arc<EventStore> {
        &self.store
    }
}

fn recommend(
    aggregates: &MetricsAggregates,
    metrics: &MetricsSnapshot,
) -> Vec<String> {
    let mut recommendations = Vec::new();
    if let Some(rate) = aggregates.test_pass_rate
        && rate < 80.0
    {
        recommendations
            .push("Stabilize failing tests before adding features".to_string());
    }
    if aggregates.test_runs == 0 && aggregates.commits > 0 {
        recommendations
            .push("Commits landed without any test runs in this window".to_string());
    }
    if let Some(summary) = metrics.summary(metric_ids::BUILD_TIME_MS)
        && summary.trend == devlens_model::TrendDirection::Up
        && summary.current > 0.0
    {
        recommendations.push("Build times are trending up".to_string());
    }
    recommendations
}
