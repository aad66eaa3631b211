//! AI-assistant usage tracking: sessions, suggestion outcomes, and a
//! configurable time-saved estimate.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use devlens_model::{AiInteraction, AiPayload, Event, EventCategory};
use serde::{Deserialize, Serialize};

use crate::analyzer::{Analyzer, SnapshotCell, snapshot_cell};

pub const ANALYZER_NAME: &str = "ai-usage-analyzer";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AiUsageConfig {
    /// Idle gap after which a session is considered over.
    #[serde(with = "crate::duration")]
    pub session_gap_ms: u64,
    /// Time-saved estimator: seconds credited per accepted line.
    pub seconds_saved_per_line: f64,
    /// Completed sessions retained for reporting.
    pub session_history: usize,
}

impl Default for AiUsageConfig {
    fn default() -> Self {
        Self {
            session_gap_ms: 15 * 60_000,
            seconds_saved_per_line: 2.0,
            session_history: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiSession {
    pub tool: String,
    #[serde(with = "devlens_model::event::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "devlens_model::event::ts_milliseconds")]
    pub last_activity_at: DateTime<Utc>,
    pub interactions: u64,
    pub suggestions: u64,
    pub accepted: u64,
    pub rejected: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiToolStats {
    pub interactions: u64,
    pub sessions: u64,
    pub suggestions: u64,
    pub accepted: u64,
    pub rejected: u64,
    /// Mean milliseconds from suggestion to decision.
    pub mean_decision_ms: f64,
    pub lines_accepted: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiUsageSnapshot {
    pub per_tool: HashMap<String, AiToolStats>,
    pub active_sessions: Vec<AiSession>,
    pub total_interactions: u64,
    /// Accepted / decided, 0..=1.
    pub acceptance_rate: f64,
    pub estimated_minutes_saved: f64,
    /// Hours of day (0-23) with the most interactions, busiest first.
    pub peak_hours: Vec<u8>,
    /// Interaction types by frequency, most used first.
    pub top_interaction_types: Vec<(AiInteraction, u64)>,
}

struct ActiveSession {
    session: AiSession,
    decision_ms_total: u64,
    decisions: u64,
    lines_accepted: u64,
}

pub struct AiUsageAnalyzer {
    config: AiUsageConfig,
    active: HashMap<String, ActiveSession>,
    completed: VecDeque<AiSession>,
    per_tool: HashMap<String, AiToolStats>,
    hour_histogram: [u64; 24],
    by_type: HashMap<AiInteraction, u64>,
    snapshot: SnapshotCell<AiUsageSnapshot>,
}

impl std::fmt::Debug for AiUsageAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiUsageAnalyzer")
            .field("active_sessions", &self.active.len())
            .field("completed_sessions", &self.completed.len())
            .finish()
    }
}

impl AiUsageAnalyzer {
    pub fn new(config: AiUsageConfig) -> Self {
        Self {
            config,
            active: HashMap::new(),
            completed: VecDeque::new(),
            per_tool: HashMap::new(),
            hour_histogram: [0; 24],
            by_type: HashMap::new(),
            snapshot: snapshot_cell(),
        }
    }

    pub fn snapshot_cell(&self) -> SnapshotCell<AiUsageSnapshot> {
        self.snapshot.clone()
    }

    fn close_idle_sessions(&mut self, now: DateTime<Utc>) {
        let gap = ChronoDuration::milliseconds(self.config.session_gap_ms as i64);
        let idle: Vec<String> = self
            .active
            .iter()
            .filter(|(_, state)| now - state.session.last_activity_at > gap)
            .map(|(tool, _)| tool.clone())
            .collect();
        for tool in idle {
            if let Some(state) = self.active.remove(&tool) {
                self.completed.push_back(state.session);
                while self.completed.len() > self.config.session_history.max(1) {
                    self.completed.pop_front();
                }
            }
        }
    }

    fn ingest_interaction(&mut self, at: DateTime<Utc>, payload: &AiPayload) {
        self.close_idle_sessions(at);
        let tool_stats = self.per_tool.entry(payload.tool.clone()).or_default();
        tool_stats.interactions += 1;
        *self.by_type.entry(payload.interaction_type).or_insert(0) += 1;
        use chrono::Timelike;
        self.hour_histogram[at.hour() as usize % 24] += 1;

        let state = self
            .active
            .entry(payload.tool.clone())
            .or_insert_with(|| {
                tool_stats.sessions += 1;
                ActiveSession {
                    session: AiSession {
                        tool: payload.tool.clone(),
                        started_at: at,
                        last_activity_at: at,
                        interactions: 0,
                        suggestions: 0,
                        accepted: 0,
                        rejected: 0,
                    },
                    decision_ms_total: 0,
                    decisions: 0,
                    lines_accepted: 0,
                }
            });
        state.session.last_activity_at = at;
        state.session.interactions += 1;

        if payload.interaction_type == AiInteraction::Suggestion {
            state.session.suggestions += 1;
            tool_stats.suggestions += 1;
            match payload.accepted {
                Some(true) => {
                    state.session.accepted += 1;
                    tool_stats.accepted += 1;
                    let lines = payload
                        .code_block
                        .as_ref()
                        .map(|code| code.lines().count() as u64)
                        .unwrap_or(1);
                    state.lines_accepted += lines;
                    tool_stats.lines_accepted += lines;
                    state.decision_ms_total += payload.elapsed_ms;
                    state.decisions += 1;
                }
                Some(false) => {
                    state.session.rejected += 1;
                    tool_stats.rejected += 1;
                    state.decision_ms_total += payload.elapsed_ms;
                    state.decisions += 1;
                }
                None => {}
            }
            if state.decisions > 0 {
                tool_stats.mean_decision_ms =
                    state.decision_ms_total as f64 / state.decisions as f64;
            }
        }
    }

    fn publish(&self) {
        let total_interactions: u64 =
            self.per_tool.values().map(|stats| stats.interactions).sum();
        let accepted: u64 =
            self.per_tool.values().map(|stats| stats.accepted).sum();
        let rejected: u64 =
            self.per_tool.values().map(|stats| stats.rejected).sum();
        let decided = accepted + rejected;
        let acceptance_rate = if decided > 0 {
            accepted as f64 / decided as f64
        } else {
            0.0
        };
        let lines_accepted: u64 =
            self.per_tool.values().map(|stats| stats.lines_accepted).sum();
        let estimated_minutes_saved =
            lines_accepted as f64 * self.config.seconds_saved_per_line / 60.0;

        let mut hours: Vec<(u8, u64)> = self
            .hour_histogram
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(hour, count)| (hour as u8, *count))
            .collect();
        hours.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let peak_hours = hours.into_iter().take(3).map(|(hour, _)| hour).collect();

        let mut top_interaction_types: Vec<(AiInteraction, u64)> =
            self.by_type.iter().map(|(kind, count)| (*kind, *count)).collect();
        top_interaction_types.sort_by(|a, b| b.1.cmp(&a.1));

        self.snapshot.store(Arc::new(AiUsageSnapshot {
            per_tool: self.per_tool.clone(),
            active_sessions: self
                .active
                .values()
                .map(|state| state.session.clone())
                .collect(),
            total_interactions,
            acceptance_rate,
            estimated_minutes_saved,
            peak_hours,
            top_interaction_types,
        }));
    }
}

impl Analyzer for AiUsageAnalyzer {
    fn name(&self) -> &'static str {
        ANALYZER_NAME
    }

    fn ingest(&mut self, event: &Event) {
        if event.category != EventCategory::Ai {
            return;
        }
        if let Ok(payload) = AiPayload::from_value(&event.data) {
            self.ingest_interaction(event.timestamp, &payload);
            self.publish();
        }
    }

    fn tick(&mut self) {
        self.close_idle_sessions(Utc::now());
        self.publish();
    }
}
