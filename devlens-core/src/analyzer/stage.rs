//! Classifies the active development stage from the event stream.
//!
//! Every event scores weighted evidence into a sliding window; the stage
//! with the most evidence becomes the candidate, and a transition fires
//! only past the confidence threshold and outside the cooldown.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use devlens_model::{
    CodingSubStage, Event, EventCategory, EventSeverity, Stage, StagePayload,
    StageSnapshot, StageTransition,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::analyzer::{Analyzer, SnapshotCell, snapshot_cell};
use crate::analyzer::stage_rules::{
    score_stages, score_sub_stages, suggestions_for,
};
use crate::bus::{EventBus, PublishOptions};

pub const ANALYZER_NAME: &str = "stage-analyzer";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct StageAnalyzerConfig {
    /// Minimum share of window evidence the candidate needs to transition.
    pub confidence_threshold: f64,
    #[serde(with = "crate::duration")]
    pub transition_cooldown_ms: u64,
    /// Sliding evidence window.
    #[serde(with = "crate::duration")]
    pub window_ms: u64,
    /// Bounded transition history length.
    pub history_size: usize,
    /// Absolute evidence a sub-stage needs to count as active.
    pub sub_stage_threshold: f64,
}

impl Default for StageAnalyzerConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.4,
            transition_cooldown_ms: 60_000,
            window_ms: 3_600_000,
            history_size: 100,
            sub_stage_threshold: 1.5,
        }
    }
}

#[derive(Debug)]
struct EvidenceEntry<K> {
    at: DateTime<Utc>,
    key: K,
    weight: f64,
}

#[derive(Debug)]
struct EvidenceWindow<K: Copy + Eq + std::hash::Hash> {
    entries: VecDeque<EvidenceEntry<K>>,
    sums: HashMap<K, f64>,
    window: ChronoDuration,
}

impl<K: Copy + Eq + std::hash::Hash> EvidenceWindow<K> {
    fn new(window_ms: u64) -> Self {
        Self {
            entries: VecDeque::new(),
            sums: HashMap::new(),
            window: ChronoDuration::milliseconds(window_ms.max(1) as i64),
        }
    }

    fn add(&mut self, at: DateTime<Utc>, key: K, weight: f64) {
        self.entries.push_back(EvidenceEntry { at, key, weight });
        *self.sums.entry(key).or_insert(0.0) += weight;
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        while let Some(front) = self.entries.front() {
            if front.at >= cutoff {
                break;
            }
            let expired = self.entries.pop_front().expect("front exists");
            if let Some(sum) = self.sums.get_mut(&expired.key) {
                *sum -= expired.weight;
                if *sum <= f64::EPSILON {
                    self.sums.remove(&expired.key);
                }
            }
        }
    }

    fn total(&self) -> f64 {
        self.sums.values().sum()
    }

    fn argmax(&self) -> Option<(K, f64)> {
        self.sums
            .iter()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(key, sum)| (*key, *sum))
    }
}

/// Owns the classifier state; driven by its worker via [`Analyzer`].
pub struct StageAnalyzer {
    config: StageAnalyzerConfig,
    bus: Arc<EventBus>,
    stages: EvidenceWindow<Stage>,
    subs: EvidenceWindow<CodingSubStage>,
    current: Option<Stage>,
    confidence: f64,
    last_transition_at: Option<DateTime<Utc>>,
    transitions: VecDeque<StageTransition>,
    progress: HashMap<Stage, f64>,
    first_entered_at: HashMap<Stage, DateTime<Utc>>,
    last_active_at: HashMap<Stage, DateTime<Utc>>,
    /// Off while historical events rebuild state, so replayed activity
    /// does not re-emit transitions that were already persisted.
    publish_transitions: bool,
    snapshot: SnapshotCell<StageSnapshot>,
}

impl std::fmt::Debug for StageAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageAnalyzer")
            .field("current", &self.current)
            .field("confidence", &self.confidence)
            .field("transitions", &self.transitions.len())
            .finish()
    }
}

impl StageAnalyzer {
    pub fn new(config: StageAnalyzerConfig, bus: Arc<EventBus>) -> Self {
        let window_ms = config.window_ms;
        Self {
            config,
            bus,
            stages: EvidenceWindow::new(window_ms),
            subs: EvidenceWindow::new(window_ms),
            current: None,
            confidence: 0.0,
            last_transition_at: None,
            transitions: VecDeque::new(),
            progress: HashMap::new(),
            first_entered_at: HashMap::new(),
            last_active_at: HashMap::new(),
            publish_transitions: true,
            snapshot: snapshot_cell(),
        }
    }

    pub fn snapshot_cell(&self) -> SnapshotCell<StageSnapshot> {
        self.snapshot.clone()
    }

    pub fn set_publish_transitions(&mut self, on: bool) {
        self.publish_transitions = on;
    }

    fn evaluate(&mut self, now: DateTime<Utc>) {
        self.stages.evict(now);
        self.subs.evict(now);

        let total = self.stages.total();
        let Some((candidate, evidence)) = self.stages.argmax() else {
            self.publish_snapshot();
            return;
        };
        let confidence = if total > 0.0 { evidence / total } else { 0.0 };

        if Some(candidate) == self.current {
            self.confidence = confidence;
            self.publish_snapshot();
            return;
        }
        if confidence < self.config.confidence_threshold {
            self.publish_snapshot();
            return;
        }
        let cooldown =
            ChronoDuration::milliseconds(self.config.transition_cooldown_ms as i64);
        if let Some(last) = self.last_transition_at
            && now - last < cooldown
        {
            debug!(
                candidate = %candidate,
                "stage transition suppressed by cooldown"
            );
            self.publish_snapshot();
            return;
        }

        self.fire_transition(now, candidate, confidence);
        self.publish_snapshot();
    }

    fn fire_transition(
        &mut self,
        now: DateTime<Utc>,
        to: Stage,
        confidence: f64,
    ) {
        let from = self.current;
        let reason = format!(
            "{} leads window evidence ({:.2} confidence)",
            to, confidence
        );
        info!(from = ?from.map(|s| s.as_str()), to = %to, confidence, "stage transition");

        let transition = StageTransition {
            from,
            to,
            confidence,
            reason: reason.clone(),
            at: now,
        };
        self.transitions.push_back(transition);
        while self.transitions.len() > self.config.history_size.max(1) {
            self.transitions.pop_front();
        }
        self.current = Some(to);
        self.confidence = confidence;
        self.last_transition_at = Some(now);
        self.first_entered_at.entry(to).or_insert(now);

        if !self.publish_transitions {
            return;
        }
        let payload = StagePayload {
            from_stage: from.map(|stage| stage.as_str().to_string()),
            to_stage: to.as_str().to_string(),
            confidence,
            reason,
        };
        let event = Event::builder("stage:transition", EventCategory::Stage)
            .severity(EventSeverity::Notice)
            .source(ANALYZER_NAME)
            .timestamp(now)
            .data(payload.to_value())
            .build();
        // Queue routing persists the transition through the store path.
        if let Err(err) = self.bus.publish(event, PublishOptions::default()) {
            warn!(error = %err, "failed to publish stage transition");
        }
    }

    fn publish_snapshot(&self) {
        let active_sub_stages: Vec<CodingSubStage> = CodingSubStage::ALL
            .iter()
            .copied()
            .filter(|sub| {
                self.subs.sums.get(sub).copied().unwrap_or(0.0)
                    >= self.config.sub_stage_threshold
            })
            .collect();
        let snapshot = StageSnapshot {
            current: self.current,
            confidence: self.confidence,
            active_sub_stages,
            stage_progress: self.progress.clone(),
            transitions: self.transitions.iter().cloned().collect(),
            first_entered_at: self.first_entered_at.clone(),
            last_active_at: self.last_active_at.clone(),
            suggestions: self
                .current
                .map(suggestions_for)
                .unwrap_or_default(),
        };
        self.snapshot.store(Arc::new(snapshot));
    }
}

impl Analyzer for StageAnalyzer {
    fn name(&self) -> &'static str {
        ANALYZER_NAME
    }

    fn ingest(&mut self, event: &Event) {
        let now = event.timestamp;
        let scores = score_stages(event);
        for (stage, weight) in &scores {
            self.stages.add(now, *stage, *weight);
            self.last_active_at.insert(*stage, now);
            // Evidence doubles as completion signal: progress accrues
            // towards 100 as a stage keeps seeing activity.
            let progress = self.progress.entry(*stage).or_insert(0.0);
            *progress = (*progress + weight * 2.0).min(100.0);
        }
        for (sub, weight) in score_sub_stages(event) {
            self.subs.add(now, sub, weight);
        }
        if !scores.is_empty() {
            self.evaluate(now);
        }
    }

    fn tick(&mut self) {
        self.evaluate(Utc::now());
    }
}
