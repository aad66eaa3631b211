//! Scores DDD/TDD/BDD/EDA adherence from paths, identifiers, commit
//! messages, and test-run timing.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use devlens_model::{
    ContextTag, Event, EventCategory, FilePayload, GitPayload, Methodology,
    MethodologyScore, RunPayload,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::analyzer::{Analyzer, SnapshotCell, snapshot_cell};

pub const ANALYZER_NAME: &str = "methodology-analyzer";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct MethodologyConfig {
    /// How long a test-file edit counts as "test first" for a following
    /// source edit.
    #[serde(with = "crate::duration")]
    pub tdd_pair_window_ms: u64,
    /// Hourly usage counters retained at least this long.
    pub trend_retention_hours: u32,
    /// Points a methodology must lead by to be called dominant.
    pub dominance_margin: f64,
}

impl Default for MethodologyConfig {
    fn default() -> Self {
        Self {
            tdd_pair_window_ms: 15 * 60 * 1000,
            trend_retention_hours: 48,
            dominance_margin: 15.0,
        }
    }
}

static DDD_TOKENS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(entity|value[-_ ]?object|aggregate|repositor(y|ies)|domain[-_ ]?service|bounded[-_ ]?context|ubiquitous)",
    )
    .expect("ddd regex")
});
static BDD_TOKENS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\.feature\b|gherkin|given[-_ ]?when[-_ ]?then|scenario:)")
        .expect("bdd regex")
});
static BDD_STEPS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(given|when|then)\b").expect("bdd steps regex")
});
static EDA_TOKENS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(event[-_ ]?(bus|store|handler|sourcing)|saga|cqrs|projection|command[-_ ]?handler|subscriber)",
    )
    .expect("eda regex")
});
static REFACTOR_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\brefactor").expect("refactor regex"));

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodologyTrend {
    /// Usage counters per methodology over the retained hours, oldest first.
    pub hourly: Vec<(i64, [u64; 4])>,
    /// Growth of the second half vs the first half, percent, per methodology.
    pub growth_pct: HashMap<Methodology, f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodologySnapshot {
    pub scores: HashMap<Methodology, MethodologyScore>,
    pub overall: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dominant: Option<Methodology>,
    pub trend: MethodologyTrend,
}

#[derive(Debug, Default)]
struct Counters {
    ddd_hits: u64,
    ddd_domain_files: u64,
    tdd_test_edits: u64,
    tdd_test_first_pairs: u64,
    tdd_red_green_cycles: u64,
    tdd_test_runs: u64,
    tdd_refactor_after_green: u64,
    bdd_feature_files: u64,
    bdd_step_hits: u64,
    eda_hits: u64,
    source_edits: u64,
}

pub struct MethodologyAnalyzer {
    config: MethodologyConfig,
    counters: Counters,
    /// Recent test-file edits, pruned against the pair window.
    recent_test_edits: VecDeque<DateTime<Utc>>,
    last_failed_run_at: Option<DateTime<Utc>>,
    last_green_at: Option<DateTime<Utc>>,
    hourly: VecDeque<(i64, [u64; 4])>,
    snapshot: SnapshotCell<MethodologySnapshot>,
}

impl std::fmt::Debug for MethodologyAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodologyAnalyzer")
            .field("hours_tracked", &self.hourly.len())
            .finish()
    }
}

impl MethodologyAnalyzer {
    pub fn new(config: MethodologyConfig) -> Self {
        Self {
            config,
            counters: Counters::default(),
            recent_test_edits: VecDeque::new(),
            last_failed_run_at: None,
            last_green_at: None,
            hourly: VecDeque::new(),
            snapshot: snapshot_cell(),
        }
    }

    pub fn snapshot_cell(&self) -> SnapshotCell<MethodologySnapshot> {
        self.snapshot.clone()
    }

    fn bump_hour(&mut self, at: DateTime<Utc>, methodology: Methodology) {
        let hour = at.timestamp() / 3600 * 3600;
        let index = Methodology::ALL
            .iter()
            .position(|m| *m == methodology)
            .unwrap_or(0);
        match self.hourly.back_mut() {
            Some((h, counts)) if *h == hour => counts[index] += 1,
            _ => {
                let mut counts = [0u64; 4];
                counts[index] = 1;
                self.hourly.push_back((hour, counts));
            }
        }
        let keep = self.config.trend_retention_hours.max(24) as usize;
        while self.hourly.len() > keep {
            self.hourly.pop_front();
        }
    }

    fn ingest_file(&mut self, at: DateTime<Utc>, payload: &FilePayload) {
        let path = payload.new_path.clone().unwrap_or_default();

        if DDD_TOKENS.is_match(&path) {
            self.counters.ddd_hits += 1;
            if path.contains("domain/") {
                self.counters.ddd_domain_files += 1;
            }
            self.bump_hour(at, Methodology::Ddd);
        } else if path.contains("domain/") {
            self.counters.ddd_hits += 1;
            self.counters.ddd_domain_files += 1;
            self.bump_hour(at, Methodology::Ddd);
        }
        if BDD_TOKENS.is_match(&path) {
            self.counters.bdd_feature_files += 1;
            self.bump_hour(at, Methodology::Bdd);
        }
        if EDA_TOKENS.is_match(&path) {
            self.counters.eda_hits += 1;
            self.bump_hour(at, Methodology::Eda);
        }

        match payload.context_tag {
            ContextTag::Test => {
                self.counters.tdd_test_edits += 1;
                self.recent_test_edits.push_back(at);
                self.bump_hour(at, Methodology::Tdd);
            }
            ContextTag::Source => {
                self.counters.source_edits += 1;
                let window = ChronoDuration::milliseconds(
                    self.config.tdd_pair_window_ms as i64,
                );
                while let Some(front) = self.recent_test_edits.front() {
                    if at - *front > window {
                        self.recent_test_edits.pop_front();
                    } else {
                        break;
                    }
                }
                // A source edit shortly after a test edit is the TDD beat.
                if self.recent_test_edits.pop_front().is_some() {
                    self.counters.tdd_test_first_pairs += 1;
                    self.bump_hour(at, Methodology::Tdd);
                }
                if let Some(green) = self.last_green_at
                    && REFACTOR_TOKEN.is_match(&path)
                    && at - green < window
                {
                    self.counters.tdd_refactor_after_green += 1;
                }
            }
            _ => {}
        }
    }

    fn ingest_run(&mut self, at: DateTime<Utc>, payload: &RunPayload) {
        self.counters.tdd_test_runs += 1;
        if payload.status.is_ok() {
            if self.last_failed_run_at.is_some() {
                self.counters.tdd_red_green_cycles += 1;
                self.bump_hour(at, Methodology::Tdd);
            }
            self.last_failed_run_at = None;
            self.last_green_at = Some(at);
        } else {
            self.last_failed_run_at = Some(at);
        }
    }

    fn ingest_commit(&mut self, at: DateTime<Utc>, payload: &GitPayload) {
        let message = payload.message.clone().unwrap_or_default();
        if DDD_TOKENS.is_match(&message) {
            self.counters.ddd_hits += 1;
            self.bump_hour(at, Methodology::Ddd);
        }
        if BDD_STEPS.is_match(&message) || BDD_TOKENS.is_match(&message) {
            self.counters.bdd_step_hits += 1;
            self.bump_hour(at, Methodology::Bdd);
        }
        if EDA_TOKENS.is_match(&message) {
            self.counters.eda_hits += 1;
            self.bump_hour(at, Methodology::Eda);
        }
        if REFACTOR_TOKEN.is_match(&message) && self.last_green_at.is_some() {
            self.counters.tdd_refactor_after_green += 1;
        }
    }

    fn score_ddd(&self) -> MethodologyScore {
        let c = &self.counters;
        let score = (c.ddd_hits as f64 * 4.0 + c.ddd_domain_files as f64 * 2.0)
            .min(100.0);
        let mut strengths = Vec::new();
        let mut weaknesses = Vec::new();
        let mut recommendations = Vec::new();
        if c.ddd_domain_files > 0 {
            strengths.push("Domain layer is present and active".to_string());
        }
        if c.ddd_hits >= 10 {
            strengths.push("Tactical DDD building blocks in regular use".to_string());
        } else {
            weaknesses.push("Few entity/aggregate/repository markers".to_string());
            recommendations
                .push("Name domain concepts explicitly in code and commits".to_string());
        }
        MethodologyScore {
            score,
            strengths,
            weaknesses,
            recommendations,
            details: HashMap::from([
                ("token_hits".to_string(), c.ddd_hits),
                ("domain_files".to_string(), c.ddd_domain_files),
            ]),
        }
        .clamped()
    }

    fn score_tdd(&self) -> MethodologyScore {
        let c = &self.counters;
        let score = (c.tdd_test_first_pairs as f64 * 12.0
            + c.tdd_red_green_cycles as f64 * 18.0
            + c.tdd_refactor_after_green as f64 * 8.0
            + (c.tdd_test_edits as f64 * 2.0).min(20.0))
        .min(100.0);
        let mut strengths = Vec::new();
        let mut weaknesses = Vec::new();
        let mut recommendations = Vec::new();
        if c.tdd_test_first_pairs > 0 {
            strengths.push("Tests regularly change before sources".to_string());
        } else if c.source_edits > 10 {
            weaknesses.push("Sources change without preceding tests".to_string());
            recommendations.push("Write the failing test first".to_string());
        }
        if c.tdd_red_green_cycles > 0 {
            strengths.push("Red-green cycles observed in test runs".to_string());
        }
        MethodologyScore {
            score,
            strengths,
            weaknesses,
            recommendations,
            details: HashMap::from([
                ("test_first_pairs".to_string(), c.tdd_test_first_pairs),
                ("red_green_cycles".to_string(), c.tdd_red_green_cycles),
                ("refactor_after_green".to_string(), c.tdd_refactor_after_green),
                ("test_edits".to_string(), c.tdd_test_edits),
                ("test_runs".to_string(), c.tdd_test_runs),
            ]),
        }
        .clamped()
    }

    fn score_bdd(&self) -> MethodologyScore {
        let c = &self.counters;
        let score = (c.bdd_feature_files as f64 * 10.0
            + c.bdd_step_hits as f64 * 4.0)
            .min(100.0);
        let mut strengths = Vec::new();
        let mut recommendations = Vec::new();
        if c.bdd_feature_files > 0 {
            strengths.push("Gherkin feature files in the tree".to_string());
        } else {
            recommendations.push(
                "Describe behaviour as Given/When/Then scenarios".to_string(),
            );
        }
        MethodologyScore {
            score,
            strengths,
            weaknesses: Vec::new(),
            recommendations,
            details: HashMap::from([
                ("feature_files".to_string(), c.bdd_feature_files),
                ("step_hits".to_string(), c.bdd_step_hits),
            ]),
        }
        .clamped()
    }

    fn score_eda(&self) -> MethodologyScore {
        let c = &self.counters;
        let score = (c.eda_hits as f64 * 5.0).min(100.0);
        let mut strengths = Vec::new();
        let mut recommendations = Vec::new();
        if c.eda_hits >= 5 {
            strengths.push("Event/handler vocabulary is established".to_string());
        } else {
            recommendations
                .push("Model cross-module effects as explicit events".to_string());
        }
        MethodologyScore {
            score,
            strengths,
            weaknesses: Vec::new(),
            recommendations,
            details: HashMap::from([("marker_hits".to_string(), c.eda_hits)]),
        }
        .clamped()
    }

    fn recompute(&self) -> MethodologySnapshot {
        let scores = HashMap::from([
            (Methodology::Ddd, self.score_ddd()),
            (Methodology::Tdd, self.score_tdd()),
            (Methodology::Bdd, self.score_bdd()),
            (Methodology::Eda, self.score_eda()),
        ]);

        // Overall averages only the methodologies with any evidence.
        let present: Vec<f64> = scores
            .values()
            .filter(|score| score.score > 0.0)
            .map(|score| score.score)
            .collect();
        let overall = if present.is_empty() {
            0.0
        } else {
            present.iter().sum::<f64>() / present.len() as f64
        };

        let dominant = {
            let mut ranked: Vec<(Methodology, f64)> = scores
                .iter()
                .map(|(methodology, score)| (*methodology, score.score))
                .collect();
            ranked.sort_by(|a, b| {
                b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
            });
            match ranked.as_slice() {
                [(first, top), (_, second), ..]
                    if *top > 0.0 && top - second >= self.config.dominance_margin =>
                {
                    Some(*first)
                }
                _ => None,
            }
        };

        let mut growth_pct = HashMap::new();
        if self.hourly.len() >= 2 {
            let half = self.hourly.len() / 2;
            for (index, methodology) in Methodology::ALL.iter().enumerate() {
                let first: u64 = self
                    .hourly
                    .iter()
                    .take(half)
                    .map(|(_, counts)| counts[index])
                    .sum();
                let second: u64 = self
                    .hourly
                    .iter()
                    .skip(half)
                    .map(|(_, counts)| counts[index])
                    .sum();
                if first > 0 {
                    growth_pct.insert(
                        *methodology,
                        (second as f64 - first as f64) / first as f64 * 100.0,
                    );
                }
            }
        }

        MethodologySnapshot {
            scores,
            overall: overall.clamp(0.0, 100.0),
            dominant,
            trend: MethodologyTrend {
                hourly: self.hourly.iter().cloned().collect(),
                growth_pct,
            },
        }
    }
}

impl Analyzer for MethodologyAnalyzer {
    fn name(&self) -> &'static str {
        ANALYZER_NAME
    }

    fn ingest(&mut self, event: &Event) {
        let at = event.timestamp;
        match event.category {
            EventCategory::File => {
                if let Ok(payload) = FilePayload::from_value(&event.data) {
                    self.ingest_file(at, &payload);
                }
            }
            EventCategory::Test => {
                if let Ok(payload) = RunPayload::from_value(&event.data) {
                    self.ingest_run(at, &payload);
                }
            }
            EventCategory::Git => {
                if let Ok(payload) = GitPayload::from_value(&event.data) {
                    self.ingest_commit(at, &payload);
                }
            }
            _ => return,
        }
        self.snapshot.store(Arc::new(self.recompute()));
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

    fn file_event(ms: i64, path: &str, tag: &str) -> Event {
        EventBuilder::new("file:changed", EventCategory::File)
            .timestamp(at(ms))
            .data(serde_json::json!({
                "action": "modify",
                "newPath": path,
                "extension": "rs",
                "contextTag": tag,
            }))
            .build()
    }

    fn test_run(ms: i64, passed: bool) -> Event {
        EventBuilder::new("test:run", EventCategory::Test)
            .timestamp(at(ms))
            .data(serde_json::json!({
                "status": if passed { "passed" } else { "failed" },
                "durationMs": 1200,
            }))
            .build()
    }

    #[test]
    fn scores_stay_within_bounds() {
        let mut analyzer = MethodologyAnalyzer::new(MethodologyConfig::default());
        for i in 0..500 {
            analyzer.ingest(&file_event(
                i,
                "src/domain/aggregates/order.rs",
                "source",
            ));
        }
        let snapshot = analyzer.snapshot.load();
        for score in snapshot.scores.values() {
            assert!((0.0..=100.0).contains(&score.score));
        }
        assert!((0.0..=100.0).contains(&snapshot.overall));
    }

    #[test]
    fn test_first_pairs_raise_tdd() {
        let mut analyzer = MethodologyAnalyzer::new(MethodologyConfig::default());
        analyzer.ingest(&file_event(0, "tests/order_test.rs", "test"));
        analyzer.ingest(&file_event(60_000, "src/order.rs", "source"));
        let snapshot = analyzer.snapshot.load();
        let tdd = &snapshot.scores[&Methodology::Tdd];
        assert_eq!(tdd.details["test_first_pairs"], 1);
        assert!(tdd.score > 0.0);
    }

    #[test]
    fn red_green_cycle_is_detected() {
        let mut analyzer = MethodologyAnalyzer::new(MethodologyConfig::default());
        analyzer.ingest(&test_run(0, false));
        analyzer.ingest(&test_run(30_000, true));
        let snapshot = analyzer.snapshot.load();
        assert_eq!(
            snapshot.scores[&Methodology::Tdd].details["red_green_cycles"],
            1
        );
    }

    #[test]
    fn dominance_requires_a_clear_margin() {
        let mut analyzer = MethodologyAnalyzer::new(MethodologyConfig::default());
        // Heavy DDD signal only.
        for i in 0..20 {
            analyzer.ingest(&file_event(
                i,
                "src/domain/entity/customer.rs",
                "source",
            ));
        }
        let snapshot = analyzer.snapshot.load();
        assert_eq!(snapshot.dominant, Some(Methodology::Ddd));
    }

    #[test]
    fn commit_messages_feed_eda() {
        let mut analyzer = MethodologyAnalyzer::new(MethodologyConfig::default());
        let commit = EventBuilder::new("git:commit", EventCategory::Git)
            .timestamp(at(0))
            .data(serde_json::json!({
                "action": "commit",
                "hash": "a1",
                "message": "feat: add saga for order event handler",
            }))
            .build();
        analyzer.ingest(&commit);
        let snapshot = analyzer.snapshot.load();
        assert!(snapshot.scores[&Methodology::Eda].score > 0.0);
    }
}
