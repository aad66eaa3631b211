//! Development stage taxonomy and the classifier's externally visible state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::ts_milliseconds;

/// Ordered development stages, coarse to the whole workflow.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Prd,
    Planning,
    Erd,
    Wireframe,
    ScreenDesign,
    Design,
    Frontend,
    Backend,
    AiCollab,
    Coding,
    Git,
    Deployment,
    Operation,
}

impl Stage {
    pub const ALL: [Stage; 13] = [
        Stage::Prd,
        Stage::Planning,
        Stage::Erd,
        Stage::Wireframe,
        Stage::ScreenDesign,
        Stage::Design,
        Stage::Frontend,
        Stage::Backend,
        Stage::AiCollab,
        Stage::Coding,
        Stage::Git,
        Stage::Deployment,
        Stage::Operation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Prd => "prd",
            Stage::Planning => "planning",
            Stage::Erd => "erd",
            Stage::Wireframe => "wireframe",
            Stage::ScreenDesign => "screen_design",
            Stage::Design => "design",
            Stage::Frontend => "frontend",
            Stage::Backend => "backend",
            Stage::AiCollab => "ai_collab",
            Stage::Coding => "coding",
            Stage::Git => "git",
            Stage::Deployment => "deployment",
            Stage::Operation => "operation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|stage| stage.as_str() == s)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finer-grained coding activities. Non-exclusive: several can be active
/// inside the `coding` stage at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodingSubStage {
    UseCase,
    EventStorming,
    DomainModeling,
    UseCaseDetail,
    AiPromptDesign,
    FirstImplementation,
    BusinessLogic,
    Refactoring,
    UnitTest,
    IntegrationTest,
    E2eTest,
}

impl CodingSubStage {
    pub const ALL: [CodingSubStage; 11] = [
        CodingSubStage::UseCase,
        CodingSubStage::EventStorming,
        CodingSubStage::DomainModeling,
        CodingSubStage::UseCaseDetail,
        CodingSubStage::AiPromptDesign,
        CodingSubStage::FirstImplementation,
        CodingSubStage::BusinessLogic,
        CodingSubStage::Refactoring,
        CodingSubStage::UnitTest,
        CodingSubStage::IntegrationTest,
        CodingSubStage::E2eTest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CodingSubStage::UseCase => "usecase",
            CodingSubStage::EventStorming => "event_storming",
            CodingSubStage::DomainModeling => "domain_modeling",
            CodingSubStage::UseCaseDetail => "usecase_detail",
            CodingSubStage::AiPromptDesign => "ai_prompt_design",
            CodingSubStage::FirstImplementation => "first_implementation",
            CodingSubStage::BusinessLogic => "business_logic",
            CodingSubStage::Refactoring => "refactoring",
            CodingSubStage::UnitTest => "unit_test",
            CodingSubStage::IntegrationTest => "integration_test",
            CodingSubStage::E2eTest => "e2e_test",
        }
    }
}

/// One recorded stage change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTransition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<Stage>,
    pub to: Stage,
    pub confidence: f64,
    pub reason: String,
    #[serde(with = "ts_milliseconds")]
    pub at: DateTime<Utc>,
}

/// Point-in-time view of the stage classifier, cheap to clone and publish.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<Stage>,
    pub confidence: f64,
    pub active_sub_stages: Vec<CodingSubStage>,
    /// 0..=100 per stage, derived from completion-signal rules.
    pub stage_progress: HashMap<Stage, f64>,
    /// Bounded history, newest last.
    pub transitions: Vec<StageTransition>,
    pub first_entered_at: HashMap<Stage, DateTime<Utc>>,
    pub last_active_at: HashMap<Stage, DateTime<Utc>>,
    pub suggestions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(Stage::ScreenDesign).unwrap(),
            serde_json::json!("screen_design")
        );
        assert_eq!(Stage::parse("screen_design"), Some(Stage::ScreenDesign));
        assert_eq!(Stage::parse("nonsense"), None);
    }

    #[test]
    fn stages_are_ordered() {
        assert!(Stage::Prd < Stage::Coding);
        assert!(Stage::Coding < Stage::Operation);
    }
}
