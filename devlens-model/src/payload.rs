//! Per-category payload subschemas.
//!
//! `Event.data` stays an opaque `serde_json::Value` so the store can
//! round-trip it unchanged; these types give the bus a validation boundary
//! and give producers/consumers a typed view.

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::event::EventCategory;

/// What happened to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Add,
    Modify,
    Delete,
    Rename,
}

/// Coarse classification of where a path sits in the project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextTag {
    Source,
    Test,
    Config,
    Docs,
    Build,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePayload {
    pub action: FileAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
    #[serde(default)]
    pub extension: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub is_directory: bool,
    pub context_tag: ContextTag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitAction {
    Commit,
    BranchCreated,
    BranchDeleted,
    Merge,
    Pr,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStats {
    pub adds: u64,
    pub dels: u64,
    pub files: u64,
}

impl CommitStats {
    pub fn churn(&self) -> u64 {
        self.adds + self.dels
    }
}

/// Derived facts about a commit message, attached by the git monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitAnalysis {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conventional_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default)]
    pub breaking: bool,
    /// 0.0 (routine) ..= 1.0 (risky).
    pub risk: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitPayload {
    pub action: GitAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parents: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<CommitStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<CommitAnalysis>,
}

/// Outcome of a test or build run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Passed,
    Failed,
    Success,
}

impl RunStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, RunStatus::Passed | RunStatus::Success)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPayload {
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiInteraction {
    Prompt,
    Completion,
    Suggestion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiPayload {
    /// Assistant name, e.g. `claude`, `copilot`.
    pub tool: String,
    pub interaction_type: AiInteraction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_block: Option<String>,
    #[serde(default)]
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_stage: Option<String>,
    pub to_stage: String,
    /// 0.0 ..= 1.0.
    pub confidence: f64,
    pub reason: String,
}

macro_rules! payload_value_impls {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $ty {
                pub fn to_value(&self) -> serde_json::Value {
                    serde_json::to_value(self)
                        .expect("payload structs serialize infallibly")
                }

                pub fn from_value(value: &serde_json::Value) -> Result<Self> {
                    Ok(serde_json::from_value(value.clone())?)
                }
            }
        )+
    };
}

payload_value_impls!(
    FilePayload,
    GitPayload,
    RunPayload,
    AiPayload,
    StagePayload,
);

fn invalid(category: EventCategory, reason: impl Into<String>) -> ModelError {
    ModelError::InvalidPayload {
        category: category.as_str().to_string(),
        reason: reason.into(),
    }
}

/// Validate `data` against the subschema for `category`.
///
/// Process, api, system, and activity payloads are free-form but must be
/// JSON objects; the remaining categories parse into their typed shapes.
pub fn validate_payload(
    category: EventCategory,
    data: &serde_json::Value,
) -> Result<()> {
    if !data.is_object() {
        return Err(invalid(category, "payload must be a JSON object"));
    }
    match category {
        EventCategory::File => {
            let payload = FilePayload::from_value(data)
                .map_err(|e| invalid(category, e.to_string()))?;
            if payload.action == FileAction::Rename
                && payload.new_path.is_none()
                && payload.old_path.is_none()
            {
                return Err(invalid(category, "rename requires a path"));
            }
            Ok(())
        }
        EventCategory::Git => {
            let payload = GitPayload::from_value(data)
                .map_err(|e| invalid(category, e.to_string()))?;
            if let Some(analysis) = &payload.analysis
                && !(0.0..=1.0).contains(&analysis.risk)
            {
                return Err(invalid(category, "risk must be within 0..=1"));
            }
            Ok(())
        }
        EventCategory::Test | EventCategory::Build => {
            RunPayload::from_value(data)
                .map(|_| ())
                .map_err(|e| invalid(category, e.to_string()))
        }
        EventCategory::Ai => {
            let payload = AiPayload::from_value(data)
                .map_err(|e| invalid(category, e.to_string()))?;
            if payload.tool.is_empty() {
                return Err(invalid(category, "tool must be non-empty"));
            }
            Ok(())
        }
        EventCategory::Stage => {
            let payload = StagePayload::from_value(data)
                .map_err(|e| invalid(category, e.to_string()))?;
            if !(0.0..=1.0).contains(&payload.confidence) {
                return Err(invalid(category, "confidence must be within 0..=1"));
            }
            Ok(())
        }
        EventCategory::Process
        | EventCategory::Api
        | EventCategory::System
        | EventCategory::Activity => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn file_payload_round_trip() {
        let payload = FilePayload {
            action: FileAction::Modify,
            new_path: Some("src/lib.rs".into()),
            old_path: None,
            extension: "rs".into(),
            size: 1024,
            is_directory: false,
            context_tag: ContextTag::Source,
        };
        let value = payload.to_value();
        assert_eq!(value["action"], "modify");
        assert_eq!(value["contextTag"], "source");
        assert_eq!(FilePayload::from_value(&value).unwrap(), payload);
    }

    #[test]
    fn validate_accepts_valid_git_commit() {
        let data = json!({
            "action": "commit",
            "hash": "a1b2",
            "message": "feat(auth): add login",
            "analysis": {"conventionalType": "feat", "scope": "auth", "risk": 0.3},
        });
        validate_payload(EventCategory::Git, &data).expect("valid");
    }

    #[test]
    fn validate_rejects_out_of_range_confidence() {
        let data = json!({"toStage": "coding", "confidence": 1.5, "reason": "x"});
        let err = validate_payload(EventCategory::Stage, &data).unwrap_err();
        assert!(matches!(err, ModelError::InvalidPayload { .. }));
    }

    #[test]
    fn validate_rejects_unknown_file_action() {
        let data = json!({"action": "truncate", "contextTag": "source"});
        assert!(validate_payload(EventCategory::File, &data).is_err());
    }

    #[test]
    fn validate_rejects_non_object_payload() {
        assert!(validate_payload(EventCategory::System, &json!(42)).is_err());
    }

    #[test]
    fn freeform_categories_accept_any_object() {
        let data = json!({"whatever": ["goes", 1, true]});
        validate_payload(EventCategory::Process, &data).expect("free-form");
        validate_payload(EventCategory::Activity, &data).expect("free-form");
    }
}
