//! The persisted path out of the queues: batches land in the store, stage
//! transitions hit their table, and human-readable activity rows are
//! derived for the activity log.

use std::sync::Arc;

use async_trait::async_trait;
use devlens_model::{
    ActivityEntry, AiPayload, Event, EventCategory, EventSeverity, FileAction,
    FilePayload, GitAction, GitPayload, QueueEntry, RunPayload, Stage,
    StagePayload, StageTransition,
};
use tracing::warn;
use uuid::Uuid;

use crate::queue::{BatchProcessor, BatchVerdict};
use crate::store::EventStore;

/// One-line human summary of an event, or None when it isn't worth a log
/// entry (debug noise, unparseable payloads).
pub fn summarize(event: &Event) -> Option<String> {
    match event.category {
        EventCategory::Git => {
            let payload = GitPayload::from_value(&event.data).ok()?;
            match payload.action {
                GitAction::Commit => {
                    let message = payload.message.unwrap_or_default();
                    let subject = message.lines().next().unwrap_or("").trim();
                    Some(format!("Git commit: {subject}"))
                }
                GitAction::Merge => {
                    let branch = payload.branch.unwrap_or_default();
                    Some(format!("Git merge on {branch}"))
                }
                GitAction::BranchCreated => Some(format!(
                    "Git branch created: {}",
                    payload.branch.unwrap_or_default()
                )),
                GitAction::BranchDeleted => Some(format!(
                    "Git branch deleted: {}",
                    payload.branch.unwrap_or_default()
                )),
                GitAction::Pr => Some("Pull request activity".to_string()),
            }
        }
        EventCategory::File => {
            let payload = FilePayload::from_value(&event.data).ok()?;
            let path = payload.new_path.or(payload.old_path)?;
            let verb = match payload.action {
                FileAction::Add => "added",
                FileAction::Modify => "modified",
                FileAction::Delete => "deleted",
                FileAction::Rename => "renamed",
            };
            Some(format!("File {verb}: {path}"))
        }
        EventCategory::Test => {
            let payload = RunPayload::from_value(&event.data).ok()?;
            let outcome = if payload.status.is_ok() { "passed" } else { "failed" };
            Some(format!("Tests {outcome} in {}ms", payload.duration_ms))
        }
        EventCategory::Build => {
            let payload = RunPayload::from_value(&event.data).ok()?;
            let outcome = if payload.status.is_ok() {
                "succeeded"
            } else {
                "failed"
            };
            Some(format!("Build {outcome} in {}ms", payload.duration_ms))
        }
        EventCategory::Ai => {
            let payload = AiPayload::from_value(&event.data).ok()?;
            let what = match payload.accepted {
                Some(true) => "suggestion accepted",
                Some(false) => "suggestion rejected",
                None => match payload.interaction_type {
                    devlens_model::AiInteraction::Prompt => "prompt sent",
                    devlens_model::AiInteraction::Completion => "completion received",
                    devlens_model::AiInteraction::Suggestion => "suggestion offered",
                },
            };
            Some(format!("AI {what} ({})", payload.tool))
        }
        EventCategory::Stage => {
            let payload = StagePayload::from_value(&event.data).ok()?;
            match payload.from_stage {
                Some(from) => {
                    Some(format!("Stage changed: {from} -> {}", payload.to_stage))
                }
                None => Some(format!("Stage detected: {}", payload.to_stage)),
            }
        }
        EventCategory::System if event.severity >= EventSeverity::Warning => {
            Some(format!("System: {}", event.event_type))
        }
        _ => None,
    }
}

fn context_tag_str(tag: devlens_model::ContextTag) -> &'static str {
    match tag {
        devlens_model::ContextTag::Source => "source",
        devlens_model::ContextTag::Test => "test",
        devlens_model::ContextTag::Config => "config",
        devlens_model::ContextTag::Docs => "docs",
        devlens_model::ContextTag::Build => "build",
    }
}

fn stage_transition_from(event: &Event) -> Option<StageTransition> {
    let payload = StagePayload::from_value(&event.data).ok()?;
    Some(StageTransition {
        from: payload.from_stage.as_deref().and_then(Stage::parse),
        to: Stage::parse(&payload.to_stage)?,
        confidence: payload.confidence,
        reason: payload.reason,
        at: event.timestamp,
    })
}

/// Batch processor wired onto the `default`, `priority`, and `batch`
/// queues: the durable, ordered path for every routed event.
pub struct PersistProcessor {
    store: Arc<EventStore>,
}

impl std::fmt::Debug for PersistProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistProcessor").finish()
    }
}

impl PersistProcessor {
    pub fn new(store: Arc<EventStore>) -> Arc<Self> {
        Arc::new(Self { store })
    }
}

#[async_trait]
impl BatchProcessor for PersistProcessor {
    async fn process(&self, batch: &[QueueEntry]) -> BatchVerdict {
        let events: Vec<Event> =
            batch.iter().map(|entry| entry.event.clone()).collect();
        if let Err(err) = self.store.append_batch(&events).await {
            // The batch is atomic at the store level: everything retries.
            warn!(error = %err, len = batch.len(), "persist batch failed");
            return BatchVerdict::fail_all(batch.len(), err.to_string());
        }

        // Derived rows are best-effort: the canonical event row is already
        // durable, so failures here must not re-run the whole batch.
        for event in &events {
            if event.event_type == "stage:transition"
                && let Some(transition) = stage_transition_from(event)
                && let Err(err) =
                    self.store.record_stage_transition(&transition).await
            {
                warn!(error = %err, "failed to record stage transition row");
            }
            if event.category == EventCategory::File
                && let Ok(payload) = FilePayload::from_value(&event.data)
                && let Some(path) = &payload.new_path
                && !payload.is_directory
                && let Err(err) = self
                    .store
                    .update_file_cache(
                        path,
                        payload.size,
                        event.timestamp_ms(),
                        context_tag_str(payload.context_tag),
                    )
                    .await
            {
                warn!(error = %err, "failed to update file identity cache");
            }
            if let Some(summary) = summarize(event) {
                let entry = ActivityEntry {
                    id: Uuid::new_v4(),
                    event_id: event.id,
                    category: event.category,
                    severity: event.severity,
                    summary,
                    at: event.timestamp,
                };
                if let Err(err) = self.store.record_activity(&entry).await {
                    warn!(error = %err, "failed to record activity row");
                }
            }
        }
        BatchVerdict::ok()
    }
}
