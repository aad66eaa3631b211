//! Long-lived producers feeding the bus: the file watcher and the git
//! poller, plus the shared status registry and restart plumbing.

pub mod context;
pub mod conventional;
pub mod file;
pub mod git;

pub use context::PathClassifier;
pub use file::{FileMonitor, FileMonitorConfig};
pub use git::{GitMonitor, GitMonitorConfig};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use devlens_model::{Event, EventCategory, EventSeverity};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::sink::SystemEventSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Starting,
    Running,
    Restarting,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStatus {
    pub name: String,
    pub state: MonitorState,
    #[serde(with = "devlens_model::event::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    pub restarts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Shared view of monitor health, consumed by the tool facade.
#[derive(Debug, Default)]
pub struct MonitorRegistry {
    inner: DashMap<String, MonitorStatus>,
}

impl MonitorRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, name: &str) {
        self.inner.insert(
            name.to_string(),
            MonitorStatus {
                name: name.to_string(),
                state: MonitorState::Starting,
                started_at: Utc::now(),
                restarts: 0,
                last_error: None,
            },
        );
    }

    pub fn set_state(&self, name: &str, state: MonitorState) {
        if let Some(mut status) = self.inner.get_mut(name) {
            status.state = state;
            if state == MonitorState::Restarting {
                status.restarts += 1;
            }
        }
    }

    pub fn set_error(&self, name: &str, error: impl Into<String>) {
        if let Some(mut status) = self.inner.get_mut(name) {
            status.last_error = Some(error.into());
        }
    }

    pub fn snapshot(&self) -> Vec<MonitorStatus> {
        let mut statuses: Vec<MonitorStatus> =
            self.inner.iter().map(|entry| entry.value().clone()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }
}

/// Running monitor. Dropping the handle does not stop the task; call
/// [`MonitorHandle::stop`].
#[derive(Debug)]
pub struct MonitorHandle {
    pub name: &'static str,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl MonitorHandle {
    pub(crate) fn new(
        name: &'static str,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    ) -> Self {
        Self { name, cancel, task }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
        info!(monitor = self.name, "monitor stopped");
    }
}

pub(crate) fn emit_restart(
    sink: &dyn SystemEventSink,
    monitor: &str,
    attempt: u32,
    reason: &str,
) {
    sink.emit(
        Event::builder("system:monitor_restart", EventCategory::System)
            .severity(EventSeverity::Warning)
            .source(monitor.to_string())
            .data(serde_json::json!({
                "monitor": monitor,
                "attempt": attempt,
                "reason": reason,
            }))
            .build(),
    );
}

pub(crate) fn emit_fatal(sink: &dyn SystemEventSink, monitor: &str, reason: &str) {
    sink.emit(
        Event::builder("system:monitor_fatal", EventCategory::System)
            .severity(EventSeverity::Error)
            .source(monitor.to_string())
            .data(serde_json::json!({
                "monitor": monitor,
                "reason": reason,
            }))
            .build(),
    );
}
