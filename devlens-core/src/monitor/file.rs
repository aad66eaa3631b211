//! Filesystem change detection: notify watcher, bounded raw channel,
//! debounce pipeline, context tagging.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use devlens_model::{
    Event, EventCategory, EventSeverity, FileAction, FilePayload,
};
use notify::{Event as FsEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use notify::event::{ModifyKind, RenameMode};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{EventBus, PublishOptions};
use crate::monitor::context::PathClassifier;
use crate::monitor::{
    MonitorHandle, MonitorRegistry, MonitorState, emit_fatal, emit_restart,
};

pub const MONITOR_NAME: &str = "file-monitor";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct FileMonitorConfig {
    pub root: PathBuf,
    /// Extra ignore globs on top of the defaults.
    pub ignore: Vec<String>,
    /// Coalescing window: bursts on one path collapse to a single event.
    #[serde(with = "crate::duration")]
    pub debounce_ms: u64,
    pub raw_capacity: usize,
    pub max_restart_attempts: u32,
}

impl Default for FileMonitorConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            ignore: Vec::new(),
            debounce_ms: 250,
            raw_capacity: 4096,
            max_restart_attempts: 5,
        }
    }
}

enum RawSignal {
    Change(FsEvent),
    WatcherError(String),
}

#[derive(Debug)]
struct Pending {
    first_action: FileAction,
    last_action: FileAction,
    old_path: Option<PathBuf>,
    last_seen: Instant,
}

/// Watches a root and publishes `file:*` events.
#[derive(Debug)]
pub struct FileMonitor;

impl FileMonitor {
    pub fn spawn(
        config: FileMonitorConfig,
        bus: Arc<EventBus>,
        registry: Arc<MonitorRegistry>,
        cancel: CancellationToken,
    ) -> MonitorHandle {
        registry.register(MONITOR_NAME);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            run(config, bus, registry, token).await;
        });
        MonitorHandle::new(MONITOR_NAME, cancel, task)
    }
}

async fn run(
    config: FileMonitorConfig,
    bus: Arc<EventBus>,
    registry: Arc<MonitorRegistry>,
    cancel: CancellationToken,
) {
    let classifier = Arc::new(PathClassifier::new(&config.ignore));
    let mut restart_attempts: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            registry.set_state(MONITOR_NAME, MonitorState::Stopped);
            return;
        }
        if !config.root.exists() {
            let reason = format!("watch root missing: {}", config.root.display());
            warn!(monitor = MONITOR_NAME, %reason, "unrecoverable watcher failure");
            registry.set_error(MONITOR_NAME, &reason);
            registry.set_state(MONITOR_NAME, MonitorState::Failed);
            emit_fatal(bus.as_ref(), MONITOR_NAME, &reason);
            return;
        }

        match watch_until_failure(&config, &bus, &classifier, &cancel).await {
            WatchOutcome::Cancelled => {
                registry.set_state(MONITOR_NAME, MonitorState::Stopped);
                return;
            }
            WatchOutcome::Lost(reason) => {
                restart_attempts += 1;
                registry.set_error(MONITOR_NAME, &reason);
                if restart_attempts > config.max_restart_attempts {
                    registry.set_state(MONITOR_NAME, MonitorState::Failed);
                    emit_fatal(bus.as_ref(), MONITOR_NAME, &reason);
                    return;
                }
                registry.set_state(MONITOR_NAME, MonitorState::Restarting);
                emit_restart(bus.as_ref(), MONITOR_NAME, restart_attempts, &reason);
                // Exponential restart delay with a ceiling.
                let delay = Duration::from_millis(
                    (500u64 << restart_attempts.min(6)).min(30_000),
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

enum WatchOutcome {
    Cancelled,
    Lost(String),
}

async fn watch_until_failure(
    config: &FileMonitorConfig,
    bus: &Arc<EventBus>,
    classifier: &Arc<PathClassifier>,
    cancel: &CancellationToken,
) -> WatchOutcome {
    let (raw_tx, mut raw_rx) = mpsc::channel::<RawSignal>(config.raw_capacity.max(64));

    // The notify callback runs on the watcher's thread: cheap work only,
    // everything else happens on our side of the channel.
    let callback_tx = raw_tx.clone();
    let mut watcher: RecommendedWatcher = match notify::recommended_watcher(
        move |result: notify::Result<FsEvent>| {
            let signal = match result {
                Ok(event) => RawSignal::Change(event),
                Err(err) => RawSignal::WatcherError(err.to_string()),
            };
            // Full channel means a change storm; dropping the newest raw
            // notice is acceptable, the debouncer already coalesces.
            let _ = callback_tx.try_send(signal);
        },
    ) {
        Ok(watcher) => watcher,
        Err(err) => return WatchOutcome::Lost(format!("watcher init: {err}")),
    };
    if let Err(err) = watcher.watch(&config.root, RecursiveMode::Recursive) {
        return WatchOutcome::Lost(format!("watch {}: {err}", config.root.display()));
    }
    debug!(root = %config.root.display(), "file watcher running");

    let debounce = Duration::from_millis(config.debounce_ms.max(1));
    let mut pending: HashMap<PathBuf, Pending> = HashMap::new();
    let mut flush_tick = tokio::time::interval(debounce.max(Duration::from_millis(25)));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                flush_pending(bus, classifier, &mut pending, Duration::ZERO);
                return WatchOutcome::Cancelled;
            }
            _ = flush_tick.tick() => {
                flush_pending(bus, classifier, &mut pending, debounce);
            }
            signal = raw_rx.recv() => match signal {
                Some(RawSignal::Change(event)) => {
                    absorb(classifier, &mut pending, event);
                }
                Some(RawSignal::WatcherError(reason)) => {
                    flush_pending(bus, classifier, &mut pending, Duration::ZERO);
                    return WatchOutcome::Lost(reason);
                }
                None => {
                    return WatchOutcome::Lost("raw channel closed".into());
                }
            },
        }
    }
}

fn map_action(kind: &EventKind) -> Option<FileAction> {
    match kind {
        EventKind::Create(_) => Some(FileAction::Add),
        EventKind::Remove(_) => Some(FileAction::Delete),
        EventKind::Modify(ModifyKind::Name(_)) => Some(FileAction::Rename),
        EventKind::Modify(_) => Some(FileAction::Modify),
        _ => None,
    }
}

fn absorb(
    classifier: &PathClassifier,
    pending: &mut HashMap<PathBuf, Pending>,
    event: FsEvent,
) {
    let Some(action) = map_action(&event.kind) else {
        return;
    };

    // A rename notice carrying both paths keys on the new path and
    // remembers the old one; everything else keys on its own path.
    let (path, old_path) = if action == FileAction::Rename
        && matches!(
            event.kind,
            EventKind::Modify(ModifyKind::Name(RenameMode::Both))
        )
        && event.paths.len() >= 2
    {
        (event.paths[1].clone(), Some(event.paths[0].clone()))
    } else {
        match event.paths.first() {
            Some(path) => (path.clone(), None),
            None => return,
        }
    };

    if classifier.is_ignored(&path) {
        return;
    }

    let now = Instant::now();
    pending
        .entry(path)
        .and_modify(|entry| {
            entry.last_action = action;
            entry.last_seen = now;
            if old_path.is_some() {
                entry.old_path = old_path.clone();
            }
        })
        .or_insert(Pending {
            first_action: action,
            last_action: action,
            old_path,
            last_seen: now,
        });
}

/// Resolve a coalesced burst to one action. Create+delete inside the window
/// cancels out entirely (editor temp files).
fn coalesce(first: FileAction, last: FileAction) -> Option<FileAction> {
    match (first, last) {
        (FileAction::Add, FileAction::Delete) => None,
        (FileAction::Add, _) => Some(FileAction::Add),
        (_, FileAction::Delete) => Some(FileAction::Delete),
        (FileAction::Rename, FileAction::Rename) => Some(FileAction::Rename),
        (FileAction::Rename, _) | (_, FileAction::Rename) => Some(FileAction::Rename),
        _ => Some(FileAction::Modify),
    }
}

fn flush_pending(
    bus: &EventBus,
    classifier: &PathClassifier,
    pending: &mut HashMap<PathBuf, Pending>,
    min_age: Duration,
) {
    let now = Instant::now();
    let due: Vec<PathBuf> = pending
        .iter()
        .filter(|(_, entry)| now.duration_since(entry.last_seen) >= min_age)
        .map(|(path, _)| path.clone())
        .collect();

    for path in due {
        let Some(entry) = pending.remove(&path) else {
            continue;
        };
        let Some(action) = coalesce(entry.first_action, entry.last_action) else {
            continue;
        };
        publish_file_event(bus, classifier, &path, entry.old_path.as_deref(), action);
    }
}

fn publish_file_event(
    bus: &EventBus,
    classifier: &PathClassifier,
    path: &Path,
    old_path: Option<&Path>,
    action: FileAction,
) {
    let metadata = std::fs::metadata(path).ok();
    let is_directory = metadata.as_ref().map(|m| m.is_dir()).unwrap_or(false);
    let size = metadata.map(|m| m.len()).unwrap_or(0);
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().into_owned())
        .unwrap_or_default();

    let payload = FilePayload {
        action,
        new_path: Some(path.to_string_lossy().into_owned()),
        old_path: old_path.map(|p| p.to_string_lossy().into_owned()),
        extension,
        size,
        is_directory,
        context_tag: classifier.context_tag(path),
    };

    let event_type = match action {
        FileAction::Add => "file:added",
        FileAction::Modify => "file:changed",
        FileAction::Delete => "file:deleted",
        FileAction::Rename => "file:renamed",
    };

    let event = Event::builder(event_type, EventCategory::File)
        .severity(EventSeverity::Info)
        .source(MONITOR_NAME)
        .data(payload.to_value())
        .build();

    if let Err(err) = bus.publish(event, PublishOptions::default()) {
        warn!(monitor = MONITOR_NAME, error = %err, "failed to publish file event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesce_resolves_bursts() {
        assert_eq!(
            coalesce(FileAction::Modify, FileAction::Modify),
            Some(FileAction::Modify)
        );
        assert_eq!(
            coalesce(FileAction::Add, FileAction::Modify),
            Some(FileAction::Add)
        );
        assert_eq!(coalesce(FileAction::Add, FileAction::Delete), None);
        assert_eq!(
            coalesce(FileAction::Modify, FileAction::Delete),
            Some(FileAction::Delete)
        );
        assert_eq!(
            coalesce(FileAction::Rename, FileAction::Modify),
            Some(FileAction::Rename)
        );
    }

    #[test]
    fn map_action_covers_notify_kinds() {
        use notify::event::{CreateKind, DataChange, RemoveKind};
        assert_eq!(
            map_action(&EventKind::Create(CreateKind::File)),
            Some(FileAction::Add)
        );
        assert_eq!(
            map_action(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Some(FileAction::Modify)
        );
        assert_eq!(
            map_action(&EventKind::Remove(RemoveKind::File)),
            Some(FileAction::Delete)
        );
        assert_eq!(
            map_action(&EventKind::Modify(ModifyKind::Name(RenameMode::Both))),
            Some(FileAction::Rename)
        );
        assert_eq!(
            map_action(&EventKind::Access(notify::event::AccessKind::Any)),
            None
        );
    }
}
