//! Monitors against a real filesystem and a real git repository.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use devlens_core::bus::{BusConfig, EventBus, SubscribeOptions};
use devlens_core::monitor::{
    FileMonitor, FileMonitorConfig, GitMonitor, GitMonitorConfig,
    MonitorRegistry,
};
use devlens_model::{Event, FilePayload, GitPayload};
use tokio_util::sync::CancellationToken;

fn collecting_bus() -> (Arc<EventBus>, Arc<Mutex<Vec<Event>>>) {
    let bus = Arc::new(EventBus::new(BusConfig::default()));
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    bus.subscribe(
        "*",
        Arc::new(move |event: &Event| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        }),
        SubscribeOptions::default(),
    );
    (bus, received)
}

async fn wait_for<F: Fn(&[Event]) -> bool>(
    received: &Arc<Mutex<Vec<Event>>>,
    predicate: F,
) -> bool {
    for _ in 0..100 {
        if predicate(&received.lock().unwrap()) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread")]
async fn file_monitor_reports_changes_with_context_tags() {
    let dir = tempfile::tempdir().unwrap();
    let (bus, received) = collecting_bus();
    let registry = MonitorRegistry::new();

    let handle = FileMonitor::spawn(
        FileMonitorConfig {
            root: dir.path().to_path_buf(),
            debounce_ms: 50,
            ..Default::default()
        },
        bus.clone(),
        registry.clone(),
        CancellationToken::new(),
    );

    // Give the watcher a moment to attach before producing changes.
    tokio::time::sleep(Duration::from_millis(400)).await;
    std::fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();

    let seen = wait_for(&received, |events| {
        events.iter().any(|event| {
            event.event_type.starts_with("file:")
                && FilePayload::from_value(&event.data)
                    .is_ok_and(|p| {
                        p.new_path.unwrap_or_default().ends_with("main.rs")
                    })
        })
    })
    .await;
    assert!(seen, "expected a file event for main.rs");

    let events = received.lock().unwrap().clone();
    let file_event = events
        .iter()
        .find(|event| {
            FilePayload::from_value(&event.data).is_ok_and(|p| {
                p.new_path.unwrap_or_default().ends_with("main.rs")
            })
        })
        .unwrap();
    let payload = FilePayload::from_value(&file_event.data).unwrap();
    assert_eq!(payload.extension, "rs");
    assert_eq!(payload.context_tag, devlens_model::ContextTag::Source);
    assert_eq!(file_event.source, "file-monitor");

    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn file_monitor_skips_ignored_paths() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join("target")).unwrap();
    let (bus, received) = collecting_bus();

    let handle = FileMonitor::spawn(
        FileMonitorConfig {
            root: dir.path().to_path_buf(),
            debounce_ms: 50,
            ..Default::default()
        },
        bus.clone(),
        MonitorRegistry::new(),
        CancellationToken::new(),
    );
    tokio::time::sleep(Duration::from_millis(400)).await;

    std::fs::write(dir.path().join("target/junk.txt"), "x").unwrap();
    std::fs::write(dir.path().join("kept.rs"), "pub fn kept() {}").unwrap();

    let seen = wait_for(&received, |events| {
        events.iter().any(|event| {
            FilePayload::from_value(&event.data).is_ok_and(|p| {
                p.new_path.unwrap_or_default().ends_with("kept.rs")
            })
        })
    })
    .await;
    assert!(seen, "expected the non-ignored file event");

    let events = received.lock().unwrap().clone();
    assert!(
        !events.iter().any(|event| {
            FilePayload::from_value(&event.data).is_ok_and(|p| {
                p.new_path.unwrap_or_default().contains("target/")
            })
        }),
        "ignored tree must not produce events"
    );

    handle.stop().await;
}

fn commit_file(
    repo: &git2::Repository,
    name: &str,
    content: &str,
    message: &str,
) -> git2::Oid {
    let workdir = repo.workdir().unwrap();
    std::fs::write(workdir.join(name), content).unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(std::path::Path::new(name)).unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let signature = git2::Signature::now("dev", "dev@example.com").unwrap();
    let parent = repo
        .head()
        .ok()
        .and_then(|head| head.peel_to_commit().ok());
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    repo.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn git_monitor_emits_commits_after_baseline() {
    let dir = tempfile::tempdir().unwrap();
    let repo = git2::Repository::init(dir.path()).unwrap();
    commit_file(&repo, "a.txt", "one", "chore: initial");

    let (bus, received) = collecting_bus();
    let handle = GitMonitor::spawn(
        GitMonitorConfig {
            repo_path: dir.path().to_path_buf(),
            poll_interval_ms: 100,
            ..Default::default()
        },
        bus.clone(),
        MonitorRegistry::new(),
        CancellationToken::new(),
    );

    // Let the first poll establish the baseline; it must emit nothing.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        received
            .lock()
            .unwrap()
            .iter()
            .all(|event| !event.event_type.starts_with("git:")),
        "baseline scan must stay silent"
    );

    commit_file(&repo, "b.txt", "two", "feat(core): add the thing");

    let seen = wait_for(&received, |events| {
        events.iter().any(|event| event.event_type == "git:commit")
    })
    .await;
    assert!(seen, "expected a git:commit event");

    let events = received.lock().unwrap().clone();
    let commit = events
        .iter()
        .find(|event| event.event_type == "git:commit")
        .unwrap();
    let payload = GitPayload::from_value(&commit.data).unwrap();
    assert_eq!(
        payload.message.as_deref(),
        Some("feat(core): add the thing")
    );
    let analysis = payload.analysis.expect("message analysis attached");
    assert_eq!(analysis.conventional_type.as_deref(), Some("feat"));
    assert_eq!(analysis.scope.as_deref(), Some("core"));
    assert!((0.0..=1.0).contains(&analysis.risk));
    assert!(payload.stats.is_some());

    handle.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn git_monitor_on_a_non_repo_goes_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let (bus, received) = collecting_bus();

    let handle = GitMonitor::spawn(
        GitMonitorConfig {
            repo_path: dir.path().to_path_buf(),
            poll_interval_ms: 50,
            ..Default::default()
        },
        bus.clone(),
        MonitorRegistry::new(),
        CancellationToken::new(),
    );

    let seen = wait_for(&received, |events| {
        events
            .iter()
            .any(|event| event.event_type == "system:monitor_fatal")
    })
    .await;
    assert!(seen, "expected system:monitor_fatal for a non-repository");

    handle.stop().await;
}
