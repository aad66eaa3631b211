//! Repository polling: list refs, diff against the cached snapshot, emit
//! commit/branch/merge events.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use devlens_model::{
    CommitAnalysis, CommitStats, Event, EventCategory, EventSeverity, GitAction,
    GitPayload,
};
use git2::{BranchType, Repository};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{EventBus, PublishOptions};
use crate::monitor::conventional;
use crate::monitor::{
    MonitorHandle, MonitorRegistry, MonitorState, emit_fatal,
};

pub const MONITOR_NAME: &str = "git-monitor";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct GitMonitorConfig {
    pub repo_path: PathBuf,
    #[serde(with = "crate::duration")]
    pub poll_interval_ms: u64,
    /// Parse commit messages as Conventional Commits and attach analysis.
    pub analyze_messages: bool,
    /// Ceiling on commits reported per tick (bulk fetches, rebases).
    pub max_commits_per_tick: usize,
    pub max_transient_failures: u32,
}

impl Default for GitMonitorConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            poll_interval_ms: 5_000,
            analyze_messages: true,
            max_commits_per_tick: 200,
            max_transient_failures: 10,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct RepoSnapshot {
    /// Local branch name -> head oid (hex).
    branches: HashMap<String, String>,
    baselined: bool,
}

#[derive(Debug)]
struct CommitInfo {
    hash: String,
    message: String,
    author: Option<String>,
    branch: String,
    parents: Vec<String>,
    stats: CommitStats,
    seconds: i64,
}

#[derive(Debug)]
enum RepoChange {
    Commit(CommitInfo),
    BranchCreated(String),
    BranchDeleted(String),
}

#[derive(Debug)]
pub struct GitMonitor;

impl GitMonitor {
    pub fn spawn(
        config: GitMonitorConfig,
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
    config: GitMonitorConfig,
    bus: Arc<EventBus>,
    registry: Arc<MonitorRegistry>,
    cancel: CancellationToken,
) {
    let mut snapshot = RepoSnapshot::default();
    let mut failures: u32 = 0;
    let interval = Duration::from_millis(config.poll_interval_ms.max(100));
    registry.set_state(MONITOR_NAME, MonitorState::Running);

    loop {
        let path = config.repo_path.clone();
        let prev = snapshot.clone();
        let cap = config.max_commits_per_tick;
        let scan = tokio::task::spawn_blocking(move || scan_repo(&path, &prev, cap))
            .await;

        match scan {
            Ok(Ok((next, changes))) => {
                failures = 0;
                snapshot = next;
                publish_changes(&bus, &config, changes);
            }
            Ok(Err(err)) => {
                if is_permanent(&err) {
                    let reason =
                        format!("{} is not a usable repository: {err}",
                            config.repo_path.display());
                    warn!(monitor = MONITOR_NAME, %reason, "stopping git monitor");
                    registry.set_error(MONITOR_NAME, &reason);
                    registry.set_state(MONITOR_NAME, MonitorState::Failed);
                    emit_fatal(bus.as_ref(), MONITOR_NAME, &reason);
                    return;
                }
                failures += 1;
                registry.set_error(MONITOR_NAME, err.message());
                warn!(monitor = MONITOR_NAME, error = %err, failures,
                    "transient git error, backing off");
                if failures > config.max_transient_failures {
                    let reason = format!(
                        "too many consecutive git failures: {err}"
                    );
                    registry.set_state(MONITOR_NAME, MonitorState::Failed);
                    emit_fatal(bus.as_ref(), MONITOR_NAME, &reason);
                    return;
                }
            }
            Err(join_err) => {
                warn!(monitor = MONITOR_NAME, error = %join_err, "git scan task died");
                failures += 1;
            }
        }

        // Transient failures stretch the poll interval exponentially.
        let delay = if failures == 0 {
            interval
        } else {
            interval.saturating_mul(1 << failures.min(5))
        };
        tokio::select! {
            _ = cancel.cancelled() => {
                registry.set_state(MONITOR_NAME, MonitorState::Stopped);
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// "Not a repository" never heals on its own; everything else is assumed
/// transient (locks, concurrent gc, filesystem hiccups).
fn is_permanent(err: &git2::Error) -> bool {
    err.code() == git2::ErrorCode::NotFound
        && matches!(
            err.class(),
            git2::ErrorClass::Repository | git2::ErrorClass::Os
        )
}

/// One blocking poll: list local branches, diff against the previous
/// snapshot, collect new commits oldest first.
fn scan_repo(
    path: &std::path::Path,
    prev: &RepoSnapshot,
    max_commits: usize,
) -> Result<(RepoSnapshot, Vec<RepoChange>), git2::Error> {
    let repo = Repository::open(path)?;
    let mut next = RepoSnapshot {
        branches: HashMap::new(),
        baselined: true,
    };

    for branch in repo.branches(Some(BranchType::Local))? {
        let (branch, _) = branch?;
        let Some(name) = branch.name()?.map(str::to_string) else {
            continue;
        };
        if let Some(oid) = branch.get().target() {
            next.branches.insert(name, oid.to_string());
        }
    }

    let mut changes = Vec::new();

    // First successful scan only establishes the baseline.
    if !prev.baselined {
        debug!(branches = next.branches.len(), "git snapshot baselined");
        return Ok((next, changes));
    }

    for name in next.branches.keys() {
        if !prev.branches.contains_key(name) {
            changes.push(RepoChange::BranchCreated(name.clone()));
        }
    }
    for name in prev.branches.keys() {
        if !next.branches.contains_key(name) {
            changes.push(RepoChange::BranchDeleted(name.clone()));
        }
    }

    let mut seen = HashSet::new();
    let mut commits = Vec::new();
    for (name, oid_hex) in &next.branches {
        if prev.branches.get(name) == Some(oid_hex) {
            continue;
        }
        let oid = git2::Oid::from_str(oid_hex)?;
        let mut walk = repo.revwalk()?;
        walk.push(oid)?;
        for prev_oid in prev.branches.values() {
            // Hiding every previously known head bounds the walk to
            // genuinely new commits.
            if let Ok(old) = git2::Oid::from_str(prev_oid) {
                let _ = walk.hide(old);
            }
        }
        for commit_oid in walk.take(max_commits) {
            let commit_oid = commit_oid?;
            if !seen.insert(commit_oid) {
                continue;
            }
            let commit = repo.find_commit(commit_oid)?;
            commits.push(collect_commit(&repo, &commit, name)?);
            if commits.len() >= max_commits {
                break;
            }
        }
    }
    commits.sort_by_key(|info| info.seconds);
    changes.extend(commits.into_iter().map(RepoChange::Commit));

    Ok((next, changes))
}

fn collect_commit(
    repo: &Repository,
    commit: &git2::Commit<'_>,
    branch: &str,
) -> Result<CommitInfo, git2::Error> {
    let parents: Vec<String> =
        commit.parent_ids().map(|id| id.to_string()).collect();
    let stats = diff_stats(repo, commit)?;
    Ok(CommitInfo {
        hash: commit.id().to_string(),
        message: commit.message().unwrap_or_default().to_string(),
        author: commit.author().name().map(str::to_string),
        branch: branch.to_string(),
        parents,
        stats,
        seconds: commit.time().seconds(),
    })
}

fn diff_stats(
    repo: &Repository,
    commit: &git2::Commit<'_>,
) -> Result<CommitStats, git2::Error> {
    let tree = commit.tree()?;
    let parent_tree = match commit.parent(0) {
        Ok(parent) => Some(parent.tree()?),
        Err(_) => None,
    };
    let diff =
        repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&tree), None)?;
    let stats = diff.stats()?;
    Ok(CommitStats {
        adds: stats.insertions() as u64,
        dels: stats.deletions() as u64,
        files: stats.files_changed() as u64,
    })
}

fn publish_changes(
    bus: &EventBus,
    config: &GitMonitorConfig,
    changes: Vec<RepoChange>,
) {
    for change in changes {
        let (event_type, severity, payload) = match change {
            RepoChange::Commit(info) => commit_payload(config, info),
            RepoChange::BranchCreated(branch) => (
                "git:branch_created",
                EventSeverity::Info,
                GitPayload {
                    action: GitAction::BranchCreated,
                    hash: None,
                    message: None,
                    author: None,
                    branch: Some(branch),
                    parents: None,
                    stats: None,
                    analysis: None,
                },
            ),
            RepoChange::BranchDeleted(branch) => (
                "git:branch_deleted",
                EventSeverity::Info,
                GitPayload {
                    action: GitAction::BranchDeleted,
                    hash: None,
                    message: None,
                    author: None,
                    branch: Some(branch),
                    parents: None,
                    stats: None,
                    analysis: None,
                },
            ),
        };
        let event = Event::builder(event_type, EventCategory::Git)
            .severity(severity)
            .source(MONITOR_NAME)
            .data(payload.to_value())
            .build();
        if let Err(err) = bus.publish(event, PublishOptions::default()) {
            warn!(monitor = MONITOR_NAME, error = %err, "failed to publish git event");
        }
    }
}

fn commit_payload(
    config: &GitMonitorConfig,
    info: CommitInfo,
) -> (&'static str, EventSeverity, GitPayload) {
    let is_merge = info.parents.len() >= 2;
    let analysis = config.analyze_messages.then(|| {
        let conventional = conventional::parse(&info.message);
        CommitAnalysis {
            conventional_type:
                conventional.as_ref().map(|c| c.commit_type.clone()),
            scope: conventional.as_ref().and_then(|c| c.scope.clone()),
            breaking: conventional.as_ref().is_some_and(|c| c.breaking),
            risk: conventional::risk_score(&info.stats, conventional.as_ref()),
        }
    });
    let payload = GitPayload {
        action: if is_merge { GitAction::Merge } else { GitAction::Commit },
        hash: Some(info.hash),
        message: Some(info.message),
        author: info.author,
        branch: Some(info.branch),
        parents: Some(info.parents),
        stats: Some(info.stats),
        analysis,
    };
    if is_merge {
        ("git:merge", EventSeverity::Notice, payload)
    } else {
        ("git:commit", EventSeverity::Info, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_payload_marks_merges_and_attaches_analysis() {
        let config = GitMonitorConfig::default();
        let info = CommitInfo {
            hash: "a1b2".into(),
            message: "feat(auth): add login".into(),
            author: Some("dev".into()),
            branch: "main".into(),
            parents: vec!["p1".into()],
            stats: CommitStats { adds: 10, dels: 2, files: 2 },
            seconds: 0,
        };
        let (event_type, _, payload) = commit_payload(&config, info);
        assert_eq!(event_type, "git:commit");
        assert_eq!(payload.action, GitAction::Commit);
        let analysis = payload.analysis.expect("analysis attached");
        assert_eq!(analysis.conventional_type.as_deref(), Some("feat"));
        assert_eq!(analysis.scope.as_deref(), Some("auth"));
        assert!((0.0..=1.0).contains(&analysis.risk));

        let merge = CommitInfo {
            hash: "c3d4".into(),
            message: "Merge branch 'feature'".into(),
            author: None,
            branch: "main".into(),
            parents: vec!["p1".into(), "p2".into()],
            stats: CommitStats::default(),
            seconds: 1,
        };
        let (event_type, severity, payload) = commit_payload(&config, merge);
        assert_eq!(event_type, "git:merge");
        assert_eq!(severity, EventSeverity::Notice);
        assert_eq!(payload.action, GitAction::Merge);
        assert!(
            payload.analysis.expect("analysis").conventional_type.is_none()
        );
    }

    #[test]
    fn analysis_is_omitted_when_disabled() {
        let config = GitMonitorConfig {
            analyze_messages: false,
            ..Default::default()
        };
        let info = CommitInfo {
            hash: "e5f6".into(),
            message: "fix: crash".into(),
            author: None,
            branch: "main".into(),
            parents: vec![],
            stats: CommitStats::default(),
            seconds: 0,
        };
        let (_, _, payload) = commit_payload(&config, info);
        assert!(payload.analysis.is_none());
    }
}
