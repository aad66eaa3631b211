//! Facade answers assembled from hand-placed snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use devlens_core::analyzer::methodology::MethodologySnapshot;
use devlens_core::analyzer::{BottleneckSnapshot, snapshot_cell};
use devlens_core::api_types::{
    BottleneckQuery, MethodologyFilter, MetricsKind, StageQuery, TimeRange,
};
use devlens_core::bus::{BusConfig, EventBus};
use devlens_core::monitor::MonitorRegistry;
use devlens_core::queue::{QueueManager, QueuesConfig};
use devlens_core::store::{EventStore, StoreConfig};
use devlens_core::{PublishOptions, ToolFacade};
use devlens_model::{
    Bottleneck, BottleneckKind, BottleneckSeverity, Event, EventCategory,
    Methodology, MethodologyScore, Stage, StageSnapshot,
};
use uuid::Uuid;

struct Fixture {
    facade: Arc<ToolFacade>,
    stage: devlens_core::analyzer::SnapshotCell<StageSnapshot>,
    methodology: devlens_core::analyzer::SnapshotCell<MethodologySnapshot>,
    bottlenecks: devlens_core::analyzer::SnapshotCell<BottleneckSnapshot>,
    bus: Arc<EventBus>,
    queues: Arc<QueueManager>,
    _dir: tempfile::TempDir,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        EventStore::open(StoreConfig {
            path: dir.path().join("devlens.db"),
            ..Default::default()
        })
        .await
        .unwrap(),
    );
    let bus = Arc::new(EventBus::new(BusConfig::default()));
    let queues = QueueManager::new(QueuesConfig::default());
    bus.set_router(queues.clone());
    queues.set_event_sink(bus.clone());
    let stage = snapshot_cell::<StageSnapshot>();
    let methodology = snapshot_cell::<MethodologySnapshot>();
    let bottlenecks = snapshot_cell::<BottleneckSnapshot>();
    let facade = ToolFacade::new(
        store,
        bus.clone(),
        queues.clone(),
        MonitorRegistry::new(),
        stage.clone(),
        methodology.clone(),
        snapshot_cell(),
        snapshot_cell(),
        bottlenecks.clone(),
    );
    Fixture {
        facade,
        stage,
        methodology,
        bottlenecks,
        bus,
        queues,
        _dir: dir,
    }
}

#[tokio::test]
async fn project_status_reflects_snapshots() {
    let fixture = fixture().await;
    fixture.stage.store(Arc::new(StageSnapshot {
        current: Some(Stage::Coding),
        confidence: 0.8,
        stage_progress: HashMap::from([(Stage::Prd, 100.0), (Stage::Coding, 35.0)]),
        ..Default::default()
    }));
    fixture.methodology.store(Arc::new(MethodologySnapshot {
        scores: HashMap::from([(
            Methodology::Tdd,
            MethodologyScore { score: 62.0, ..Default::default() },
        )]),
        overall: 62.0,
        dominant: Some(Methodology::Tdd),
        ..Default::default()
    }));

    let status = fixture.facade.get_project_status(false).await.unwrap();
    assert_eq!(status.current_stage, Some(Stage::Coding));
    assert_eq!(status.methodology_scores[&Methodology::Tdd], 62.0);
    assert!(status.recent_activity.is_none());

    let prd = status
        .milestones
        .iter()
        .find(|m| m.stage == Stage::Prd)
        .unwrap();
    assert!(prd.reached);
    let coding = status
        .milestones
        .iter()
        .find(|m| m.stage == Stage::Coding)
        .unwrap();
    assert!(!coding.reached);

    // Reserved queues show up in the status queue map.
    assert!(status.queues.contains_key("default"));
    assert!(status.queues.contains_key("failed"));
}

#[tokio::test]
async fn metrics_report_aggregates_the_requested_window() {
    let fixture = fixture().await;
    for (minutes_ago, message) in [(5, "feat: a"), (10, "fix: b")] {
        let event = Event::builder("git:commit", EventCategory::Git)
            .timestamp(Utc::now() - chrono::Duration::minutes(minutes_ago))
            .source("git-monitor")
            .data(serde_json::json!({
                "action": "commit",
                "hash": format!("{minutes_ago:x}"),
                "message": message,
            }))
            .build();
        fixture
            .bus
            .publish(event, PublishOptions::default())
            .unwrap();
    }
    // Persist through the queue path.
    let persist = devlens_core::activity::PersistProcessor::new(
        fixture.facade.store_handle().clone(),
    );
    for queue in [
        devlens_model::QueueName::Default,
        devlens_model::QueueName::Priority,
        devlens_model::QueueName::Batch,
    ] {
        fixture.queues.set_processor(queue, persist.clone());
    }
    fixture.queues.flush_all().await;

    let report = fixture
        .facade
        .get_metrics(TimeRange::Hour, MetricsKind::Commits)
        .await
        .unwrap();
    assert_eq!(report.period, "1h");
    assert_eq!(report.aggregates.commits, 2);
    assert_eq!(report.aggregates.test_runs, 0);
}

#[tokio::test]
async fn bottleneck_report_filters_by_severity() {
    let fixture = fixture().await;
    let now = Utc.timestamp_millis_opt(1_000).unwrap();
    let make = |severity, location: &str| Bottleneck {
        id: Uuid::new_v4(),
        kind: BottleneckKind::Hotspot,
        severity,
        title: format!("hot {location}"),
        location: location.to_string(),
        impact: 40.0,
        confidence: 0.8,
        frequency: 1,
        first_detected_at: now,
        last_occurred_at: now,
        suggested_actions: vec!["split the file".to_string()],
    };
    fixture.bottlenecks.store(Arc::new(BottleneckSnapshot {
        bottlenecks: vec![
            make(BottleneckSeverity::Low, "a.rs"),
            make(BottleneckSeverity::High, "b.rs"),
        ],
    }));

    let all = fixture.facade.analyze_bottlenecks(BottleneckQuery::default());
    assert_eq!(all.bottlenecks.len(), 2);
    assert_eq!(all.summary[&BottleneckSeverity::High], 1);
    assert_eq!(all.recommendations, vec!["split the file".to_string()]);

    let high_only = fixture.facade.analyze_bottlenecks(BottleneckQuery {
        min_severity: Some(BottleneckSeverity::High),
    });
    assert_eq!(high_only.bottlenecks.len(), 1);
    assert_eq!(high_only.bottlenecks[0].location, "b.rs");
}

#[tokio::test]
async fn methodology_report_can_narrow_to_one() {
    let fixture = fixture().await;
    fixture.methodology.store(Arc::new(MethodologySnapshot {
        scores: HashMap::from([
            (Methodology::Ddd, MethodologyScore { score: 70.0, ..Default::default() }),
            (Methodology::Eda, MethodologyScore { score: 20.0, ..Default::default() }),
        ]),
        overall: 45.0,
        dominant: Some(Methodology::Ddd),
        ..Default::default()
    }));

    let all = fixture.facade.check_methodology(MethodologyFilter::All);
    assert_eq!(all.scores.len(), 2);

    let ddd = fixture.facade.check_methodology(MethodologyFilter::Ddd);
    assert_eq!(ddd.scores.len(), 1);
    assert!(ddd.scores.contains_key(&Methodology::Ddd));
    assert_eq!(ddd.dominant, Some(Methodology::Ddd));
}

#[tokio::test]
async fn stage_report_limits_history_and_derives_time_spent() {
    let fixture = fixture().await;
    let entered = Utc.timestamp_millis_opt(0).unwrap();
    let last = Utc.timestamp_millis_opt(90_000).unwrap();
    fixture.stage.store(Arc::new(StageSnapshot {
        current: Some(Stage::Coding),
        confidence: 0.9,
        transitions: (0..5)
            .map(|i| devlens_model::StageTransition {
                from: None,
                to: Stage::Coding,
                confidence: 0.5,
                reason: format!("t{i}"),
                at: Utc.timestamp_millis_opt(i * 1_000).unwrap(),
            })
            .collect(),
        first_entered_at: HashMap::from([(Stage::Coding, entered)]),
        last_active_at: HashMap::from([(Stage::Coding, last)]),
        ..Default::default()
    }));

    let report = fixture
        .facade
        .analyze_stage(StageQuery { history_limit: Some(2) });
    assert_eq!(report.transitions.len(), 2);
    assert_eq!(report.transitions[1].reason, "t4");
    assert_eq!(report.time_spent_ms[&Stage::Coding], 90_000);
}
