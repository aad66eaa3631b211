//! Construction and lifecycle of the whole event plane. No globals: every
//! long-lived value is built here, wired by reference, and torn down in
//! reverse order.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use devlens_model::QueueName;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::activity::PersistProcessor;
use crate::analyzer::{
    AiUsageAnalyzer, AiUsageConfig, Analyzer, AnalyzerHandle, BottleneckConfig,
    BottleneckDetector, MethodologyAnalyzer, MethodologyConfig,
    MetricsCollector, MetricsConfig, StageAnalyzer, StageAnalyzerConfig,
    spawn_analyzer,
};
use crate::bus::{BusConfig, EventBus};
use crate::error::Result;
use crate::facade::ToolFacade;
use crate::monitor::{
    FileMonitor, FileMonitorConfig, GitMonitor, GitMonitorConfig,
    MonitorHandle, MonitorRegistry,
};
use crate::queue::{QueueManager, QueuesConfig};
use crate::store::{EventFilter, EventStore, StoreConfig};
use crate::stream::{StreamConfig, StreamFanout};

/// Write failures tolerated before the runtime gives up on persistence.
const STORE_FATAL_THRESHOLD: u64 = 32;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ColdStartConfig {
    pub enabled: bool,
    /// How far back analyzer state is rebuilt from the store.
    pub days: u32,
    /// Replay budget.
    pub max_events: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RuntimeConfig {
    pub storage: StoreConfig,
    pub bus: BusConfig,
    pub queues: QueuesConfig,
    pub file_monitor: Option<FileMonitorConfig>,
    pub git_monitor: Option<GitMonitorConfig>,
    pub stage_analyzer: StageAnalyzerConfig,
    pub methodology: MethodologyConfig,
    pub ai: AiUsageConfig,
    pub metrics: MetricsConfig,
    pub bottlenecks: BottleneckConfig,
    pub stream: StreamConfig,
    pub cold_start: ColdStartConfig,
}

/// The running event plane.
pub struct Runtime {
    store: Arc<EventStore>,
    bus: Arc<EventBus>,
    queues: Arc<QueueManager>,
    fanout: Arc<StreamFanout>,
    facade: Arc<ToolFacade>,
    monitors: Vec<MonitorHandle>,
    analyzers: Vec<AnalyzerHandle>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("monitors", &self.monitors.len())
            .field("analyzers", &self.analyzers.len())
            .finish()
    }
}

impl Runtime {
    /// Build and start everything: store, bus, queues, analyzers, fan-out,
    /// monitors - in that order.
    pub async fn start(config: RuntimeConfig) -> Result<Runtime> {
        let cancel = CancellationToken::new();

        let store = Arc::new(EventStore::open(config.storage.clone()).await?);
        let queues = QueueManager::new(config.queues.clone());
        let bus = Arc::new(EventBus::new(config.bus.clone()));

        // Narrow-interface wiring breaks the bus <-> queue cycle.
        bus.set_router(queues.clone());
        queues.set_event_sink(bus.clone());
        store.set_event_sink(bus.clone());

        let persist = PersistProcessor::new(store.clone());
        for queue in [QueueName::Default, QueueName::Priority, QueueName::Batch] {
            queues.set_processor(queue, persist.clone());
        }

        // Analyzers are constructed (and cold-started) before their workers
        // spawn, so rebuilt state never races live ingestion.
        let mut stage = StageAnalyzer::new(config.stage_analyzer.clone(), bus.clone());
        let mut methodology = MethodologyAnalyzer::new(config.methodology.clone());
        let mut ai = AiUsageAnalyzer::new(config.ai.clone());
        let mut metrics = MetricsCollector::new(config.metrics.clone());

        let stage_cell = stage.snapshot_cell();
        let methodology_cell = methodology.snapshot_cell();
        let ai_cell = ai.snapshot_cell();
        let metrics_cell = metrics.snapshot_cell();

        let mut bottlenecks = BottleneckDetector::new(
            config.bottlenecks.clone(),
            metrics_cell.clone(),
            stage_cell.clone(),
            queues.clone(),
            bus.clone(),
        );
        let bottleneck_cell = bottlenecks.snapshot_cell();

        if config.cold_start.enabled {
            stage.set_publish_transitions(false);
            let replayed = cold_start_replay(
                &store,
                &config.cold_start,
                &mut [
                    &mut stage,
                    &mut methodology,
                    &mut ai,
                    &mut metrics,
                    &mut bottlenecks,
                ],
            )
            .await?;
            stage.set_publish_transitions(true);
            info!(replayed, "cold start replay complete");
        }

        let mut analyzers = Vec::new();
        let tick = Duration::from_secs(5);
        analyzers.push(spawn_analyzer(&bus, stage, tick, cancel.child_token()));
        analyzers.push(spawn_analyzer(&bus, methodology, tick, cancel.child_token()));
        analyzers.push(spawn_analyzer(&bus, ai, tick, cancel.child_token()));
        analyzers.push(spawn_analyzer(&bus, metrics, tick, cancel.child_token()));
        analyzers.push(spawn_analyzer(
            &bus,
            bottlenecks,
            Duration::from_millis(config.bottlenecks.analyze_interval_ms.max(1_000)),
            cancel.child_token(),
        ));

        let fanout = StreamFanout::new(config.stream.clone());
        let mut tasks = queues.start(&cancel);
        tasks.push(fanout.start(&bus, cancel.child_token()));
        tasks.push(spawn_store_watchdog(store.clone(), cancel.clone()));

        let registry = MonitorRegistry::new();
        let mut monitors = Vec::new();
        if let Some(file_config) = config.file_monitor.clone() {
            monitors.push(FileMonitor::spawn(
                file_config,
                bus.clone(),
                registry.clone(),
                cancel.child_token(),
            ));
        }
        if let Some(git_config) = config.git_monitor.clone() {
            monitors.push(GitMonitor::spawn(
                git_config,
                bus.clone(),
                registry.clone(),
                cancel.child_token(),
            ));
        }

        let facade = ToolFacade::new(
            store.clone(),
            bus.clone(),
            queues.clone(),
            registry,
            stage_cell,
            methodology_cell,
            ai_cell,
            metrics_cell,
            bottleneck_cell,
        );

        info!("event plane started");
        Ok(Runtime {
            store,
            bus,
            queues,
            fanout,
            facade,
            monitors,
            analyzers,
            tasks,
            cancel,
        })
    }

    pub fn facade(&self) -> Arc<ToolFacade> {
        self.facade.clone()
    }

    pub fn fanout(&self) -> Arc<StreamFanout> {
        self.fanout.clone()
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn store(&self) -> Arc<EventStore> {
        self.store.clone()
    }

    pub fn queues(&self) -> Arc<QueueManager> {
        self.queues.clone()
    }

    /// Resolves when the runtime has decided to die (persistence fatal).
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Reverse-order teardown: monitors stop producing, queues drain into
    /// the store, workers wind down, the store closes last.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("event plane shutting down");
        for monitor in self.monitors.drain(..) {
            monitor.stop().await;
        }
        self.queues.flush_all().await;
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        for analyzer in self.analyzers.drain(..) {
            analyzer.stop().await;
        }
        self.store.close().await;
        info!("event plane stopped");
        Ok(())
    }
}

/// Rebuild analyzer state from the store within the configured budget.
async fn cold_start_replay(
    store: &EventStore,
    config: &ColdStartConfig,
    analyzers: &mut [&mut dyn Analyzer],
) -> Result<u64> {
    let to = Utc::now();
    let from = to - chrono::Duration::days(config.days.max(1) as i64);
    let filter = EventFilter {
        limit: Some(config.max_events.max(1)),
        ..Default::default()
    };
    let events = store.find_by_time_range(from, to, &filter).await?;
    for event in &events {
        for analyzer in analyzers.iter_mut() {
            analyzer.ingest(event);
        }
    }
    Ok(events.len() as u64)
}

/// Persistence is the one resource worth dying for: if writes keep
/// failing, stop the plane instead of silently losing history.
fn spawn_store_watchdog(
    store: Arc<EventStore>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            if store.write_failures() >= STORE_FATAL_THRESHOLD {
                warn!(
                    failures = store.write_failures(),
                    "event store keeps failing writes, escalating to shutdown"
                );
                cancel.cancel();
                break;
            }
        }
    })
}
