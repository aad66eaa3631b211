//! Analyzer harness: each analyzer owns one worker task fed from the bus
//! firehose through a bounded channel, so a slow analyzer can never block
//! the bus. State is mutated only by the owning worker; queries go through
//! lock-free snapshot cells.

pub mod ai_usage;
pub mod bottleneck;
pub mod methodology;
pub mod metrics;
pub mod stage;
mod stage_rules;

pub use ai_usage::{AiUsageAnalyzer, AiUsageConfig, AiUsageSnapshot};
pub use bottleneck::{
    BottleneckConfig, BottleneckDetector, BottleneckSnapshot,
};
pub use methodology::{
    MethodologyAnalyzer, MethodologyConfig, MethodologySnapshot,
};
pub use metrics::{MetricsCollector, MetricsConfig, MetricsSnapshot};
pub use stage::{StageAnalyzer, StageAnalyzerConfig};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use devlens_model::Event;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::EventBus;

/// Lock-free published snapshot. Workers store, readers load.
pub type SnapshotCell<T> = Arc<ArcSwap<T>>;

pub fn snapshot_cell<T: Default>() -> SnapshotCell<T> {
    Arc::new(ArcSwap::from_pointee(T::default()))
}

/// A consumer of the event stream with rebuildable, process-local state.
pub trait Analyzer: Send + 'static {
    fn name(&self) -> &'static str;

    fn ingest(&mut self, event: &Event);

    /// Periodic housekeeping between events.
    fn tick(&mut self) {}
}

#[derive(Debug)]
pub struct AnalyzerHandle {
    pub name: &'static str,
    task: tokio::task::JoinHandle<()>,
    dropped: Arc<AtomicU64>,
}

impl AnalyzerHandle {
    /// Events this analyzer missed because it lagged the firehose.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

/// Subscribe the analyzer to the firehose and run it on its own task.
///
/// The broadcast channel gives us the drop-oldest overflow policy for free:
/// a lagging worker skips the events it can no longer catch up on and keeps
/// going, which is the right trade for derived telemetry state.
pub fn spawn_analyzer<A: Analyzer>(
    bus: &EventBus,
    mut analyzer: A,
    tick_every: Duration,
    cancel: CancellationToken,
) -> AnalyzerHandle {
    let name = analyzer.name();
    let mut firehose = bus.firehose();
    let dropped = Arc::new(AtomicU64::new(0));
    let dropped_counter = dropped.clone();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(tick_every.max(Duration::from_millis(50)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        debug!(analyzer = name, "analyzer worker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => analyzer.tick(),
                received = firehose.recv() => match received {
                    Ok(event) => analyzer.ingest(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        dropped_counter.fetch_add(skipped, Ordering::Relaxed);
                        warn!(analyzer = name, skipped, "analyzer lagged firehose");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!(analyzer = name, "analyzer worker stopped");
    });

    AnalyzerHandle { name, task, dropped }
}
