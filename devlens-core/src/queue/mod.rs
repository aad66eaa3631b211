//! Named priority queues, routing rules, batching, retry, and the
//! dead-letter queue.

mod queue;
pub mod retry;
mod router;
mod worker;

pub use queue::{EventQueue, QueueConfig, QueueStatsSnapshot};
pub use router::{RoutingRule, RulePredicate, RuleSet};
pub use worker::{BatchFailure, BatchProcessor, BatchVerdict};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use devlens_model::{Event, EventCategory, EventSeverity, QueueEntry, QueueName};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::EventRouter;
use crate::error::{Result, TelemetryError};
use crate::sink::SystemEventSink;

use queue::Queued;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct QueuesConfig {
    /// Install the stock routing rules at startup.
    pub auto_routing: bool,
    /// Hard cap on queue count, reserved queues included.
    pub max_queues: usize,
    /// Byte budget across all queues; exceeding it fails publish.
    pub global_max_bytes: u64,
    #[serde(with = "crate::duration")]
    pub base_backoff_ms: u64,
    #[serde(with = "crate::duration")]
    pub max_backoff_ms: u64,
    #[serde(with = "crate::duration")]
    pub sweep_interval_ms: u64,
    pub default: QueueConfig,
    pub priority: QueueConfig,
    pub batch: QueueConfig,
    pub failed: QueueConfig,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            auto_routing: true,
            max_queues: 16,
            global_max_bytes: 64 * 1024 * 1024,
            base_backoff_ms: 250,
            max_backoff_ms: 30_000,
            sweep_interval_ms: 10_000,
            default: QueueConfig::default(),
            priority: QueueConfig {
                batch_size: 8,
                flush_interval_ms: 50,
                ..Default::default()
            },
            batch: QueueConfig {
                batch_size: 256,
                flush_interval_ms: 2_000,
                ..Default::default()
            },
            failed: QueueConfig::default(),
        }
    }
}

/// Owns every queue, the routing rules, and the per-queue workers.
pub struct QueueManager {
    queues: DashMap<QueueName, Arc<EventQueue>>,
    processors: DashMap<QueueName, Arc<dyn BatchProcessor>>,
    rules: std::sync::RwLock<RuleSet>,
    sink: std::sync::OnceLock<Arc<dyn SystemEventSink>>,
    global_bytes: AtomicU64,
    config: QueuesConfig,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("queues", &self.queues.len())
            .field("global_bytes", &self.global_bytes.load(Ordering::Relaxed))
            .finish()
    }
}

impl QueueManager {
    pub fn new(config: QueuesConfig) -> Arc<Self> {
        let manager = Arc::new(Self {
            queues: DashMap::new(),
            processors: DashMap::new(),
            rules: std::sync::RwLock::new(RuleSet::default()),
            sink: std::sync::OnceLock::new(),
            global_bytes: AtomicU64::new(0),
            config,
        });
        for (name, cfg) in [
            (QueueName::Default, manager.config.default.clone()),
            (QueueName::Priority, manager.config.priority.clone()),
            (QueueName::Batch, manager.config.batch.clone()),
            (QueueName::Failed, manager.config.failed.clone()),
        ] {
            manager
                .queues
                .insert(name.clone(), Arc::new(EventQueue::new(name, cfg)));
        }
        if manager.config.auto_routing {
            manager.rules.write().expect("rules lock").install_defaults();
        }
        manager
    }

    /// Wire the bus-facing sink for `system:queue_dropped` notices.
    pub fn set_event_sink(&self, sink: Arc<dyn SystemEventSink>) {
        let _ = self.sink.set(sink);
    }

    pub fn add_rule(
        &self,
        name: impl Into<String>,
        priority: i32,
        target: QueueName,
        predicate: RulePredicate,
    ) -> Result<()> {
        if !self.queues.contains_key(&target) {
            return Err(TelemetryError::Queue(format!(
                "routing target does not exist: {target}"
            )));
        }
        self.rules
            .write()
            .expect("rules lock")
            .add(name, priority, target, predicate);
        Ok(())
    }

    pub fn create_queue(&self, name: &str, config: QueueConfig) -> Result<()> {
        let name = QueueName::parse(name);
        if self.queues.contains_key(&name) {
            return Err(TelemetryError::Queue(format!(
                "queue already exists: {name}"
            )));
        }
        if self.queues.len() >= self.config.max_queues {
            return Err(TelemetryError::Queue(format!(
                "queue limit reached ({})",
                self.config.max_queues
            )));
        }
        self.queues
            .insert(name.clone(), Arc::new(EventQueue::new(name, config)));
        Ok(())
    }

    pub fn destroy_queue(&self, name: &str) -> Result<()> {
        let name = QueueName::parse(name);
        if name.is_reserved() {
            return Err(TelemetryError::Queue(format!(
                "cannot destroy reserved queue: {name}"
            )));
        }
        match self.queues.remove(&name) {
            Some((_, queue)) => {
                self.release_bytes(queue.bytes());
                self.processors.remove(&name);
                Ok(())
            }
            None => Err(TelemetryError::Queue(format!("no such queue: {name}"))),
        }
    }

    pub fn set_processor(
        &self,
        name: QueueName,
        processor: Arc<dyn BatchProcessor>,
    ) {
        self.processors.insert(name, processor);
    }

    pub fn queue(&self, name: &QueueName) -> Option<Arc<EventQueue>> {
        self.queues.get(name).map(|entry| entry.clone())
    }

    /// Place an event on a specific queue, enforcing the global byte budget
    /// and the per-queue bounds.
    pub fn enqueue(&self, target: &QueueName, event: &Event) -> Result<()> {
        let queue = self.queue(target).ok_or_else(|| {
            TelemetryError::Queue(format!("no such queue: {target}"))
        })?;
        let bytes = event.approx_bytes();
        let budget = self.config.global_max_bytes;
        if self.global_bytes.load(Ordering::Relaxed) + bytes as u64 > budget {
            return Err(TelemetryError::QueueFull(format!(
                "global queue byte budget exhausted ({budget} bytes)"
            )));
        }
        self.global_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        let evicted = queue.push(QueueEntry::new(event.clone()), bytes);
        self.report_evicted(&queue, evicted);
        Ok(())
    }

    /// Spawn one worker per queue plus the reconciliation sweep.
    pub fn start(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        for entry in self.queues.iter() {
            // The dead-letter queue is terminal: entries rest there for
            // inspection, no worker drains it.
            if *entry.key() == QueueName::Failed {
                continue;
            }
            handles.push(worker::spawn_worker(
                self.clone(),
                entry.value().clone(),
                cancel.child_token(),
            ));
        }
        handles.push(self.spawn_sweep(cancel.child_token()));
        handles
    }

    /// Synchronously drain every queue through its processor, deferred
    /// retries included.
    pub async fn flush_all(&self) {
        let queues: Vec<Arc<EventQueue>> = self
            .queues
            .iter()
            .filter(|entry| *entry.key() != QueueName::Failed)
            .map(|entry| entry.value().clone())
            .collect();
        for queue in queues {
            loop {
                let batch = queue.take_batch(
                    Utc::now(),
                    queue.config().batch_size.max(1),
                    true,
                );
                if batch.is_empty() {
                    break;
                }
                worker::process_batch(self, &queue, batch).await;
            }
        }
    }

    pub fn stats(&self) -> HashMap<String, QueueStatsSnapshot> {
        self.queues
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().stats()))
            .collect()
    }

    /// Total pending entries across live (non-failed) queues.
    pub fn backlog(&self) -> usize {
        self.queues
            .iter()
            .filter(|entry| *entry.key() != QueueName::Failed)
            .map(|entry| entry.value().depth())
            .sum()
    }

    pub fn global_bytes(&self) -> u64 {
        self.global_bytes.load(Ordering::Relaxed)
    }

    // --- worker support ---

    pub(crate) fn processor_for(
        &self,
        name: &QueueName,
    ) -> Option<Arc<dyn BatchProcessor>> {
        self.processors.get(name).map(|entry| entry.clone())
    }

    pub(crate) fn retry_backoff(&self, attempt: u32) -> Duration {
        retry::backoff_with_jitter(
            Duration::from_millis(self.config.base_backoff_ms.max(1)),
            Duration::from_millis(self.config.max_backoff_ms.max(1)),
            attempt,
        )
    }

    pub(crate) fn release_bytes(&self, bytes: usize) {
        let bytes = bytes as u64;
        let mut current = self.global_bytes.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self.global_bytes.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn requeue_for_retry(&self, queue: &EventQueue, queued: Queued) {
        let Queued { entry, bytes } = queued;
        let evicted = queue.push_retry(entry, bytes);
        self.report_evicted(queue, evicted);
    }

    /// Retry exhaustion: ownership transfers to the dead-letter queue with
    /// the last error preserved.
    pub(crate) fn move_to_failed(&self, queued: Queued) {
        let Queued { entry, bytes } = queued;
        warn!(
            event_type = %entry.event.event_type,
            attempts = entry.attempts,
            error = entry.last_error.as_deref().unwrap_or("unknown"),
            "entry exhausted retries, moving to failed queue"
        );
        if let Some(failed) = self.queue(&QueueName::Failed) {
            let evicted = failed.push(entry, bytes);
            self.report_evicted(&failed, evicted);
        } else {
            self.release_bytes(bytes);
        }
    }

    fn report_evicted(&self, queue: &EventQueue, evicted: Vec<Queued>) {
        for queued in evicted {
            self.release_bytes(queued.bytes);
            debug!(
                queue = %queue.name(),
                event_type = %queued.entry.event.event_type,
                "queue overflow, dropped oldest pending entry"
            );
            if let Some(sink) = self.sink.get() {
                sink.emit(
                    Event::builder("system:queue_dropped", EventCategory::System)
                        .severity(EventSeverity::Warning)
                        .source("queue-manager")
                        .data(serde_json::json!({
                            "queue": queue.name().to_string(),
                            "droppedEventId": queued.entry.event.id.to_string(),
                            "droppedEventType": queued.entry.event.event_type,
                            "droppedCount": queue.dropped_count(),
                        }))
                        .build(),
                );
            }
        }
    }

    fn spawn_sweep(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let interval =
                Duration::from_millis(manager.config.sweep_interval_ms.max(100));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                // Reconcile the global byte counter against per-queue truth;
                // retry/eviction races can let it drift.
                let actual: u64 = manager
                    .queues
                    .iter()
                    .map(|entry| entry.value().bytes() as u64)
                    .sum();
                manager.global_bytes.store(actual, Ordering::Relaxed);
            }
        })
    }
}

impl EventRouter for QueueManager {
    fn route(&self, event: &Event) -> Result<()> {
        let target = self.rules.read().expect("rules lock").route(event);
        self.enqueue(&target, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn event(severity: EventSeverity) -> Event {
        Event::builder("git:commit", EventCategory::Git)
            .severity(severity)
            .source("git-monitor")
            .data(serde_json::json!({"action": "commit", "hash": "a1b2"}))
            .build()
    }

    #[test]
    fn reserved_queues_exist_and_cannot_be_destroyed() {
        let manager = QueueManager::new(QueuesConfig::default());
        for name in QueueName::RESERVED {
            assert!(manager.queue(&name).is_some(), "{name} should exist");
        }
        assert!(manager.destroy_queue("priority").is_err());
        manager.create_queue("webhooks", QueueConfig::default()).unwrap();
        manager.destroy_queue("webhooks").unwrap();
    }

    #[test]
    fn queue_limit_is_enforced() {
        let manager = QueueManager::new(QueuesConfig {
            max_queues: 5,
            ..Default::default()
        });
        manager.create_queue("extra", QueueConfig::default()).unwrap();
        let err = manager
            .create_queue("one-too-many", QueueConfig::default())
            .unwrap_err();
        assert!(matches!(err, TelemetryError::Queue(_)));
    }

    #[test]
    fn auto_routing_sends_critical_to_priority() {
        let manager = QueueManager::new(QueuesConfig::default());
        manager.route(&event(EventSeverity::Critical)).unwrap();
        manager.route(&event(EventSeverity::Info)).unwrap();
        assert_eq!(manager.queue(&QueueName::Priority).unwrap().depth(), 1);
        assert_eq!(manager.queue(&QueueName::Default).unwrap().depth(), 1);
    }

    #[test]
    fn global_byte_budget_rejects_publish() {
        let manager = QueueManager::new(QueuesConfig {
            global_max_bytes: 64,
            ..Default::default()
        });
        let err = manager.route(&event(EventSeverity::Info)).unwrap_err();
        assert!(matches!(err, TelemetryError::QueueFull(_)));
    }

    struct FlakyProcessor {
        calls: Mutex<u32>,
        fail_first: u32,
    }

    #[async_trait]
    impl BatchProcessor for FlakyProcessor {
        async fn process(&self, batch: &[QueueEntry]) -> BatchVerdict {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls <= self.fail_first {
                BatchVerdict::fail_all(batch.len(), "transient failure")
            } else {
                BatchVerdict::ok()
            }
        }
    }

    #[tokio::test]
    async fn retry_exhaustion_moves_entry_to_failed() {
        let manager = QueueManager::new(QueuesConfig {
            base_backoff_ms: 1,
            max_backoff_ms: 2,
            default: QueueConfig { max_attempts: 2, ..Default::default() },
            ..Default::default()
        });
        manager.set_processor(
            QueueName::Default,
            Arc::new(FlakyProcessor { calls: Mutex::new(0), fail_first: u32::MAX }),
        );
        manager
            .enqueue(&QueueName::Default, &event(EventSeverity::Info))
            .unwrap();

        // Drain twice: first pass fails (attempt 1), second exhausts.
        manager.flush_all().await;
        manager.flush_all().await;

        let failed = manager.queue(&QueueName::Failed).unwrap();
        assert_eq!(failed.depth(), 1);
        let batch = failed.take_batch(Utc::now(), 10, true);
        assert_eq!(batch[0].entry.attempts, 2);
        assert_eq!(
            batch[0].entry.last_error.as_deref(),
            Some("transient failure")
        );
    }

    struct SlowProcessor;

    #[async_trait]
    impl BatchProcessor for SlowProcessor {
        async fn process(&self, _batch: &[QueueEntry]) -> BatchVerdict {
            tokio::time::sleep(Duration::from_millis(500)).await;
            BatchVerdict::ok()
        }
    }

    #[tokio::test]
    async fn batch_timeout_counts_as_failure() {
        let manager = QueueManager::new(QueuesConfig {
            base_backoff_ms: 1,
            max_backoff_ms: 2,
            default: QueueConfig {
                batch_timeout_ms: 20,
                max_attempts: 1,
                ..Default::default()
            },
            ..Default::default()
        });
        manager.set_processor(QueueName::Default, Arc::new(SlowProcessor));
        manager
            .enqueue(&QueueName::Default, &event(EventSeverity::Info))
            .unwrap();

        manager.flush_all().await;

        let failed = manager.queue(&QueueName::Failed).unwrap();
        assert_eq!(failed.depth(), 1);
        let batch = failed.take_batch(Utc::now(), 10, true);
        assert!(
            batch[0]
                .entry
                .last_error
                .as_deref()
                .unwrap_or("")
                .contains("timed out")
        );
    }

    #[tokio::test]
    async fn transient_failure_retries_then_succeeds() {
        let manager = QueueManager::new(QueuesConfig {
            base_backoff_ms: 1,
            max_backoff_ms: 2,
            default: QueueConfig { max_attempts: 5, ..Default::default() },
            ..Default::default()
        });
        let processor =
            Arc::new(FlakyProcessor { calls: Mutex::new(0), fail_first: 1 });
        manager.set_processor(QueueName::Default, processor.clone());
        manager
            .enqueue(&QueueName::Default, &event(EventSeverity::Info))
            .unwrap();

        manager.flush_all().await;
        manager.flush_all().await;

        let queue = manager.queue(&QueueName::Default).unwrap();
        assert_eq!(queue.depth(), 0);
        assert_eq!(queue.stats().processed, 1);
        assert_eq!(queue.stats().retried, 1);
        assert_eq!(manager.queue(&QueueName::Failed).unwrap().depth(), 0);
    }
}
