//! Per-queue batch workers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use devlens_model::{QueueEntry, QueueName};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::QueueManager;
use super::queue::{EventQueue, Queued};

#[derive(Debug, Clone)]
pub struct BatchFailure {
    pub index: usize,
    pub error: String,
}

/// Outcome of one processor invocation. The batch is delivered atomically;
/// only the entries named in `failures` re-enter the retry path.
#[derive(Debug, Clone, Default)]
pub struct BatchVerdict {
    pub failures: Vec<BatchFailure>,
}

impl BatchVerdict {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn fail_all(len: usize, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            failures: (0..len)
                .map(|index| BatchFailure { index, error: error.clone() })
                .collect(),
        }
    }

    pub fn fail_one(index: usize, error: impl Into<String>) -> Self {
        Self {
            failures: vec![BatchFailure { index, error: error.into() }],
        }
    }
}

#[async_trait]
pub trait BatchProcessor: Send + Sync {
    async fn process(&self, batch: &[QueueEntry]) -> BatchVerdict;
}

pub(crate) fn spawn_worker(
    manager: Arc<QueueManager>,
    queue: Arc<EventQueue>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let name = queue.name().clone();
        debug!(queue = %name, "queue worker started");
        loop {
            let now = Utc::now();
            if queue.batch_ready(now) {
                let batch_size = queue.config().batch_size;
                let batch = queue.take_batch(now, batch_size, false);
                if !batch.is_empty() {
                    process_batch(&manager, &queue, batch).await;
                    continue;
                }
            }
            let wakeup = queue.next_wakeup(now);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = queue.notified() => {}
                _ = tokio::time::sleep(wakeup) => {}
            }
        }
        debug!(queue = %name, "queue worker stopped");
    })
}

pub(crate) async fn process_batch(
    manager: &QueueManager,
    queue: &EventQueue,
    batch: Vec<Queued>,
) {
    let Some(processor) = manager.processor_for(queue.name()) else {
        // No processor registered: nothing consumes this queue, entries
        // simply drain. The failed queue intentionally has none.
        if *queue.name() != QueueName::Failed {
            trace!(queue = %queue.name(), "no processor, discarding batch");
        }
        manager.release_bytes(batch.iter().map(|queued| queued.bytes).sum());
        return;
    };

    let entries: Vec<QueueEntry> =
        batch.iter().map(|queued| queued.entry.clone()).collect();
    let budget = Duration::from_millis(queue.config().batch_timeout_ms.max(1));
    let verdict = match timeout(budget, processor.process(&entries)).await {
        Ok(verdict) => verdict,
        Err(_) => {
            warn!(queue = %queue.name(), len = batch.len(), "batch processor timed out");
            BatchVerdict::fail_all(batch.len(), "batch processing timed out")
        }
    };

    let mut failed_indexes =
        vec![None::<&str>; batch.len()];
    for failure in &verdict.failures {
        if let Some(slot) = failed_indexes.get_mut(failure.index) {
            *slot = Some(failure.error.as_str());
        }
    }

    let now = Utc::now();
    let mut processed = 0u64;
    for (slot, mut queued) in failed_indexes.into_iter().zip(batch) {
        match slot {
            None => {
                processed += 1;
                manager.release_bytes(queued.bytes);
            }
            Some(error) => {
                queued.entry.attempts += 1;
                queued.entry.last_error = Some(error.to_string());
                if queued.entry.attempts >= queue.config().max_attempts {
                    queue.record_failed(1);
                    manager.move_to_failed(queued);
                } else {
                    let delay = manager
                        .retry_backoff(queued.entry.attempts);
                    queued.entry.next_attempt_at =
                        Some(now + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(1)));
                    manager.requeue_for_retry(queue, queued);
                }
            }
        }
    }
    if processed > 0 {
        queue.record_processed(processed);
    }
}
