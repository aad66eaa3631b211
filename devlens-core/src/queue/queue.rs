//! A single named, bounded, batched holding area for events.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use devlens_model::{QueueEntry, QueueName};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct QueueConfig {
    /// Entry-count bound; overflow evicts the oldest pending entry.
    pub max_size: usize,
    /// Approximate byte bound for this queue.
    pub max_bytes: usize,
    pub batch_size: usize,
    #[serde(with = "crate::duration")]
    pub flush_interval_ms: u64,
    pub max_attempts: u32,
    /// Per-batch processor timeout; exceeding it counts as a failure.
    #[serde(with = "crate::duration")]
    pub batch_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            max_bytes: 8 * 1024 * 1024,
            batch_size: 64,
            flush_interval_ms: 500,
            max_attempts: 3,
            batch_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatsSnapshot {
    pub depth: usize,
    pub bytes: usize,
    pub enqueued: u64,
    pub processed: u64,
    pub retried: u64,
    pub failed: u64,
    pub dropped: u64,
}

/// Pending entry plus its cached byte cost.
#[derive(Debug)]
pub(crate) struct Queued {
    pub entry: QueueEntry,
    pub bytes: usize,
}

#[derive(Debug, Default)]
struct Inner {
    pending: VecDeque<Queued>,
    bytes: usize,
}

#[derive(Debug)]
pub struct EventQueue {
    name: QueueName,
    config: QueueConfig,
    inner: Mutex<Inner>,
    notify: Notify,
    enqueued: AtomicU64,
    processed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new(name: QueueName, config: QueueConfig) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            enqueued: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Push an entry, evicting oldest pending entries while over either
    /// bound. The new entry is always accepted; evicted entries are
    /// returned so the manager can report them.
    pub(crate) fn push(&self, entry: QueueEntry, bytes: usize) -> Vec<Queued> {
        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock().expect("queue mutex");
            while !inner.pending.is_empty()
                && (inner.pending.len() + 1 > self.config.max_size
                    || inner.bytes + bytes > self.config.max_bytes)
            {
                if let Some(old) = inner.pending.pop_front() {
                    inner.bytes -= old.bytes;
                    evicted.push(old);
                }
            }
            inner.bytes += bytes;
            inner.pending.push_back(Queued { entry, bytes });
        }
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.dropped.fetch_add(evicted.len() as u64, Ordering::Relaxed);
        self.notify.notify_one();
        evicted
    }

    /// Re-admit an entry for retry. Uses the same bounded path as `push`
    /// but does not count as a fresh enqueue.
    pub(crate) fn push_retry(&self, entry: QueueEntry, bytes: usize) -> Vec<Queued> {
        let evicted = self.push(entry, bytes);
        self.enqueued.fetch_sub(1, Ordering::Relaxed);
        self.retried.fetch_add(1, Ordering::Relaxed);
        evicted
    }

    /// True when a batch should be handed to the processor now: either a
    /// full batch is due, or the oldest due entry has waited past the
    /// flush interval.
    pub(crate) fn batch_ready(&self, now: DateTime<Utc>) -> bool {
        let inner = self.inner.lock().expect("queue mutex");
        let due = inner
            .pending
            .iter()
            .filter(|queued| queued.entry.is_due(now))
            .count();
        if due == 0 {
            return false;
        }
        if due >= self.config.batch_size {
            return true;
        }
        let flush = chrono::Duration::milliseconds(self.config.flush_interval_ms as i64);
        inner
            .pending
            .iter()
            .filter(|queued| queued.entry.is_due(now))
            .any(|queued| now - queued.entry.enqueued_at >= flush)
    }

    /// Remove and return up to `limit` entries. `include_deferred` ignores
    /// `next_attempt_at` gating (used by synchronous flushes).
    pub(crate) fn take_batch(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        include_deferred: bool,
    ) -> Vec<Queued> {
        let mut inner = self.inner.lock().expect("queue mutex");
        let mut batch = Vec::new();
        let mut kept = VecDeque::with_capacity(inner.pending.len());
        while let Some(queued) = inner.pending.pop_front() {
            if batch.len() < limit
                && (include_deferred || queued.entry.is_due(now))
            {
                inner.bytes -= queued.bytes;
                batch.push(queued);
            } else {
                kept.push_back(queued);
            }
        }
        inner.pending = kept;
        batch
    }

    /// Sleep budget until the worker should look again: the earliest of the
    /// flush interval and the next deferred retry coming due.
    pub(crate) fn next_wakeup(&self, now: DateTime<Utc>) -> Duration {
        let flush = Duration::from_millis(self.config.flush_interval_ms.max(10));
        let inner = self.inner.lock().expect("queue mutex");
        let next_due = inner
            .pending
            .iter()
            .filter_map(|queued| queued.entry.next_attempt_at)
            .filter(|at| *at > now)
            .min();
        match next_due {
            Some(at) => {
                let until = (at - now).to_std().unwrap_or(Duration::ZERO);
                until.min(flush)
            }
            None => flush,
        }
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await;
    }

    pub(crate) fn record_processed(&self, count: u64) {
        self.processed.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self, count: u64) {
        self.failed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().expect("queue mutex").pending.len()
    }

    pub fn bytes(&self) -> usize {
        self.inner.lock().expect("queue mutex").bytes
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        let (depth, bytes) = {
            let inner = self.inner.lock().expect("queue mutex");
            (inner.pending.len(), inner.bytes)
        };
        QueueStatsSnapshot {
            depth,
            bytes,
            enqueued: self.enqueued.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devlens_model::{Event, EventCategory};

    fn entry(ts_ms: i64) -> (QueueEntry, usize) {
        let event = Event::builder("file:changed", EventCategory::File)
            .timestamp(chrono::TimeZone::timestamp_millis_opt(&Utc, ts_ms).unwrap())
            .data(serde_json::json!({
                "action": "modify", "extension": "rs", "contextTag": "source",
            }))
            .build();
        let bytes = event.approx_bytes();
        (QueueEntry::new(event), bytes)
    }

    #[test]
    fn overflow_evicts_oldest_and_counts_drops() {
        let queue = EventQueue::new(
            QueueName::Default,
            QueueConfig { max_size: 3, ..Default::default() },
        );
        for ts in [1, 2, 3, 4] {
            let (e, bytes) = entry(ts);
            queue.push(e, bytes);
        }
        assert_eq!(queue.depth(), 3);
        assert_eq!(queue.dropped_count(), 1);
        let batch = queue.take_batch(Utc::now(), 10, true);
        let timestamps: Vec<i64> = batch
            .iter()
            .map(|queued| queued.entry.event.timestamp_ms())
            .collect();
        assert_eq!(timestamps, [2, 3, 4]);
    }

    #[test]
    fn take_batch_skips_deferred_entries() {
        let queue = EventQueue::new(QueueName::Default, QueueConfig::default());
        let (mut deferred, bytes) = entry(1);
        deferred.next_attempt_at = Some(Utc::now() + chrono::Duration::hours(1));
        queue.push(deferred, bytes);
        let (due, bytes) = entry(2);
        queue.push(due, bytes);

        let batch = queue.take_batch(Utc::now(), 10, false);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].entry.event.timestamp_ms(), 2);
        assert_eq!(queue.depth(), 1);

        let all = queue.take_batch(Utc::now(), 10, true);
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn byte_accounting_tracks_pushes_and_takes() {
        let queue = EventQueue::new(QueueName::Default, QueueConfig::default());
        let (e1, b1) = entry(1);
        let (e2, b2) = entry(2);
        queue.push(e1, b1);
        queue.push(e2, b2);
        assert_eq!(queue.bytes(), b1 + b2);
        queue.take_batch(Utc::now(), 1, true);
        assert_eq!(queue.bytes(), b2);
    }
}
