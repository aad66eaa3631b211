//! Multiplexes the bus to dashboard-style subscribers: per-subscriber
//! filters, delivery throttling, and a bounded replay ring.
//!
//! The ring serves recent-window catch-up only; long-range queries belong
//! to the store.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use devlens_model::{Event, StreamFilter};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::error::{Result, TelemetryError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct StreamConfig {
    /// How far back the replay ring reaches.
    #[serde(with = "crate::duration")]
    pub replay_window_ms: u64,
    /// Hard cap on ring entries.
    pub buffer_size: usize,
    #[serde(with = "crate::duration")]
    pub sweep_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            replay_window_ms: 15 * 60_000,
            buffer_size: 8_192,
            sweep_interval_ms: 30_000,
        }
    }
}

/// Live deliveries flow through the rate gates; replayed ones bypass them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    Live,
    Replay,
}

pub type DeliveryError = Box<dyn std::error::Error + Send + Sync>;
pub type StreamCallback = Arc<
    dyn Fn(&Event, DeliveryKind) -> std::result::Result<(), DeliveryError>
        + Send
        + Sync,
>;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberStats {
    pub delivered: u64,
    pub throttled: u64,
    pub errors: u64,
}

struct Subscriber {
    callback: StreamCallback,
    filter: Mutex<StreamFilter>,
    last_delivery_ms: AtomicI64,
    /// Delivery timestamps inside the sliding one-second window.
    rate_window: Mutex<VecDeque<DateTime<Utc>>>,
    delivered: AtomicU64,
    throttled: AtomicU64,
    errors: AtomicU64,
}

impl Subscriber {
    fn stats(&self) -> SubscriberStats {
        SubscriberStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Fan-out hub. Cheap to clone via `Arc`; one pump task reads the firehose.
pub struct StreamFanout {
    config: StreamConfig,
    subscribers: DashMap<String, Arc<Subscriber>>,
    replay: Mutex<VecDeque<Arc<Event>>>,
}

impl std::fmt::Debug for StreamFanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamFanout")
            .field("subscribers", &self.subscribers.len())
            .field("replay_entries", &self.replay.lock().map(|r| r.len()).unwrap_or(0))
            .finish()
    }
}

impl StreamFanout {
    pub fn new(config: StreamConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            subscribers: DashMap::new(),
            replay: Mutex::new(VecDeque::new()),
        })
    }

    /// Pump the bus firehose into the fan-out until cancelled.
    pub fn start(
        self: &Arc<Self>,
        bus: &EventBus,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let fanout = self.clone();
        let mut firehose = bus.firehose();
        tokio::spawn(async move {
            let sweep = Duration::from_millis(fanout.config.sweep_interval_ms.max(500));
            let mut sweep_tick = tokio::time::interval(sweep);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sweep_tick.tick() => fanout.sweep(Utc::now()),
                    received = firehose.recv() => match received {
                        Ok(event) => fanout.offer(event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "stream fan-out lagged the firehose");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("stream fan-out pump stopped");
        })
    }

    pub fn subscribe(
        &self,
        id: impl Into<String>,
        callback: StreamCallback,
        filter: StreamFilter,
    ) {
        let id = id.into();
        self.subscribers.insert(
            id,
            Arc::new(Subscriber {
                callback,
                filter: Mutex::new(filter),
                last_delivery_ms: AtomicI64::new(i64::MIN),
                rate_window: Mutex::new(VecDeque::new()),
                delivered: AtomicU64::new(0),
                throttled: AtomicU64::new(0),
                errors: AtomicU64::new(0),
            }),
        );
    }

    pub fn unsubscribe(&self, id: &str) -> bool {
        self.subscribers.remove(id).is_some()
    }

    pub fn update_filter(&self, id: &str, filter: StreamFilter) -> Result<()> {
        let subscriber = self.subscribers.get(id).ok_or_else(|| {
            TelemetryError::Internal(format!("no stream subscriber: {id}"))
        })?;
        *subscriber.filter.lock().expect("filter lock") = filter;
        Ok(())
    }

    pub fn subscriber_stats(&self, id: &str) -> Option<SubscriberStats> {
        self.subscribers.get(id).map(|subscriber| subscriber.stats())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Feed one live event: record it for replay, then try every
    /// subscriber through its gates.
    pub fn offer(&self, event: Arc<Event>) {
        {
            let mut ring = self.replay.lock().expect("replay lock");
            ring.push_back(event.clone());
            while ring.len() > self.config.buffer_size.max(1) {
                ring.pop_front();
            }
        }
        for entry in self.subscribers.iter() {
            self.deliver_live(entry.value(), &event);
        }
    }

    fn deliver_live(&self, subscriber: &Subscriber, event: &Arc<Event>) {
        let now = event.timestamp;
        {
            let filter = subscriber.filter.lock().expect("filter lock");
            if !filter.matches(event) {
                return;
            }
            if let Some(min_gap) = filter.min_gap_ms {
                let last = subscriber.last_delivery_ms.load(Ordering::Relaxed);
                if last != i64::MIN
                    && now.timestamp_millis() - last < min_gap as i64
                {
                    subscriber.throttled.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
            if let Some(max_per_sec) = filter.max_per_sec {
                let mut window =
                    subscriber.rate_window.lock().expect("rate lock");
                let second = ChronoDuration::seconds(1);
                while let Some(front) = window.front() {
                    if now - *front >= second {
                        window.pop_front();
                    } else {
                        break;
                    }
                }
                if window.len() >= max_per_sec as usize {
                    subscriber.throttled.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                window.push_back(now);
            }
        }
        subscriber
            .last_delivery_ms
            .store(now.timestamp_millis(), Ordering::Relaxed);
        self.invoke(subscriber, event, DeliveryKind::Live);
    }

    fn invoke(&self, subscriber: &Subscriber, event: &Event, kind: DeliveryKind) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            (subscriber.callback)(event, kind)
        }));
        match outcome {
            Ok(Ok(())) => {
                subscriber.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(err)) => {
                subscriber.errors.fetch_add(1, Ordering::Relaxed);
                debug!(error = %err, "stream subscriber delivery failed");
            }
            Err(_) => {
                subscriber.errors.fetch_add(1, Ordering::Relaxed);
                warn!("stream subscriber callback panicked");
            }
        }
    }

    /// Re-deliver ring events since `since` matching the subscriber's
    /// current filter, oldest first. Exactly once per call; the live rate
    /// gates do not apply.
    pub fn replay(&self, id: &str, since: Option<DateTime<Utc>>) -> Result<usize> {
        let subscriber = self
            .subscribers
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                TelemetryError::Internal(format!("no stream subscriber: {id}"))
            })?;
        let since = since.unwrap_or_else(|| {
            Utc::now()
                - ChronoDuration::milliseconds(self.config.replay_window_ms as i64)
        });

        let matching: Vec<Arc<Event>> = {
            let ring = self.replay.lock().expect("replay lock");
            let filter = subscriber.filter.lock().expect("filter lock");
            ring.iter()
                .filter(|event| event.timestamp >= since)
                .filter(|event| filter.matches(event))
                .cloned()
                .collect()
        };
        let count = matching.len();
        for event in matching {
            self.invoke(&subscriber, &event, DeliveryKind::Replay);
        }
        Ok(count)
    }

    /// Evict expired replay entries and trim idle rate windows.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let horizon =
            now - ChronoDuration::milliseconds(self.config.replay_window_ms as i64);
        {
            let mut ring = self.replay.lock().expect("replay lock");
            while let Some(front) = ring.front() {
                if front.timestamp < horizon {
                    ring.pop_front();
                } else {
                    break;
                }
            }
        }
        for entry in self.subscribers.iter() {
            let mut window = entry.rate_window.lock().expect("rate lock");
            let second = ChronoDuration::seconds(1);
            while let Some(front) = window.front() {
                if now - *front >= second {
                    window.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    pub fn replay_len(&self) -> usize {
        self.replay.lock().expect("replay lock").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use devlens_model::{EventBuilder, EventCategory};

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn event(ms: i64, category: EventCategory) -> Arc<Event> {
        Arc::new(
            EventBuilder::new("file:changed", category)
                .source("file-monitor")
                .timestamp(at(ms))
                .data(serde_json::json!({
                    "action": "modify",
                    "extension": "rs",
                    "contextTag": "source",
                }))
                .build(),
        )
    }

    fn recording_subscriber(
        fanout: &StreamFanout,
        id: &str,
        filter: StreamFilter,
    ) -> Arc<Mutex<Vec<(i64, DeliveryKind)>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        fanout.subscribe(
            id,
            Arc::new(move |event: &Event, kind| {
                sink.lock().unwrap().push((event.timestamp_ms(), kind));
                Ok(())
            }),
            filter,
        );
        log
    }

    #[test]
    fn rate_limit_holds_in_a_sliding_window() {
        let fanout = StreamFanout::new(StreamConfig::default());
        let log = recording_subscriber(
            &fanout,
            "dash",
            StreamFilter { max_per_sec: Some(2), ..Default::default() },
        );
        // Five events inside 200ms: only two live deliveries.
        for ms in [0, 50, 100, 150, 200] {
            fanout.offer(event(ms, EventCategory::File));
        }
        assert_eq!(log.lock().unwrap().len(), 2);
        assert_eq!(fanout.subscriber_stats("dash").unwrap().throttled, 3);

        // The next second opens fresh budget.
        fanout.offer(event(1_200, EventCategory::File));
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[test]
    fn unlimited_subscriber_sees_everything_others_drop() {
        let fanout = StreamFanout::new(StreamConfig::default());
        let limited = recording_subscriber(
            &fanout,
            "limited",
            StreamFilter { max_per_sec: Some(2), ..Default::default() },
        );
        let unlimited =
            recording_subscriber(&fanout, "unlimited", StreamFilter::default());
        for ms in [0, 50, 100, 150, 200] {
            fanout.offer(event(ms, EventCategory::File));
        }
        assert_eq!(limited.lock().unwrap().len(), 2);
        assert_eq!(unlimited.lock().unwrap().len(), 5);
    }

    #[test]
    fn replay_bypasses_rate_limit_and_honors_filter() {
        let fanout = StreamFanout::new(StreamConfig::default());
        let log = recording_subscriber(
            &fanout,
            "dash",
            StreamFilter { max_per_sec: Some(2), ..Default::default() },
        );
        for ms in [0, 50, 100, 150, 200] {
            fanout.offer(event(ms, EventCategory::File));
        }
        log.lock().unwrap().clear();

        let replayed = fanout.replay("dash", Some(at(0))).unwrap();
        assert_eq!(replayed, 5);
        let entries = log.lock().unwrap();
        let timestamps: Vec<i64> = entries.iter().map(|(ts, _)| *ts).collect();
        assert_eq!(timestamps, [0, 50, 100, 150, 200]);
        assert!(entries.iter().all(|(_, kind)| *kind == DeliveryKind::Replay));
    }

    #[test]
    fn replay_applies_the_current_filter() {
        let fanout = StreamFanout::new(StreamConfig::default());
        let log = recording_subscriber(&fanout, "dash", StreamFilter::default());
        fanout.offer(event(0, EventCategory::File));
        fanout.offer(event(
            100,
            EventCategory::System,
        ));
        log.lock().unwrap().clear();

        fanout
            .update_filter(
                "dash",
                StreamFilter {
                    categories: Some(vec![EventCategory::System]),
                    ..Default::default()
                },
            )
            .unwrap();
        let replayed = fanout.replay("dash", Some(at(0))).unwrap();
        assert_eq!(replayed, 1);
        assert_eq!(log.lock().unwrap()[0].0, 100);
    }

    #[test]
    fn min_gap_throttles_rapid_delivery() {
        let fanout = StreamFanout::new(StreamConfig::default());
        let log = recording_subscriber(
            &fanout,
            "dash",
            StreamFilter { min_gap_ms: Some(100), ..Default::default() },
        );
        for ms in [0, 40, 90, 150] {
            fanout.offer(event(ms, EventCategory::File));
        }
        let timestamps: Vec<i64> =
            log.lock().unwrap().iter().map(|(ts, _)| *ts).collect();
        assert_eq!(timestamps, [0, 150]);
    }

    #[test]
    fn failing_subscriber_cannot_stall_others() {
        let fanout = StreamFanout::new(StreamConfig::default());
        fanout.subscribe(
            "broken",
            Arc::new(|_: &Event, _| Err("socket closed".into())),
            StreamFilter::default(),
        );
        let healthy =
            recording_subscriber(&fanout, "healthy", StreamFilter::default());
        for ms in [0, 10, 20] {
            fanout.offer(event(ms, EventCategory::File));
        }
        assert_eq!(healthy.lock().unwrap().len(), 3);
        assert_eq!(fanout.subscriber_stats("broken").unwrap().errors, 3);
    }

    #[test]
    fn sweep_evicts_entries_past_the_window() {
        let fanout = StreamFanout::new(StreamConfig {
            replay_window_ms: 1_000,
            ..Default::default()
        });
        fanout.offer(event(0, EventCategory::File));
        fanout.offer(event(500, EventCategory::File));
        fanout.offer(event(2_000, EventCategory::File));
        fanout.sweep(at(2_100));
        assert_eq!(fanout.replay_len(), 1);
    }
}
