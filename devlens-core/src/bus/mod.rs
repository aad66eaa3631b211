//! The single publish point of the event plane.
//!
//! Dispatch to in-process subscribers happens synchronously on the
//! publisher's task, which keeps per-source ordering tight. Heavy consumers
//! (analyzers, the stream fan-out) read the broadcast firehose from their
//! own workers instead of doing work inline.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use devlens_model::{
    Event, EventCategory, EventId, EventSeverity, validate_payload,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Result, TelemetryError};
use crate::sink::SystemEventSink;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct BusConfig {
    /// Reject events whose payload fails the category subschema. When off,
    /// violations are logged and counted but still dispatched.
    pub validate_strict: bool,
    /// Capacity of the broadcast firehose feeding analyzer/fan-out workers.
    pub firehose_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            validate_strict: true,
            firehose_capacity: 2048,
        }
    }
}

/// Routes validated events into the queue layer. Implemented by the queue
/// manager; injected so the bus never depends on queue internals.
pub trait EventRouter: Send + Sync {
    fn route(&self, event: &Event) -> Result<()>;
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type Handler =
    Arc<dyn Fn(&Event) -> std::result::Result<(), HandlerError> + Send + Sync>;
pub type SubscriptionFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub Uuid);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct Subscription {
    id: SubscriptionId,
    /// Literal event type, `*`, or a trailing-`*` prefix like `git:*`.
    pattern: String,
    priority: i32,
    /// Registration order, used to break priority ties.
    seq: u64,
    filter: Option<SubscriptionFilter>,
    handler: Handler,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("priority", &self.priority)
            .field("seq", &self.seq)
            .finish()
    }
}

impl Subscription {
    fn matches(&self, event: &Event) -> bool {
        let type_match = match self.pattern.strip_suffix('*') {
            Some("") => true,
            Some(prefix) => event.event_type.starts_with(prefix),
            None => self.pattern == event.event_type,
        };
        type_match && self.filter.as_ref().is_none_or(|filter| filter(event))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    pub use_queue: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self { use_queue: true }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PublishReceipt {
    pub id: EventId,
    /// Subscribers the event was handed to (failures included).
    pub delivered: usize,
}

#[derive(Default)]
pub struct SubscribeOptions {
    pub priority: i32,
    pub filter: Option<SubscriptionFilter>,
}

impl std::fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("priority", &self.priority)
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusStats {
    pub total_events: u64,
    pub invalid_events: u64,
    pub subscriber_errors: u64,
    pub per_category: std::collections::HashMap<EventCategory, u64>,
    pub per_severity: std::collections::HashMap<EventSeverity, u64>,
    pub subscriber_count: usize,
    pub events_per_hour: f64,
}

/// In-process publish/subscribe dispatcher.
pub struct EventBus {
    subscriptions: ArcSwap<Vec<Arc<Subscription>>>,
    sub_seq: AtomicU64,
    router: std::sync::OnceLock<Arc<dyn EventRouter>>,
    firehose: broadcast::Sender<Arc<Event>>,
    validate_strict: bool,
    started_at: DateTime<Utc>,
    total_events: AtomicU64,
    invalid_events: AtomicU64,
    subscriber_errors: AtomicU64,
    per_category: [AtomicU64; EventCategory::ALL.len()],
    per_severity: [AtomicU64; 6],
    subscriber_count: AtomicUsize,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count.load(Ordering::Relaxed))
            .field("total_events", &self.total_events.load(Ordering::Relaxed))
            .field("firehose_receivers", &self.firehose.receiver_count())
            .finish()
    }
}

fn category_index(category: EventCategory) -> usize {
    EventCategory::ALL
        .iter()
        .position(|c| *c == category)
        .unwrap_or(0)
}

fn severity_index(severity: EventSeverity) -> usize {
    severity as usize
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        let (firehose, _) = broadcast::channel(config.firehose_capacity.max(16));
        Self {
            subscriptions: ArcSwap::from_pointee(Vec::new()),
            sub_seq: AtomicU64::new(0),
            router: std::sync::OnceLock::new(),
            firehose,
            validate_strict: config.validate_strict,
            started_at: Utc::now(),
            total_events: AtomicU64::new(0),
            invalid_events: AtomicU64::new(0),
            subscriber_errors: AtomicU64::new(0),
            per_category: Default::default(),
            per_severity: Default::default(),
            subscriber_count: AtomicUsize::new(0),
        }
    }

    /// Inject the queue router. May be called once; later calls are ignored.
    pub fn set_router(&self, router: Arc<dyn EventRouter>) {
        let _ = self.router.set(router);
    }

    /// Subscribe to the raw event firehose. Slow receivers lag and drop the
    /// oldest unread events rather than blocking publishers.
    pub fn firehose(&self) -> broadcast::Receiver<Arc<Event>> {
        self.firehose.subscribe()
    }

    /// Validate, stamp, dispatch, and (optionally) route one event.
    pub fn publish(
        &self,
        event: Event,
        options: PublishOptions,
    ) -> Result<PublishReceipt> {
        if event.event_type.is_empty() {
            self.invalid_events.fetch_add(1, Ordering::Relaxed);
            return Err(TelemetryError::InvalidEvent(
                "event type must be non-empty".into(),
            ));
        }
        if let Err(err) = validate_payload(event.category, &event.data) {
            self.invalid_events.fetch_add(1, Ordering::Relaxed);
            if self.validate_strict {
                return Err(TelemetryError::InvalidEvent(err.to_string()));
            }
            warn!(event_type = %event.event_type, error = %err,
                "payload failed validation, dispatching anyway (strict off)");
        }

        self.total_events.fetch_add(1, Ordering::Relaxed);
        self.per_category[category_index(event.category)]
            .fetch_add(1, Ordering::Relaxed);
        self.per_severity[severity_index(event.severity)]
            .fetch_add(1, Ordering::Relaxed);

        let delivered = self.dispatch(&event);

        let _ = self.firehose.send(Arc::new(event.clone()));

        if options.use_queue
            && let Some(router) = self.router.get()
        {
            router.route(&event)?;
        }

        Ok(PublishReceipt {
            id: event.id,
            delivered,
        })
    }

    /// Dispatch to the firehose only. Used for cold-start replay so analyzer
    /// workers see historical events without re-persisting them.
    pub fn replay_to_firehose(&self, event: Event) {
        let _ = self.firehose.send(Arc::new(event));
    }

    fn dispatch(&self, event: &Event) -> usize {
        let subscriptions = self.subscriptions.load();
        let mut delivered = 0;
        for subscription in subscriptions.iter() {
            if !subscription.matches(event) {
                continue;
            }
            delivered += 1;
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                (subscription.handler)(event)
            }));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(_) => Some("handler panicked".to_string()),
            };
            if let Some(reason) = failure {
                self.subscriber_errors.fetch_add(1, Ordering::Relaxed);
                warn!(subscription = %subscription.id, event_type = %event.event_type,
                    error = %reason, "subscriber failed, continuing dispatch");
                self.report_subscriber_error(subscription, event, reason);
            }
        }
        delivered
    }

    /// A failing handler must not take the bus down, and reporting the
    /// failure must not recurse through the same failing handler.
    fn report_subscriber_error(
        &self,
        subscription: &Subscription,
        event: &Event,
        reason: String,
    ) {
        if event.event_type == "system:subscriber_error" {
            return;
        }
        let report = Event::builder("system:subscriber_error", EventCategory::System)
            .severity(EventSeverity::Warning)
            .source("event-bus")
            .data(serde_json::json!({
                "subscriptionId": subscription.id.to_string(),
                "pattern": subscription.pattern,
                "failedEventType": event.event_type,
                "reason": reason,
            }))
            .build();
        // Dispatch-only: queue routing of error reports would amplify load
        // exactly when handlers are already failing.
        let _ = self.publish(report, PublishOptions { use_queue: false });
    }

    pub fn subscribe(
        &self,
        pattern: impl Into<String>,
        handler: Handler,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        let subscription = Arc::new(Subscription {
            id,
            pattern: pattern.into(),
            priority: options.priority,
            seq: self.sub_seq.fetch_add(1, Ordering::Relaxed),
            filter: options.filter,
            handler,
        });
        self.subscriptions.rcu(|current| {
            let mut next: Vec<Arc<Subscription>> = current.as_ref().clone();
            next.push(subscription.clone());
            // Kept sorted so dispatch is a plain iteration: priority
            // descending, then registration order.
            next.sort_by(|a, b| {
                b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq))
            });
            next
        });
        self.subscriber_count.fetch_add(1, Ordering::Relaxed);
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut removed = false;
        self.subscriptions.rcu(|current| {
            let next: Vec<Arc<Subscription>> = current
                .iter()
                .filter(|sub| sub.id != id)
                .cloned()
                .collect();
            removed = next.len() != current.len();
            next
        });
        if removed {
            self.subscriber_count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn subscriber_errors(&self) -> u64 {
        self.subscriber_errors.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> BusStats {
        let total = self.total_events.load(Ordering::Relaxed);
        let elapsed_hours = (Utc::now() - self.started_at)
            .num_milliseconds()
            .max(1) as f64
            / 3_600_000.0;
        let mut per_category = std::collections::HashMap::new();
        for (i, category) in EventCategory::ALL.iter().enumerate() {
            let count = self.per_category[i].load(Ordering::Relaxed);
            if count > 0 {
                per_category.insert(*category, count);
            }
        }
        let severities = [
            EventSeverity::Debug,
            EventSeverity::Info,
            EventSeverity::Notice,
            EventSeverity::Warning,
            EventSeverity::Error,
            EventSeverity::Critical,
        ];
        let mut per_severity = std::collections::HashMap::new();
        for severity in severities {
            let count =
                self.per_severity[severity_index(severity)].load(Ordering::Relaxed);
            if count > 0 {
                per_severity.insert(severity, count);
            }
        }
        BusStats {
            total_events: total,
            invalid_events: self.invalid_events.load(Ordering::Relaxed),
            subscriber_errors: self.subscriber_errors.load(Ordering::Relaxed),
            per_category,
            per_severity,
            subscriber_count: self.subscriber_count.load(Ordering::Relaxed),
            events_per_hour: total as f64 / elapsed_hours.max(1.0 / 60.0),
        }
    }
}

impl SystemEventSink for EventBus {
    fn emit(&self, event: Event) {
        if let Err(err) = self.publish(event, PublishOptions { use_queue: false }) {
            warn!(error = %err, "failed to emit internal system event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devlens_model::EventBuilder;
    use std::sync::Mutex;

    fn bus() -> EventBus {
        EventBus::new(BusConfig::default())
    }

    fn file_event(ts_ms: i64) -> Event {
        EventBuilder::new("file:changed", EventCategory::File)
            .source("file-monitor")
            .timestamp(
                chrono::TimeZone::timestamp_millis_opt(&Utc, ts_ms).unwrap(),
            )
            .data(serde_json::json!({
                "action": "modify",
                "extension": "rs",
                "contextTag": "source",
            }))
            .build()
    }

    fn collector(
        log: Arc<Mutex<Vec<String>>>,
        tag: &'static str,
    ) -> Handler {
        Arc::new(move |event: &Event| {
            log.lock().unwrap().push(format!("{tag}:{}", event.event_type));
            Ok(())
        })
    }

    #[test]
    fn rejects_invalid_payload_when_strict() {
        let bus = bus();
        let event = EventBuilder::new("file:changed", EventCategory::File)
            .data(serde_json::json!({"action": "explode"}))
            .build();
        let err = bus.publish(event, PublishOptions::default()).unwrap_err();
        assert!(matches!(err, TelemetryError::InvalidEvent(_)));
        assert_eq!(bus.stats().invalid_events, 1);
        assert_eq!(bus.stats().total_events, 0);
    }

    #[test]
    fn dispatches_in_priority_order_with_registration_tiebreak() {
        let bus = bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            "*",
            collector(log.clone(), "low"),
            SubscribeOptions { priority: 0, filter: None },
        );
        bus.subscribe(
            "file:changed",
            collector(log.clone(), "high"),
            SubscribeOptions { priority: 10, filter: None },
        );
        bus.subscribe(
            "*",
            collector(log.clone(), "low2"),
            SubscribeOptions { priority: 0, filter: None },
        );

        let receipt = bus
            .publish(file_event(1_000), PublishOptions::default())
            .unwrap();
        assert_eq!(receipt.delivered, 3);
        assert_eq!(
            log.lock().unwrap().as_slice(),
            [
                "high:file:changed".to_string(),
                "low:file:changed".to_string(),
                "low2:file:changed".to_string(),
            ]
        );
    }

    #[test]
    fn prefix_patterns_match_their_family_only() {
        let bus = bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            "git:*",
            collector(log.clone(), "git"),
            SubscribeOptions::default(),
        );

        bus.publish(file_event(1), PublishOptions::default()).unwrap();
        let commit = EventBuilder::new("git:commit", EventCategory::Git)
            .source("git-monitor")
            .data(serde_json::json!({"action": "commit", "hash": "a1b2"}))
            .build();
        bus.publish(commit, PublishOptions::default()).unwrap();

        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["git:git:commit".to_string()]
        );
    }

    #[test]
    fn failing_subscriber_is_isolated() {
        let bus = bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            "*",
            Arc::new(|_event: &Event| Err("boom".into())),
            SubscribeOptions { priority: 5, filter: None },
        );
        bus.subscribe(
            "*",
            collector(log.clone(), "ok"),
            SubscribeOptions::default(),
        );

        for ts in [1, 2, 3] {
            bus.publish(file_event(ts), PublishOptions::default()).unwrap();
        }
        // The healthy handler saw every event despite its noisy neighbour.
        assert_eq!(
            log.lock()
                .unwrap()
                .iter()
                .filter(|line| line.starts_with("ok:file"))
                .count(),
            3
        );
        assert_eq!(bus.stats().subscriber_errors, 3);
    }

    #[test]
    fn panicking_subscriber_is_isolated() {
        let bus = bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(
            "*",
            Arc::new(|_event: &Event| panic!("handler bug")),
            SubscribeOptions { priority: 5, filter: None },
        );
        bus.subscribe(
            "*",
            collector(log.clone(), "ok"),
            SubscribeOptions::default(),
        );
        bus.publish(file_event(1), PublishOptions::default()).unwrap();
        assert_eq!(
            log.lock().unwrap().iter().filter(|l| l.starts_with("ok:")).count(),
            1
        );
    }

    #[test]
    fn per_source_order_is_preserved_to_a_subscriber() {
        let bus = bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        bus.subscribe(
            "file:changed",
            Arc::new(move |event: &Event| {
                sink.lock().unwrap().push(event.timestamp_ms());
                Ok(())
            }),
            SubscribeOptions::default(),
        );
        for ts in [10, 20, 30, 40] {
            bus.publish(file_event(ts), PublishOptions::default()).unwrap();
        }
        assert_eq!(log.lock().unwrap().as_slice(), [10, 20, 30, 40]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = bus.subscribe(
            "*",
            collector(log.clone(), "x"),
            SubscribeOptions::default(),
        );
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(file_event(1), PublishOptions::default()).unwrap();
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(bus.stats().subscriber_count, 0);
    }
}
