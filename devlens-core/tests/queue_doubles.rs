//! Interaction-level checks on the queue layer's trait seams, with
//! mockall doubles standing in for the processor and the system sink.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use devlens_core::queue::{
    BatchProcessor, BatchVerdict, QueueConfig, QueueManager, QueuesConfig,
};
use devlens_core::sink::SystemEventSink;
use devlens_model::{Event, EventCategory, EventSeverity, QueueEntry, QueueName};
use mockall::mock;

mock! {
    Processor {}

    #[async_trait]
    impl BatchProcessor for Processor {
        async fn process(&self, batch: &[QueueEntry]) -> BatchVerdict;
    }
}

mock! {
    Sink {}

    impl SystemEventSink for Sink {
        fn emit(&self, event: Event);
    }
}

fn info_event(ts_ms: i64) -> Event {
    Event::builder("file:changed", EventCategory::File)
        .severity(EventSeverity::Info)
        .timestamp(chrono::TimeZone::timestamp_millis_opt(&Utc, ts_ms).unwrap())
        .source("file-monitor")
        .data(serde_json::json!({
            "action": "modify",
            "newPath": format!("src/f{ts_ms}.rs"),
            "extension": "rs",
            "contextTag": "source",
        }))
        .build()
}

#[tokio::test]
async fn processor_runs_exactly_max_attempts_times_before_dead_letter() {
    let manager = QueueManager::new(QueuesConfig {
        base_backoff_ms: 1,
        max_backoff_ms: 2,
        default: QueueConfig { max_attempts: 2, ..Default::default() },
        ..Default::default()
    });

    let mut processor = MockProcessor::new();
    processor
        .expect_process()
        .withf(|batch: &[QueueEntry]| batch.len() == 1)
        .times(2)
        .returning(|batch| BatchVerdict::fail_all(batch.len(), "induced failure"));
    manager.set_processor(QueueName::Default, Arc::new(processor));

    manager
        .enqueue(&QueueName::Default, &info_event(1))
        .unwrap();
    manager.flush_all().await;
    // A second drain must not touch the processor again; the mock's call
    // bound would trip if it did.
    manager.flush_all().await;

    assert_eq!(manager.queue(&QueueName::Failed).unwrap().depth(), 1);
    assert_eq!(manager.queue(&QueueName::Default).unwrap().depth(), 0);
}

#[tokio::test]
async fn successful_batch_is_processed_once_and_discarded() {
    let manager = QueueManager::new(QueuesConfig::default());

    let mut processor = MockProcessor::new();
    processor
        .expect_process()
        .times(1)
        .returning(|_| BatchVerdict::ok());
    manager.set_processor(QueueName::Default, Arc::new(processor));

    manager
        .enqueue(&QueueName::Default, &info_event(1))
        .unwrap();
    manager.flush_all().await;
    manager.flush_all().await;

    let stats = manager.queue(&QueueName::Default).unwrap().stats();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.failed, 0);
}

#[test]
fn overflow_reports_through_the_sink_exactly_once() {
    let manager = QueueManager::new(QueuesConfig {
        default: QueueConfig { max_size: 1, ..Default::default() },
        ..Default::default()
    });

    let mut sink = MockSink::new();
    sink.expect_emit()
        .withf(|event: &Event| event.event_type == "system:queue_dropped")
        .times(1)
        .return_const(());
    manager.set_event_sink(Arc::new(sink));

    manager
        .enqueue(&QueueName::Default, &info_event(1))
        .unwrap();
    manager
        .enqueue(&QueueName::Default, &info_event(2))
        .unwrap();

    let queue = manager.queue(&QueueName::Default).unwrap();
    assert_eq!(queue.depth(), 1);
    assert_eq!(queue.dropped_count(), 1);
}
