//! Dispatch through a running Consumer
//!
//! - prefetch and parallelism bounds hold
//! - every delivery gets exactly one disposition
//! - outcomes map to Ack / Requeue / Discard

use amqp_bridge_core::application::{Consumer, ConsumerConfig};
use amqp_bridge_core::domain::{Disposition, QueueConfig};
use amqp_bridge_core::port::broker::mocks::MockBroker;
use amqp_bridge_core::port::processor::mocks::MockProcessor;
use amqp_bridge_core::port::{Env, InvocationContext, Processor, ProcessorError, ProcessorOutcome};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

/// jobs, parallelism 2, prefetch 2, always ProcessingFailed, 3 messages:
/// 3 discards and never more than 2 concurrent invocations
#[tokio::test]
async fn test_failed_processing_is_discarded_within_bounds() {
    let broker = Arc::new(MockBroker::new());
    for i in 0..3 {
        broker.publish("jobs", format!("job-{}", i));
    }
    let processor = Arc::new(MockProcessor::new_delay(
        Duration::from_millis(50),
        Err(ProcessorError::ProcessingFailed("500".into())),
    ));
    let config = ConsumerConfig::new(vec![QueueConfig::new("jobs", processor.clone())
        .with_parallelism(2)
        .with_prefetch(2)
        .with_failure_timeout(Duration::from_secs(1))]);

    let consumer = Consumer::start(broker.clone(), config).await.unwrap();
    assert!(broker.wait_for_settlements("jobs", 3, WAIT).await);
    let report = consumer.stop().await;

    assert!(report.is_clean());
    assert_eq!(broker.count_for("jobs", Disposition::Discard), 3);
    assert_eq!(broker.settlements().len(), 3);
    assert_eq!(broker.ready("jobs"), 0);
    assert!(processor.max_concurrency() <= 2);
    assert!(broker.max_unacked("jobs") <= 2);
    assert_eq!(processor.call_count(), 3);
}

#[tokio::test]
async fn test_bounds_hold_under_load() {
    let broker = Arc::new(MockBroker::new());
    for i in 0..40 {
        broker.publish("jobs", format!("job-{}", i));
    }
    let processor = Arc::new(MockProcessor::new_delay(Duration::from_millis(10), Ok(())));
    let config = ConsumerConfig::new(vec![QueueConfig::new("jobs", processor.clone())
        .with_parallelism(4)
        .with_prefetch(6)]);

    let consumer = Consumer::start(broker.clone(), config).await.unwrap();
    assert!(broker.wait_for_settlements("jobs", 40, WAIT).await);
    consumer.stop().await;

    assert_eq!(broker.count_for("jobs", Disposition::Ack), 40);
    assert!(processor.max_concurrency() <= 4);
    assert!(processor.max_concurrency() >= 2, "workers should overlap");
    assert!(broker.max_unacked("jobs") <= 6);
    assert_eq!(broker.duplicate_settlements(), 0);
}

#[tokio::test]
async fn test_prefetch_defaults_to_parallelism() {
    let broker = Arc::new(MockBroker::new());
    for i in 0..10 {
        broker.publish("jobs", format!("job-{}", i));
    }
    let processor = Arc::new(MockProcessor::new_delay(Duration::from_millis(10), Ok(())));
    let config =
        ConsumerConfig::new(vec![QueueConfig::new("jobs", processor.clone()).with_parallelism(3)]);

    let consumer = Consumer::start(broker.clone(), config).await.unwrap();
    assert!(broker.wait_for_settlements("jobs", 10, WAIT).await);
    consumer.stop().await;

    assert!(broker.max_unacked("jobs") <= 3);
}

/// Fails with Internal on the first call for each payload, succeeds afterwards
struct FlakyOnce {
    calls: AtomicUsize,
}

#[async_trait]
impl Processor for FlakyOnce {
    async fn process(&self, _ctx: &InvocationContext, env: Env, _payload: Bytes) -> ProcessorOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if env.get("AMQP_REDELIVERED").map(String::as_str) == Some("1") {
            Ok(())
        } else {
            Err(ProcessorError::Internal("backend unavailable".into()))
        }
    }
}

#[tokio::test]
async fn test_requeued_message_is_redelivered_and_acked() {
    let broker = Arc::new(MockBroker::new());
    broker.publish("jobs", "retry-me");
    let processor = Arc::new(FlakyOnce {
        calls: AtomicUsize::new(0),
    });
    let config = ConsumerConfig::new(vec![QueueConfig::new("jobs", processor.clone())]);

    let consumer = Consumer::start(broker.clone(), config).await.unwrap();
    assert!(broker.wait_for_settlements("jobs", 2, WAIT).await);
    consumer.stop().await;

    assert_eq!(
        broker.dispositions_for("jobs"),
        vec![Disposition::Requeue, Disposition::Ack]
    );
    assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
    assert_eq!(broker.duplicate_settlements(), 0);
}

#[tokio::test]
async fn test_outcome_mapping_per_message() {
    let broker = Arc::new(MockBroker::new());
    for i in 0..4 {
        broker.publish("jobs", format!("m{}", i));
    }
    // sequential worker so outcomes line up with publish order
    let processor = Arc::new(MockProcessor::new_sequence(vec![
        Ok(()),
        Err(ProcessorError::ProcessingError("404".into())),
        Err(ProcessorError::ProcessingFailed("500".into())),
        Ok(()),
    ]));
    let config = ConsumerConfig::new(vec![QueueConfig::new("jobs", processor.clone())]);

    let consumer = Consumer::start(broker.clone(), config).await.unwrap();
    assert!(broker.wait_for_settlements("jobs", 4, WAIT).await);
    consumer.stop().await;

    assert_eq!(
        broker.dispositions_for("jobs"),
        vec![
            Disposition::Ack,
            Disposition::Discard,
            Disposition::Discard,
            Disposition::Ack
        ]
    );
    assert_eq!(broker.count_for("jobs", Disposition::Requeue), 0);
}

#[tokio::test]
async fn test_timeout_requeues_and_cancels_processor() {
    let broker = Arc::new(MockBroker::new());
    broker.publish("jobs", "slow");
    let processor = Arc::new(MockProcessor::new_delay(Duration::from_secs(10), Ok(())));
    let config = ConsumerConfig::new(vec![QueueConfig::new("jobs", processor.clone())
        .with_failure_timeout(Duration::from_millis(100))
        .with_max_redeliveries(1)]);

    let consumer = Consumer::start(broker.clone(), config).await.unwrap();
    // first attempt requeued, second discarded by the redelivery cap
    assert!(broker.wait_for_settlements("jobs", 2, WAIT).await);
    consumer.stop().await;

    assert_eq!(
        broker.dispositions_for("jobs"),
        vec![Disposition::Requeue, Disposition::Discard]
    );
    assert_eq!(processor.cancelled_count(), 2);
    assert_eq!(broker.ready("jobs"), 0);
}

#[tokio::test]
async fn test_panicking_processor_does_not_kill_the_queue() {
    let broker = Arc::new(MockBroker::new());
    broker.publish("jobs", "boom");
    let processor = Arc::new(MockProcessor::new_panic_inducing("processor bug"));
    let config = ConsumerConfig::new(vec![
        QueueConfig::new("jobs", processor.clone()).with_max_redeliveries(2)
    ]);

    let consumer = Consumer::start(broker.clone(), config).await.unwrap();
    assert!(broker.wait_for_settlements("jobs", 3, WAIT).await);
    assert_eq!(
        consumer.state("jobs"),
        Some(amqp_bridge_core::application::SupervisorState::Subscribed)
    );
    consumer.stop().await;

    assert_eq!(
        broker.dispositions_for("jobs"),
        vec![Disposition::Requeue, Disposition::Requeue, Disposition::Discard]
    );
}

#[tokio::test]
async fn test_queues_are_isolated() {
    let broker = Arc::new(MockBroker::new());
    for i in 0..5 {
        broker.publish("fast", format!("f{}", i));
    }
    broker.publish("stuck", "s");
    let fast = Arc::new(MockProcessor::new_success());
    let stuck = Arc::new(MockProcessor::new_hang());
    let config = ConsumerConfig::new(vec![
        QueueConfig::new("fast", fast.clone()),
        QueueConfig::new("stuck", stuck.clone()).with_failure_timeout(Duration::from_secs(30)),
    ])
    .with_stop_timeout(Duration::from_millis(200));

    let consumer = Consumer::start(broker.clone(), config).await.unwrap();
    assert!(broker.wait_for_settlements("fast", 5, WAIT).await);
    assert_eq!(consumer.in_flight("stuck"), Some(1));

    let report = consumer.stop().await;
    assert_eq!(report.stopped, vec!["fast".to_string()]);
    assert_eq!(report.abandoned, vec!["stuck".to_string()]);
}
