// Broker Port
// Abstraction over an AMQP 0-9-1 connection: prefetch-limited subscriptions, ack/nack

use crate::domain::{DeliveryTag, Disposition, Message};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Broker errors
///
/// All of them are contained by the queue supervisor that hit them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Acknowledgement error: {0}")]
    Acknowledgement(String),

    #[error("Broker connection closed")]
    Closed,
}

/// Shared broker connection
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a dedicated channel limited to `prefetch` unacknowledged deliveries
    /// and start consuming `queue`
    ///
    /// # Errors
    /// - BrokerError::Connection if the connection is gone and cannot be reopened
    /// - BrokerError::Subscription if the channel or consumer cannot be set up
    async fn subscribe(&self, queue: &str, prefetch: u16)
        -> Result<Box<dyn Subscription>, BrokerError>;

    /// Close the shared connection
    async fn close(&self) -> Result<(), BrokerError>;
}

/// One consumer on one channel, owned by a single queue supervisor
#[async_trait]
pub trait Subscription: Send {
    /// Handle used by workers to settle deliveries of this subscription
    fn acknowledger(&self) -> Arc<dyn Acknowledger>;

    /// Next delivery; `None` once cancelled
    ///
    /// Must be cancel-safe: dropping the future never loses a delivery.
    async fn next_message(&mut self) -> Option<Result<Message, BrokerError>>;

    /// Stop receiving deliveries; the channel stays open for settlements
    async fn cancel(&mut self) -> Result<(), BrokerError>;

    /// Close the channel; unsettled deliveries go back to the queue
    async fn close(&mut self) -> Result<(), BrokerError>;
}

/// Applies dispositions to delivery tags of one channel
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError>;

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError>;

    async fn settle(&self, tag: DeliveryTag, disposition: Disposition) -> Result<(), BrokerError> {
        match disposition {
            Disposition::Ack => self.ack(tag).await,
            Disposition::Requeue => self.nack(tag, true).await,
            Disposition::Discard => self.nack(tag, false).await,
        }
    }
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::domain::{Headers, DELIVERY_COUNT_HEADER};
    use bytes::Bytes;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::{Mutex, MutexGuard, PoisonError};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// A disposition as seen by the broker
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Settlement {
        pub queue: String,
        pub delivery_tag: DeliveryTag,
        pub body: Bytes,
        pub disposition: Disposition,
    }

    #[derive(Debug, Clone)]
    struct Pending {
        body: Bytes,
        headers: Headers,
        previous_deliveries: u32,
    }

    #[derive(Debug)]
    struct Outstanding {
        queue: String,
        subscription: u64,
        pending: Pending,
    }

    #[derive(Debug, Default)]
    struct State {
        ready: HashMap<String, VecDeque<Pending>>,
        outstanding: HashMap<DeliveryTag, Outstanding>,
        settled: Vec<Settlement>,
        stale_tags: HashSet<DeliveryTag>,
        duplicate_settlements: usize,
        stale_settlements: usize,
        max_unacked: HashMap<String, usize>,
        subscribe_failures: HashMap<String, usize>,
        subscribe_calls: HashMap<String, usize>,
        live: HashMap<u64, String>,
        dropped: HashSet<u64>,
        next_tag: DeliveryTag,
        next_subscription: u64,
        closed: bool,
    }

    impl State {
        fn unacked(&self, queue: &str) -> usize {
            self.outstanding.values().filter(|o| o.queue == queue).count()
        }

        fn unacked_for(&self, subscription: u64) -> usize {
            self.outstanding
                .values()
                .filter(|o| o.subscription == subscription)
                .count()
        }

        fn requeue(&mut self, queue: &str, mut pending: Pending) {
            pending.previous_deliveries += 1;
            self.ready
                .entry(queue.to_string())
                .or_default()
                .push_front(pending);
        }

        /// Return every outstanding delivery of a subscription to its queue
        fn return_outstanding(&mut self, subscription: u64) {
            let tags: Vec<DeliveryTag> = self
                .outstanding
                .iter()
                .filter(|(_, o)| o.subscription == subscription)
                .map(|(tag, _)| *tag)
                .collect();
            for tag in tags {
                if let Some(o) = self.outstanding.remove(&tag) {
                    self.stale_tags.insert(tag);
                    self.requeue(&o.queue, o.pending);
                }
            }
        }
    }

    #[derive(Default)]
    struct Shared {
        state: Mutex<State>,
        notify: Notify,
    }

    impl Shared {
        fn state(&self) -> MutexGuard<'_, State> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// In-memory broker honoring prefetch and recording every settlement
    #[derive(Clone, Default)]
    pub struct MockBroker {
        shared: Arc<Shared>,
    }

    impl MockBroker {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn publish(&self, queue: &str, body: impl Into<Bytes>) {
            self.publish_with_headers(queue, body, Headers::new());
        }

        pub fn publish_with_headers(&self, queue: &str, body: impl Into<Bytes>, headers: Headers) {
            self.shared
                .state()
                .ready
                .entry(queue.to_string())
                .or_default()
                .push_back(Pending {
                    body: body.into(),
                    headers,
                    previous_deliveries: 0,
                });
            self.shared.notify.notify_waiters();
        }

        /// Make the next `count` subscribe calls for `queue` fail
        pub fn fail_next_subscribes(&self, queue: &str, count: usize) {
            self.shared
                .state()
                .subscribe_failures
                .insert(queue.to_string(), count);
        }

        /// Simulate the broker dropping every live subscription of `queue`
        ///
        /// Their unacknowledged deliveries go back to the queue, like a closed channel.
        pub fn drop_subscriptions(&self, queue: &str) {
            {
                let mut state = self.shared.state();
                let ids: Vec<u64> = state
                    .live
                    .iter()
                    .filter(|(_, q)| q.as_str() == queue)
                    .map(|(id, _)| *id)
                    .collect();
                for id in ids {
                    state.live.remove(&id);
                    state.dropped.insert(id);
                    state.return_outstanding(id);
                }
            }
            self.shared.notify.notify_waiters();
        }

        pub fn settlements(&self) -> Vec<Settlement> {
            self.shared.state().settled.clone()
        }

        pub fn dispositions_for(&self, queue: &str) -> Vec<Disposition> {
            self.shared
                .state()
                .settled
                .iter()
                .filter(|s| s.queue == queue)
                .map(|s| s.disposition)
                .collect()
        }

        pub fn count_for(&self, queue: &str, disposition: Disposition) -> usize {
            self.dispositions_for(queue)
                .into_iter()
                .filter(|d| *d == disposition)
                .count()
        }

        pub fn ready(&self, queue: &str) -> usize {
            self.shared.state().ready.get(queue).map_or(0, VecDeque::len)
        }

        pub fn unacked(&self, queue: &str) -> usize {
            self.shared.state().unacked(queue)
        }

        /// Highest number of unacknowledged deliveries ever observed for `queue`
        pub fn max_unacked(&self, queue: &str) -> usize {
            self.shared
                .state()
                .max_unacked
                .get(queue)
                .copied()
                .unwrap_or(0)
        }

        /// Settlements for tags that were already settled or never delivered
        pub fn duplicate_settlements(&self) -> usize {
            self.shared.state().duplicate_settlements
        }

        /// Settlements attempted on tags of a closed channel
        pub fn stale_settlements(&self) -> usize {
            self.shared.state().stale_settlements
        }

        pub fn subscribe_calls(&self, queue: &str) -> usize {
            self.shared
                .state()
                .subscribe_calls
                .get(queue)
                .copied()
                .unwrap_or(0)
        }

        pub fn live_subscriptions(&self, queue: &str) -> usize {
            self.shared
                .state()
                .live
                .values()
                .filter(|q| q.as_str() == queue)
                .count()
        }

        pub fn is_closed(&self) -> bool {
            self.shared.state().closed
        }

        /// Poll until `queue` has at least `count` settlements
        pub async fn wait_for_settlements(&self, queue: &str, count: usize, timeout: Duration) -> bool {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if self.dispositions_for(queue).len() >= count {
                    return true;
                }
                if tokio::time::Instant::now() >= deadline {
                    return false;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    #[async_trait]
    impl Broker for MockBroker {
        async fn subscribe(
            &self,
            queue: &str,
            prefetch: u16,
        ) -> Result<Box<dyn Subscription>, BrokerError> {
            let mut state = self.shared.state();
            *state.subscribe_calls.entry(queue.to_string()).or_insert(0) += 1;

            if state.closed {
                return Err(BrokerError::Connection("connection closed".to_string()));
            }

            if let Some(remaining) = state.subscribe_failures.get_mut(queue) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(BrokerError::Subscription(format!(
                        "cannot consume from '{}'",
                        queue
                    )));
                }
            }

            state.next_subscription += 1;
            let id = state.next_subscription;
            state.live.insert(id, queue.to_string());

            Ok(Box::new(MockSubscription {
                id,
                queue: queue.to_string(),
                prefetch: prefetch as usize,
                shared: Arc::clone(&self.shared),
                finished: false,
            }))
        }

        async fn close(&self) -> Result<(), BrokerError> {
            self.shared.state().closed = true;
            self.shared.notify.notify_waiters();
            Ok(())
        }
    }

    struct MockSubscription {
        id: u64,
        queue: String,
        prefetch: usize,
        shared: Arc<Shared>,
        finished: bool,
    }

    impl MockSubscription {
        fn try_deliver(&mut self) -> Option<Result<Message, BrokerError>> {
            let mut state = self.shared.state();

            if state.dropped.remove(&self.id) {
                self.finished = true;
                return Some(Err(BrokerError::Connection(
                    "subscription dropped by broker".to_string(),
                )));
            }
            if state.closed {
                self.finished = true;
                return Some(Err(BrokerError::Closed));
            }
            if state.unacked_for(self.id) >= self.prefetch {
                return None;
            }

            let pending = state
                .ready
                .get_mut(&self.queue)
                .and_then(VecDeque::pop_front)?;

            state.next_tag += 1;
            let tag = state.next_tag;
            let mut headers = pending.headers.clone();
            if pending.previous_deliveries > 0 {
                headers.insert(
                    DELIVERY_COUNT_HEADER.to_string(),
                    pending.previous_deliveries.to_string(),
                );
            }
            let message = Message::new(tag, pending.body.clone())
                .with_headers(headers)
                .with_redelivered(pending.previous_deliveries > 0);

            state.outstanding.insert(
                tag,
                Outstanding {
                    queue: self.queue.clone(),
                    subscription: self.id,
                    pending,
                },
            );
            let unacked = state.unacked(&self.queue);
            let max = state.max_unacked.entry(self.queue.clone()).or_insert(0);
            *max = (*max).max(unacked);

            Some(Ok(message))
        }
    }

    #[async_trait]
    impl Subscription for MockSubscription {
        fn acknowledger(&self) -> Arc<dyn Acknowledger> {
            Arc::new(MockAcknowledger {
                shared: Arc::clone(&self.shared),
            })
        }

        async fn next_message(&mut self) -> Option<Result<Message, BrokerError>> {
            let shared = Arc::clone(&self.shared);
            loop {
                if self.finished {
                    return None;
                }
                // register interest before looking, so no wakeup is lost
                let notified = shared.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(next) = self.try_deliver() {
                    return Some(next);
                }
                notified.await;
            }
        }

        async fn cancel(&mut self) -> Result<(), BrokerError> {
            self.finished = true;
            self.shared.state().live.remove(&self.id);
            Ok(())
        }

        async fn close(&mut self) -> Result<(), BrokerError> {
            self.finished = true;
            {
                let mut state = self.shared.state();
                state.live.remove(&self.id);
                state.return_outstanding(self.id);
            }
            self.shared.notify.notify_waiters();
            Ok(())
        }
    }

    struct MockAcknowledger {
        shared: Arc<Shared>,
    }

    impl MockAcknowledger {
        fn apply(&self, tag: DeliveryTag, disposition: Disposition) -> Result<(), BrokerError> {
            let result = {
                let mut state = self.shared.state();
                match state.outstanding.remove(&tag) {
                    Some(o) => {
                        state.settled.push(Settlement {
                            queue: o.queue.clone(),
                            delivery_tag: tag,
                            body: o.pending.body.clone(),
                            disposition,
                        });
                        if disposition == Disposition::Requeue {
                            state.requeue(&o.queue, o.pending);
                        }
                        Ok(())
                    }
                    None if state.stale_tags.contains(&tag) => {
                        state.stale_settlements += 1;
                        Err(BrokerError::Acknowledgement("channel closed".to_string()))
                    }
                    None => {
                        state.duplicate_settlements += 1;
                        Err(BrokerError::Acknowledgement(format!(
                            "unknown delivery tag {}",
                            tag
                        )))
                    }
                }
            };
            self.shared.notify.notify_waiters();
            result
        }
    }

    #[async_trait]
    impl Acknowledger for MockAcknowledger {
        async fn ack(&self, tag: DeliveryTag) -> Result<(), BrokerError> {
            self.apply(tag, Disposition::Ack)
        }

        async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
            let disposition = if requeue {
                Disposition::Requeue
            } else {
                Disposition::Discard
            };
            self.apply(tag, disposition)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mocks::MockBroker;
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_mock_broker_honors_prefetch() {
        let broker = MockBroker::new();
        for i in 0..5 {
            broker.publish("jobs", format!("m{}", i));
        }

        let mut sub = broker.subscribe("jobs", 2).await.unwrap();
        let first = sub.next_message().await.unwrap().unwrap();
        let _second = sub.next_message().await.unwrap().unwrap();

        // third delivery blocks until a slot frees up
        let blocked = tokio::time::timeout(Duration::from_millis(50), sub.next_message()).await;
        assert!(blocked.is_err());
        assert_eq!(broker.unacked("jobs"), 2);

        sub.acknowledger().ack(first.delivery_tag).await.unwrap();
        let third = tokio::time::timeout(Duration::from_secs(1), sub.next_message())
            .await
            .unwrap();
        assert!(third.unwrap().is_ok());
        assert_eq!(broker.max_unacked("jobs"), 2);
    }

    #[tokio::test]
    async fn test_mock_broker_rejects_double_settlement() {
        let broker = MockBroker::new();
        broker.publish("jobs", "once");

        let mut sub = broker.subscribe("jobs", 1).await.unwrap();
        let msg = sub.next_message().await.unwrap().unwrap();
        let acker = sub.acknowledger();

        acker.settle(msg.delivery_tag, Disposition::Ack).await.unwrap();
        assert!(acker.settle(msg.delivery_tag, Disposition::Ack).await.is_err());
        assert_eq!(broker.duplicate_settlements(), 1);
    }

    #[tokio::test]
    async fn test_mock_broker_requeue_marks_redelivery() {
        let broker = MockBroker::new();
        broker.publish("jobs", "retry-me");

        let mut sub = broker.subscribe("jobs", 1).await.unwrap();
        let first = sub.next_message().await.unwrap().unwrap();
        assert!(!first.redelivered);
        assert_eq!(first.delivery_count(), None);

        sub.acknowledger()
            .settle(first.delivery_tag, Disposition::Requeue)
            .await
            .unwrap();

        let again = sub.next_message().await.unwrap().unwrap();
        assert!(again.redelivered);
        assert_ne!(again.delivery_tag, first.delivery_tag);
        assert_eq!(again.delivery_count(), Some(1));
    }

    #[tokio::test]
    async fn test_mock_broker_subscribe_failures() {
        let broker = MockBroker::new();
        broker.fail_next_subscribes("jobs", 1);

        assert!(matches!(
            broker.subscribe("jobs", 1).await,
            Err(BrokerError::Subscription(_))
        ));
        assert!(broker.subscribe("jobs", 1).await.is_ok());
        assert_eq!(broker.subscribe_calls("jobs"), 2);
    }

    #[tokio::test]
    async fn test_mock_broker_drop_returns_unacked() {
        let broker = MockBroker::new();
        broker.publish("jobs", "in-flight");

        let mut sub = broker.subscribe("jobs", 1).await.unwrap();
        let msg = sub.next_message().await.unwrap().unwrap();

        broker.drop_subscriptions("jobs");
        assert!(matches!(
            sub.next_message().await,
            Some(Err(BrokerError::Connection(_)))
        ));
        assert!(sub.next_message().await.is_none());
        assert_eq!(broker.ready("jobs"), 1);

        // settling on the dead channel fails, the broker keeps the message
        assert!(sub.acknowledger().ack(msg.delivery_tag).await.is_err());
        assert_eq!(broker.stale_settlements(), 1);
    }
}
