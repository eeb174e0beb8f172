// Queue Supervisor - owns one queue's subscription, buffer and worker pool

use crate::application::ledger::{settle, DeliveryKey, DeliveryLedger};
use crate::application::retry::{Backoff, BackoffConfig};
use crate::application::worker::{Envelope, SharedBuffer, ShutdownToken, WorkerPool};
use crate::domain::{Disposition, QueueConfig, QueueId};
use crate::port::{Broker, BrokerError, Subscription};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Supervisor lifecycle
///
/// Starting → Subscribed → Draining → Stopped; a lost subscription goes back
/// to Starting until it is reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Subscribed,
    Draining,
    Stopped,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::Starting => "starting",
            SupervisorState::Subscribed => "subscribed",
            SupervisorState::Draining => "draining",
            SupervisorState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to a running supervisor
#[derive(Debug)]
pub struct SupervisorHandle {
    queue: QueueId,
    state: watch::Receiver<SupervisorState>,
    ledger: Arc<DeliveryLedger>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.state.clone()
    }

    /// Deliveries received but not yet settled
    pub fn in_flight(&self) -> usize {
        self.ledger.len()
    }

    /// Wait until the supervisor task has finished (state Stopped)
    pub async fn stopped(&mut self) {
        if let Err(e) = (&mut self.task).await {
            if e.is_panic() {
                error!(queue = %self.queue, error = %e, "Queue supervisor panicked");
            }
        }
    }

    /// Abandon the supervisor and its in-flight work
    ///
    /// Running invocations see their context cancelled; the supervisor task,
    /// its workers and their invocation tasks are aborted.
    pub fn abort(&self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

enum PumpEnd {
    Shutdown,
    Lost(BrokerError),
}

/// Supervises consumption of one queue
pub struct QueueSupervisor {
    config: QueueConfig,
    broker: Arc<dyn Broker>,
    backoff: BackoffConfig,
    ledger: Arc<DeliveryLedger>,
    cancel: CancellationToken,
}

impl QueueSupervisor {
    pub fn new(config: QueueConfig, broker: Arc<dyn Broker>, backoff: BackoffConfig) -> Self {
        Self {
            config,
            broker,
            backoff,
            ledger: Arc::new(DeliveryLedger::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Open the first subscription, then hand over to a background task
    ///
    /// # Errors
    /// The initial subscribe error; nothing is spawned in that case.
    pub async fn start(self, shutdown: ShutdownToken) -> Result<SupervisorHandle, BrokerError> {
        let queue = self.config.name().to_string();
        let (state_tx, state_rx) = watch::channel(SupervisorState::Starting);

        let subscription = self
            .broker
            .subscribe(&queue, self.config.prefetch())
            .await?;

        let ledger = Arc::clone(&self.ledger);
        let cancel = self.cancel.clone();
        let task = tokio::spawn(self.run(subscription, state_tx, shutdown));

        Ok(SupervisorHandle {
            queue,
            state: state_rx,
            ledger,
            cancel,
            task,
        })
    }

    async fn run(
        self,
        first: Box<dyn Subscription>,
        state: watch::Sender<SupervisorState>,
        mut shutdown: ShutdownToken,
    ) {
        let queue = self.config.name().to_string();
        let (tx, rx) = mpsc::channel(usize::from(self.config.prefetch()));
        let buffer: SharedBuffer = Arc::new(Mutex::new(rx));
        let pool = WorkerPool::spawn(
            &self.config,
            Arc::clone(&self.ledger),
            Arc::clone(&buffer),
            shutdown.clone(),
            self.cancel.clone(),
        );

        let mut backoff = Backoff::new(self.backoff, &queue);
        let mut next = Some(first);
        let mut epoch = 0u64;

        let mut current = loop {
            let mut sub = match next.take() {
                Some(sub) => sub,
                None => match self.resubscribe(&mut backoff, &mut shutdown, &state).await {
                    Some(sub) => sub,
                    None => break None,
                },
            };
            epoch += 1;
            backoff.reset();
            transition(&state, &queue, SupervisorState::Subscribed);
            info!(
                queue = %queue,
                prefetch = self.config.prefetch(),
                epoch,
                "Subscription open"
            );

            match self.pump(&mut *sub, epoch, &tx, &mut shutdown).await {
                PumpEnd::Shutdown => break Some(sub),
                PumpEnd::Lost(e) => {
                    warn!(queue = %queue, error = %e, "Subscription lost, reopening");
                    if let Err(e) = sub.close().await {
                        debug!(queue = %queue, error = %e, "Closing lost subscription failed");
                    }
                    let forgotten = self.ledger.forget_epoch(epoch);
                    if forgotten > 0 {
                        info!(
                            queue = %queue,
                            forgotten,
                            "Unsettled deliveries left to broker redelivery"
                        );
                    }
                }
            }
        };

        transition(&state, &queue, SupervisorState::Draining);
        if let Some(sub) = current.as_mut() {
            if let Err(e) = sub.cancel().await {
                warn!(queue = %queue, error = %e, "Failed to cancel subscription");
            }
        }

        drop(tx);
        pool.join().await;

        // buffered but never picked up by a worker
        let mut requeued = 0usize;
        {
            let mut rx = buffer.lock().await;
            rx.close();
            while let Ok(envelope) = rx.try_recv() {
                if settle(
                    &queue,
                    &self.ledger,
                    envelope.acker.as_ref(),
                    envelope.key,
                    Disposition::Requeue,
                )
                .await
                {
                    requeued += 1;
                }
            }
        }

        if let Some(mut sub) = current {
            if let Err(e) = sub.close().await {
                warn!(queue = %queue, error = %e, "Failed to close subscription");
            }
        }

        transition(&state, &queue, SupervisorState::Stopped);
        info!(queue = %queue, requeued, "Queue supervisor stopped");
    }

    /// Move deliveries from the subscription into the buffer until shutdown or loss
    async fn pump(
        &self,
        sub: &mut dyn Subscription,
        epoch: u64,
        tx: &mpsc::Sender<Envelope>,
        shutdown: &mut ShutdownToken,
    ) -> PumpEnd {
        let queue = self.config.name();
        let acker = sub.acknowledger();

        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.wait() => return PumpEnd::Shutdown,
                next = sub.next_message() => match next {
                    Some(Ok(message)) => message,
                    Some(Err(e)) => return PumpEnd::Lost(e),
                    None => {
                        return PumpEnd::Lost(BrokerError::Subscription(
                            "delivery stream ended".to_string(),
                        ))
                    }
                },
            };

            let key = DeliveryKey {
                epoch,
                tag: message.delivery_tag,
            };
            if !self.ledger.track(key) {
                warn!(queue = %queue, delivery_tag = key.tag, "Duplicate delivery tag received");
                continue;
            }
            let envelope = Envelope {
                key,
                message,
                acker: Arc::clone(&acker),
            };

            tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    settle(queue, &self.ledger, acker.as_ref(), key, Disposition::Requeue).await;
                    return PumpEnd::Shutdown;
                }
                permit = tx.reserve() => match permit {
                    Ok(permit) => permit.send(envelope),
                    Err(_) => {
                        settle(queue, &self.ledger, acker.as_ref(), key, Disposition::Requeue).await;
                        return PumpEnd::Shutdown;
                    }
                },
            }
        }
    }

    /// Reopen the subscription with backoff; `None` if shutdown came first
    async fn resubscribe(
        &self,
        backoff: &mut Backoff,
        shutdown: &mut ShutdownToken,
        state: &watch::Sender<SupervisorState>,
    ) -> Option<Box<dyn Subscription>> {
        let queue = self.config.name();
        transition(state, queue, SupervisorState::Starting);

        loop {
            let delay = backoff.next_delay();
            debug!(queue = %queue, attempt = backoff.attempt(), delay = ?delay, "Waiting before resubscribe");

            tokio::select! {
                biased;
                _ = shutdown.wait() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                biased;
                _ = shutdown.wait() => return None,
                result = self.broker.subscribe(queue, self.config.prefetch()) => result,
            };

            match result {
                Ok(sub) => {
                    info!(queue = %queue, attempt = backoff.attempt(), "Resubscribed");
                    return Some(sub);
                }
                Err(e) => {
                    warn!(queue = %queue, attempt = backoff.attempt(), error = %e, "Resubscribe failed");
                }
            }
        }
    }
}

fn transition(state: &watch::Sender<SupervisorState>, queue: &str, next: SupervisorState) {
    let previous = state.send_replace(next);
    if previous != next {
        debug!(queue = %queue, from = %previous, to = %next, "Supervisor state changed");
    }
}
