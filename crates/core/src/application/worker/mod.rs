// Worker - per-queue pool pulling deliveries from the bounded buffer

pub mod constants;
mod panic_guard;
mod shutdown;

pub use panic_guard::{invoke_guarded, InvocationResult};
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};

use crate::application::env::message_env;
use crate::application::ledger::{settle, DeliveryKey, DeliveryLedger};
use crate::application::retry::RedeliveryPolicy;
use crate::domain::{Disposition, Message, QueueConfig, QueueId};
use crate::port::{Acknowledger, InvocationContext, Processor, ProcessorError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A delivery on its way from the supervisor to a worker
pub struct Envelope {
    pub key: DeliveryKey,
    pub message: Message,
    pub acker: Arc<dyn Acknowledger>,
}

/// Receiving half of the per-queue buffer, shared by all workers of the pool
pub type SharedBuffer = Arc<Mutex<mpsc::Receiver<Envelope>>>;

/// Worker processes deliveries of one queue
pub struct Worker {
    id: usize,
    queue: QueueId,
    processor: Arc<dyn Processor>,
    failure_timeout: Duration,
    policy: RedeliveryPolicy,
    ledger: Arc<DeliveryLedger>,
    // parent of every invocation context; cancelled when the queue is abandoned
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(
        id: usize,
        config: &QueueConfig,
        ledger: Arc<DeliveryLedger>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            queue: config.name().to_string(),
            processor: Arc::clone(config.processor()),
            failure_timeout: config.failure_timeout(),
            policy: RedeliveryPolicy::new(config.max_redeliveries()),
            ledger,
            cancel,
        }
    }

    /// Run worker loop with graceful shutdown support
    ///
    /// Exits when shutdown is signalled or the buffer is closed and empty. An
    /// invocation that already started always runs to its disposition.
    pub async fn run(self, buffer: SharedBuffer, mut shutdown: ShutdownToken) {
        debug!(queue = %self.queue, worker = self.id, "Worker started");
        loop {
            let envelope = tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    debug!(queue = %self.queue, worker = self.id, "Worker shutting down");
                    break;
                }
                next = Self::next_envelope(&buffer) => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            self.handle(envelope).await;
        }
        debug!(queue = %self.queue, worker = self.id, "Worker stopped");
    }

    async fn next_envelope(buffer: &SharedBuffer) -> Option<Envelope> {
        buffer.lock().await.recv().await
    }

    /// Process one delivery and settle it (returns the disposition, if one was sent)
    pub async fn handle(&self, envelope: Envelope) -> Option<Disposition> {
        let Envelope {
            key,
            message,
            acker,
        } = envelope;

        // its subscription was lost; the broker redelivers it on a new channel
        if !self.ledger.is_outstanding(key) {
            debug!(
                queue = %self.queue,
                delivery_tag = key.tag,
                "Skipping delivery of a lost subscription"
            );
            return None;
        }

        let ctx =
            InvocationContext::with_parent(self.queue.clone(), self.failure_timeout, &self.cancel);
        let env = message_env(&self.queue, &message);
        let result = invoke_guarded(
            Arc::clone(&self.processor),
            ctx,
            env,
            message.body.clone(),
        )
        .await;

        let outcome = match result {
            InvocationResult::Completed(outcome) => outcome,
            InvocationResult::TimedOut => Err(ProcessorError::Internal(format!(
                "deadline of {:?} exceeded",
                self.failure_timeout
            ))),
            InvocationResult::Panicked(msg) => {
                Err(ProcessorError::Internal(format!("processor panicked: {}", msg)))
            }
        };

        let disposition = self.policy.decide(&self.queue, &outcome, &message);
        match (&outcome, disposition) {
            (Ok(()), _) => {
                debug!(queue = %self.queue, delivery_tag = key.tag, "Message processed")
            }
            (Err(e), Disposition::Requeue) => warn!(
                queue = %self.queue,
                delivery_tag = key.tag,
                redelivered = message.redelivered,
                error = %e,
                "Processing failed, requeueing"
            ),
            (Err(e), _) => error!(
                queue = %self.queue,
                delivery_tag = key.tag,
                disposition = %disposition,
                error = %e,
                "Message rejected"
            ),
        }

        let sent = settle(&self.queue, &self.ledger, acker.as_ref(), key, disposition).await;
        sent.then_some(disposition)
    }
}

/// Fixed set of workers for one queue
pub struct WorkerPool {
    queue: QueueId,
    workers: JoinSet<()>,
}

impl WorkerPool {
    /// Spawn `parallelism` workers sharing `buffer`
    ///
    /// Cancelling `cancel` cancels every running invocation; dropping the pool
    /// aborts the workers and their invocations.
    pub fn spawn(
        config: &QueueConfig,
        ledger: Arc<DeliveryLedger>,
        buffer: SharedBuffer,
        shutdown: ShutdownToken,
        cancel: CancellationToken,
    ) -> Self {
        let mut workers = JoinSet::new();
        for id in 0..config.parallelism() {
            let worker = Worker::new(id, config, Arc::clone(&ledger), cancel.clone());
            workers.spawn(worker.run(Arc::clone(&buffer), shutdown.clone()));
        }
        info!(
            queue = %config.name(),
            parallelism = config.parallelism(),
            failure_timeout = ?config.failure_timeout(),
            "Worker pool started"
        );
        Self {
            queue: config.name().to_string(),
            workers,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker to exit
    pub async fn join(mut self) {
        while let Some(res) = self.workers.join_next().await {
            if let Err(e) = res {
                error!(queue = %self.queue, error = %e, "Worker task failed");
            }
        }
        debug!(queue = %self.queue, "Worker pool stopped");
    }
}
