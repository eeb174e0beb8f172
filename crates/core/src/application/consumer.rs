// Consumer - starts one supervisor per queue and stops them together

use crate::application::retry::BackoffConfig;
use crate::application::supervisor::{QueueSupervisor, SupervisorHandle, SupervisorState};
use crate::application::worker::constants::DEFAULT_STOP_TIMEOUT;
use crate::application::worker::{shutdown_channel, ShutdownSender};
use crate::domain::{DomainError, QueueConfig, QueueId};
use crate::port::Broker;
use crate::Result;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Queues to consume plus consumer-wide settings
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    queues: Vec<QueueConfig>,
    stop_timeout: Duration,
    backoff: BackoffConfig,
}

impl ConsumerConfig {
    pub fn new(queues: Vec<QueueConfig>) -> Self {
        Self {
            queues,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            backoff: BackoffConfig::default(),
        }
    }

    /// Overall deadline for [`Consumer::stop`]
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn queues(&self) -> &[QueueConfig] {
        &self.queues
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    pub fn backoff(&self) -> BackoffConfig {
        self.backoff
    }

    /// Validate every queue and reject duplicate names
    pub fn validate(&self) -> std::result::Result<(), DomainError> {
        if self.queues.is_empty() {
            return Err(DomainError::NoQueues);
        }
        if self.stop_timeout.is_zero() {
            return Err(DomainError::ValidationError(
                "stop timeout must be positive".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for queue in &self.queues {
            queue.validate()?;
            if !seen.insert(queue.name()) {
                return Err(DomainError::DuplicateQueue(queue.name().to_string()));
            }
        }
        Ok(())
    }
}

/// Result of [`Consumer::stop`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    /// Queues that drained completely
    pub stopped: Vec<QueueId>,
    /// Queues still busy at the deadline; their unsettled deliveries return to the broker
    pub abandoned: Vec<QueueId>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.abandoned.is_empty()
    }
}

/// Running consumer over a set of queues
///
/// Dropping a consumer without calling [`Consumer::stop`] also drains every
/// queue, but nothing waits for it and the broker stays open.
pub struct Consumer {
    broker: Arc<dyn Broker>,
    shutdown: ShutdownSender,
    supervisors: Vec<SupervisorHandle>,
    skipped: Vec<QueueId>,
    stop_timeout: Duration,
}

impl Consumer {
    /// Start consuming every configured queue
    ///
    /// Start is best-effort: a queue whose first subscription fails is logged
    /// and skipped while the others keep running.
    ///
    /// # Errors
    /// `AppError::Config` for an invalid configuration; nothing is started then.
    pub async fn start(broker: Arc<dyn Broker>, config: ConsumerConfig) -> Result<Self> {
        config.validate()?;

        let (shutdown, token) = shutdown_channel();
        let mut supervisors = Vec::with_capacity(config.queues().len());
        let mut skipped = Vec::new();

        for queue in config.queues() {
            let supervisor =
                QueueSupervisor::new(queue.clone(), Arc::clone(&broker), config.backoff());
            match supervisor.start(token.clone()).await {
                Ok(handle) => {
                    info!(
                        queue = %queue.name(),
                        prefetch = queue.prefetch(),
                        parallelism = queue.parallelism(),
                        "Queue started"
                    );
                    supervisors.push(handle);
                }
                Err(e) => {
                    error!(queue = %queue.name(), error = %e, "Failed to start queue, skipping");
                    skipped.push(queue.name().to_string());
                }
            }
        }

        info!(
            started = supervisors.len(),
            skipped = skipped.len(),
            "Consumer started"
        );

        Ok(Self {
            broker,
            shutdown,
            supervisors,
            skipped,
            stop_timeout: config.stop_timeout(),
        })
    }

    /// Names of the queues being consumed
    pub fn queues(&self) -> Vec<&str> {
        self.supervisors.iter().map(SupervisorHandle::queue).collect()
    }

    /// Queues skipped at start
    pub fn skipped_queues(&self) -> &[QueueId] {
        &self.skipped
    }

    pub fn is_empty(&self) -> bool {
        self.supervisors.is_empty()
    }

    pub fn state(&self, queue: &str) -> Option<SupervisorState> {
        self.handle(queue).map(SupervisorHandle::state)
    }

    /// Deliveries of `queue` received but not yet settled
    pub fn in_flight(&self, queue: &str) -> Option<usize> {
        self.handle(queue).map(SupervisorHandle::in_flight)
    }

    fn handle(&self, queue: &str) -> Option<&SupervisorHandle> {
        self.supervisors.iter().find(|h| h.queue() == queue)
    }

    /// Stop every queue and close the broker
    ///
    /// Subscriptions are cancelled first, in-flight invocations run to their
    /// disposition and buffered deliveries are requeued. Queues still busy
    /// when the stop timeout expires are abandoned.
    pub async fn stop(self) -> StopReport {
        let Self {
            broker,
            shutdown,
            supervisors,
            stop_timeout,
            ..
        } = self;

        info!(queues = supervisors.len(), timeout = ?stop_timeout, "Stopping consumer");
        shutdown.shutdown();

        let deadline = Instant::now() + stop_timeout;
        let mut report = StopReport::default();

        for mut handle in supervisors {
            match tokio::time::timeout_at(deadline, handle.stopped()).await {
                Ok(()) => report.stopped.push(handle.queue().to_string()),
                Err(_) => {
                    warn!(
                        queue = %handle.queue(),
                        state = %handle.state(),
                        in_flight = handle.in_flight(),
                        "Queue did not drain before the stop deadline, abandoning"
                    );
                    handle.abort();
                    handle.stopped().await;
                    report.abandoned.push(handle.queue().to_string());
                }
            }
        }

        if let Err(e) = broker.close().await {
            warn!(error = %e, "Failed to close broker connection");
        }

        info!(
            stopped = report.stopped.len(),
            abandoned = report.abandoned.len(),
            "Consumer stopped"
        );
        report
    }
}
