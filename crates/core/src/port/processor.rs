// Processor Port
// Abstraction for the backend a message payload is handed to (e.g. FastCGI)

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Environment passed to a processor invocation (CGI-style variables)
pub type Env = HashMap<String, String>;

/// Failure outcomes of a processor invocation
///
/// The variant decides the disposition; the message is only logged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    /// The processor could not reach or talk to its backend
    #[error("Processor internal error: {0}")]
    Internal(String),

    /// The backend answered but its result could not be interpreted
    #[error("Unknown backend status: {0}")]
    UnknownStatus(String),

    /// The backend rejected the payload (client-class)
    #[error("Processing error: {0}")]
    ProcessingError(String),

    /// The backend failed while handling the payload (server-class)
    #[error("Processing failed: {0}")]
    ProcessingFailed(String),
}

impl ProcessorError {
    /// Whether redelivering the same payload can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProcessorError::Internal(_) | ProcessorError::UnknownStatus(_)
        )
    }
}

/// `Ok(())` is success; every failure is one of the [`ProcessorError`] sentinels
pub type ProcessorOutcome = Result<(), ProcessorError>;

/// Per-invocation context: deadline plus cancellation
///
/// Cloning shares the cancellation token, so a clone handed to the processor
/// observes cancellation triggered by the worker.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    queue: String,
    deadline: Instant,
    token: CancellationToken,
}

impl InvocationContext {
    /// Start a context whose deadline is `timeout` from now
    pub fn new(queue: impl Into<String>, timeout: Duration) -> Self {
        Self {
            queue: queue.into(),
            deadline: Instant::now() + timeout,
            token: CancellationToken::new(),
        }
    }

    /// Like [`InvocationContext::new`], but also cancelled when `parent` is
    pub fn with_parent(
        queue: impl Into<String>,
        timeout: Duration,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            queue: queue.into(),
            deadline: Instant::now() + timeout,
            token: parent.child_token(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline (zero once passed)
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the invocation has been cancelled
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn cancel(&self) {
        self.token.cancel()
    }
}

/// Processor trait
///
/// Implementations:
/// - FastCgiProcessor: forwards the payload to a FastCGI responder
/// - ProcessorWithEnv: decorator filling static environment entries
///
/// Implementations must return promptly (with one of the sentinel errors) once
/// `ctx` is cancelled; the worker abandons invocations that overrun their
/// deadline regardless.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, ctx: &InvocationContext, env: Env, payload: Bytes)
        -> ProcessorOutcome;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, MutexGuard, PoisonError};

    /// Mock processor behavior
    #[derive(Debug, Clone)]
    pub enum MockBehavior {
        /// Always return the given outcome
        Outcome(ProcessorOutcome),
        /// Outcome by call index; the last entry repeats
        Sequence(Vec<ProcessorOutcome>),
        /// Sleep, then return the outcome (returns `Internal` if cancelled first)
        Delay(Duration, ProcessorOutcome),
        /// Never return and ignore cancellation
        Hang,
        /// Panic with message (for panic isolation testing)
        Panic(String),
    }

    /// Mock Processor for testing
    ///
    /// Records calls, environments, payloads and the concurrency high-water mark.
    pub struct MockProcessor {
        behavior: MockBehavior,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        cancelled: AtomicUsize,
        envs: Mutex<Vec<Env>>,
        payloads: Mutex<Vec<Bytes>>,
    }

    struct InFlightGuard<'a>(&'a AtomicUsize);

    impl Drop for InFlightGuard<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
        m.lock().unwrap_or_else(PoisonError::into_inner)
    }

    impl MockProcessor {
        pub fn new(behavior: MockBehavior) -> Self {
            Self {
                behavior,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                cancelled: AtomicUsize::new(0),
                envs: Mutex::new(Vec::new()),
                payloads: Mutex::new(Vec::new()),
            }
        }
        pub fn new_success() -> Self {
            Self::new(MockBehavior::Outcome(Ok(())))
        }
        pub fn new_fail(error: ProcessorError) -> Self {
            Self::new(MockBehavior::Outcome(Err(error)))
        }
        pub fn new_sequence(outcomes: Vec<ProcessorOutcome>) -> Self {
            Self::new(MockBehavior::Sequence(outcomes))
        }
        pub fn new_delay(delay: Duration, outcome: ProcessorOutcome) -> Self {
            Self::new(MockBehavior::Delay(delay, outcome))
        }
        pub fn new_hang() -> Self {
            Self::new(MockBehavior::Hang)
        }
        pub fn new_panic_inducing(message: impl Into<String>) -> Self {
            Self::new(MockBehavior::Panic(message.into()))
        }
        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
        pub fn in_flight(&self) -> usize {
            self.in_flight.load(Ordering::SeqCst)
        }
        /// Highest number of invocations observed running at once
        pub fn max_concurrency(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
        /// Invocations that returned early because their context was cancelled
        pub fn cancelled_count(&self) -> usize {
            self.cancelled.load(Ordering::SeqCst)
        }
        pub fn envs(&self) -> Vec<Env> {
            lock(&self.envs).clone()
        }
        pub fn payloads(&self) -> Vec<Bytes> {
            lock(&self.payloads).clone()
        }
    }

    #[async_trait]
    impl Processor for MockProcessor {
        async fn process(
            &self,
            ctx: &InvocationContext,
            env: Env,
            payload: Bytes,
        ) -> ProcessorOutcome {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlightGuard(&self.in_flight);

            lock(&self.envs).push(env);
            lock(&self.payloads).push(payload);

            match &self.behavior {
                MockBehavior::Outcome(outcome) => outcome.clone(),
                MockBehavior::Sequence(outcomes) => outcomes
                    .get(call)
                    .or_else(|| outcomes.last())
                    .cloned()
                    .unwrap_or(Ok(())),
                MockBehavior::Delay(delay, outcome) => {
                    tokio::select! {
                        _ = tokio::time::sleep(*delay) => outcome.clone(),
                        _ = ctx.cancelled() => {
                            self.cancelled.fetch_add(1, Ordering::SeqCst);
                            Err(ProcessorError::Internal("invocation cancelled".to_string()))
                        }
                    }
                }
                MockBehavior::Hang => std::future::pending::<ProcessorOutcome>().await,
                MockBehavior::Panic(msg) => {
                    panic!("{}", msg); // Actually panic for panic isolation testing
                }
            }
        }
    }
}
