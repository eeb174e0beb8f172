// Retry logic: outcome → disposition, redelivery cap, resubscribe backoff
use super::worker::constants::{
    RESUBSCRIBE_BACKOFF_FACTOR, RESUBSCRIBE_BASE_DELAY, RESUBSCRIBE_MAX_DELAY,
};
use crate::domain::{Disposition, Message};
use crate::port::{ProcessorError, ProcessorOutcome};
use std::time::Duration;
use tracing::warn;

/// Base mapping from processor outcome to disposition
///
/// | Outcome                             | Disposition |
/// |-------------------------------------|-------------|
/// | `Ok(())`                            | Ack         |
/// | `Internal` / `UnknownStatus`        | Requeue     |
/// | `ProcessingError` / `ProcessingFailed` | Discard  |
pub fn disposition_for(outcome: &ProcessorOutcome) -> Disposition {
    match outcome {
        Ok(()) => Disposition::Ack,
        Err(ProcessorError::Internal(_)) | Err(ProcessorError::UnknownStatus(_)) => {
            Disposition::Requeue
        }
        Err(ProcessorError::ProcessingError(_)) | Err(ProcessorError::ProcessingFailed(_)) => {
            Disposition::Discard
        }
    }
}

/// Redelivery policy
///
/// Without a cap every retryable failure is requeued indefinitely. With a cap,
/// a message whose broker-reported delivery count reached it is discarded
/// instead (dead-lettered when the queue has a DLX).
#[derive(Debug, Clone, Copy, Default)]
pub struct RedeliveryPolicy {
    max_redeliveries: Option<u32>,
}

impl RedeliveryPolicy {
    pub fn new(max_redeliveries: Option<u32>) -> Self {
        Self { max_redeliveries }
    }

    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Decide the disposition for a processed message
    pub fn decide(&self, queue: &str, outcome: &ProcessorOutcome, message: &Message) -> Disposition {
        let disposition = disposition_for(outcome);
        if disposition != Disposition::Requeue {
            return disposition;
        }

        match (self.max_redeliveries, message.delivery_count()) {
            (Some(max), Some(count)) if count >= max => {
                warn!(
                    queue = %queue,
                    delivery_tag = message.delivery_tag,
                    delivery_count = count,
                    max_redeliveries = max,
                    "Redelivery cap reached, discarding instead of requeueing"
                );
                Disposition::Discard
            }
            _ => Disposition::Requeue,
        }
    }
}

/// Resubscribe backoff settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: RESUBSCRIBE_BASE_DELAY,
            max_delay: RESUBSCRIBE_MAX_DELAY,
            factor: RESUBSCRIBE_BACKOFF_FACTOR,
        }
    }
}

/// Exponential backoff with deterministic jitter
///
/// delay = min(base * factor ^ attempt, max) * (1.0 ± 0.1)
///
/// The jitter is seeded from the queue name so sibling supervisors that lost
/// the same connection do not reconnect in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    seed: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig, seed_key: &str) -> Self {
        Self {
            config,
            seed: seed_key.chars().map(|c| c as u32).fold(0u32, u32::wrapping_add),
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.config.factor.powi(self.attempt.min(32) as i32);
        let raw = self.config.base_delay.as_secs_f64() * exp;
        let capped = raw.min(self.config.max_delay.as_secs_f64());

        let jitter_factor = 0.9 + (self.seed.wrapping_add(self.attempt) % 21) as f64 / 100.0; // 0.9 to 1.1
        self.attempt = self.attempt.saturating_add(1);

        Duration::from_secs_f64(capped * jitter_factor)
    }

    /// Back to the base delay after a successful subscription
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
