// Queue Domain Model

use super::error::{DomainError, Result};
use crate::port::Processor;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Queue identifier
pub type QueueId = String;

/// Workers per queue when parallelism is not configured
pub const DEFAULT_PARALLELISM: usize = 1;

/// Processor deadline when failure timeout is not configured (10s)
pub const DEFAULT_FAILURE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-queue consumption settings
///
/// Built once at startup and immutable afterwards; every setter consumes `self`.
#[derive(Clone)]
pub struct QueueConfig {
    name: QueueId,
    prefetch: Option<u16>,
    parallelism: usize,
    failure_timeout: Duration,
    max_redeliveries: Option<u32>,
    processor: Arc<dyn Processor>,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, processor: Arc<dyn Processor>) -> Self {
        Self {
            name: name.into(),
            prefetch: None,
            parallelism: DEFAULT_PARALLELISM,
            failure_timeout: DEFAULT_FAILURE_TIMEOUT,
            max_redeliveries: None,
            processor,
        }
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = Some(prefetch);
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_failure_timeout(mut self, failure_timeout: Duration) -> Self {
        self.failure_timeout = failure_timeout;
        self
    }

    /// Cap on broker-reported redeliveries before a requeue turns into a discard
    pub fn with_max_redeliveries(mut self, max_redeliveries: u32) -> Self {
        self.max_redeliveries = Some(max_redeliveries);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Broker prefetch; falls back to parallelism
    pub fn prefetch(&self) -> u16 {
        self.prefetch
            .unwrap_or_else(|| u16::try_from(self.parallelism).unwrap_or(u16::MAX))
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    pub fn failure_timeout(&self) -> Duration {
        self.failure_timeout
    }

    pub fn max_redeliveries(&self) -> Option<u32> {
        self.max_redeliveries
    }

    pub fn processor(&self) -> &Arc<dyn Processor> {
        &self.processor
    }

    /// Validate settings (startup only)
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::ValidationError(
                "Queue name cannot be empty".to_string(),
            ));
        }

        if self.parallelism == 0 {
            return Err(DomainError::invalid_queue(
                &self.name,
                "parallelism must be positive",
            ));
        }

        if self.prefetch.is_none() && self.parallelism > u16::MAX as usize {
            return Err(DomainError::invalid_queue(
                &self.name,
                format!("parallelism {} exceeds the broker prefetch range", self.parallelism),
            ));
        }

        if self.prefetch == Some(0) {
            return Err(DomainError::invalid_queue(
                &self.name,
                "prefetch must be positive",
            ));
        }

        if self.failure_timeout.is_zero() {
            return Err(DomainError::invalid_queue(
                &self.name,
                "failure timeout must be positive",
            ));
        }

        Ok(())
    }
}

impl fmt::Debug for QueueConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueConfig")
            .field("name", &self.name)
            .field("prefetch", &self.prefetch())
            .field("parallelism", &self.parallelism)
            .field("failure_timeout", &self.failure_timeout)
            .field("max_redeliveries", &self.max_redeliveries)
            .finish_non_exhaustive()
    }
}
