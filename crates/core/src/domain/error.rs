// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Invalid queue '{queue}': {reason}")]
    InvalidQueue { queue: String, reason: String },

    #[error("Duplicate queue name: {0}")]
    DuplicateQueue(String),

    #[error("No queues configured")]
    NoQueues,

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl DomainError {
    pub(crate) fn invalid_queue(queue: &str, reason: impl Into<String>) -> Self {
        DomainError::InvalidQueue {
            queue: queue.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DomainError>;
