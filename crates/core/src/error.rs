// Central Error Type for the Application

use thiserror::Error;

/// Application-level error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Invalid queue or consumer definition; only raised before any supervisor runs
    #[error("Configuration error: {0}")]
    Config(#[from] crate::domain::DomainError),

    #[error("Broker error: {0}")]
    Broker(#[from] crate::port::BrokerError),
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
