// Domain Layer - Queue definitions, messages and dispositions

pub mod error;
pub mod message;
pub mod queue;

// Re-exports
pub use error::DomainError;
pub use message::{DeliveryTag, Disposition, Headers, Message, DELIVERY_COUNT_HEADER};
pub use queue::{QueueConfig, QueueId};
