// Port Layer - Interfaces for external collaborators

pub mod broker;
pub mod processor;

// Re-exports
pub use broker::{Acknowledger, Broker, BrokerError, Subscription};
pub use processor::{Env, InvocationContext, Processor, ProcessorError, ProcessorOutcome};
