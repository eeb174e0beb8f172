// Application Layer - dispatch engine

pub mod consumer;
pub mod env;
pub mod ledger;
pub mod retry;
pub mod supervisor;
pub mod worker;

// Re-exports
pub use consumer::{Consumer, ConsumerConfig, StopReport};
pub use env::{merge_env, message_env, with_env, ProcessorWithEnv};
pub use retry::{disposition_for, Backoff, BackoffConfig, RedeliveryPolicy};
pub use supervisor::{QueueSupervisor, SupervisorHandle, SupervisorState};
pub use worker::{shutdown_channel, ShutdownSender, ShutdownToken, Worker, WorkerPool};
