// AMQP Bridge Core - Dispatch Engine & Ports
// NO infrastructure dependencies: brokers and processors plug in through `port`

pub mod application;
pub mod domain;
pub mod error;
pub mod port;

pub use error::{AppError, Result};
