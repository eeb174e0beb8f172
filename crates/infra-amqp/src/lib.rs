// AMQP Infrastructure Adapter
// Implements the Broker port on top of lapin

pub mod broker;
pub mod headers;

pub use broker::{AmqpBroker, AmqpSubscription};
pub use headers::headers_from_table;
