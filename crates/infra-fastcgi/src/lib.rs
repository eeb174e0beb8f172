// FastCGI Infrastructure Adapter
// Hands message payloads to a FastCGI responder (e.g. php-fpm)

pub mod config;
pub mod processor;
pub mod protocol;
pub mod response;
pub mod testing;

pub use config::{FastCgiConfig, Network};
pub use processor::{FastCgiError, FastCgiProcessor};
pub use response::CgiResponse;
