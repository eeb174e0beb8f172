// Dispatch constants (no magic values)
use std::time::Duration;

/// First delay before reopening a lost subscription (1s)
pub const RESUBSCRIBE_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for the resubscribe delay (30s)
pub const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(30);

/// Growth factor between consecutive resubscribe attempts
pub const RESUBSCRIBE_BACKOFF_FACTOR: f64 = 2.0;

/// How long a timed-out processor may take to honor cancellation before it is aborted
pub const CANCEL_GRACE_PERIOD: Duration = Duration::from_millis(500);

/// Overall deadline for Consumer::stop (30s)
/// Must exceed the largest failure timeout for in-flight work to finish
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Prefix for message headers exposed to processors (CGI convention)
pub const HEADER_ENV_PREFIX: &str = "HTTP_";

/// Env key carrying the source queue name
pub const QUEUE_ENV_KEY: &str = "AMQP_QUEUE";

/// Env key set to "1" when the broker flags the delivery as redelivered
pub const REDELIVERED_ENV_KEY: &str = "AMQP_REDELIVERED";
