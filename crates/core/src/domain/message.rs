// Message Domain Model

use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;

/// Broker-assigned delivery tag (unique within one channel)
pub type DeliveryTag = u64;

/// Message headers with scalar values rendered as strings
pub type Headers = BTreeMap<String, String>;

/// Header carrying the number of previous delivery attempts (set by quorum queues)
pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// A delivery pulled from a queue
///
/// Owned by the broker until a [`Disposition`] is applied to its delivery tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub delivery_tag: DeliveryTag,
    pub body: Bytes,
    pub headers: Headers,
    pub redelivered: bool,
}

impl Message {
    pub fn new(delivery_tag: DeliveryTag, body: impl Into<Bytes>) -> Self {
        Self {
            delivery_tag,
            body: body.into(),
            headers: Headers::new(),
            redelivered: false,
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Number of earlier deliveries, when the broker reports it
    pub fn delivery_count(&self) -> Option<u32> {
        self.headers
            .get(DELIVERY_COUNT_HEADER)
            .and_then(|v| v.trim().parse().ok())
    }
}

/// Final decision applied to a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Work completed, remove from queue
    Ack,
    /// Transient failure, hand back to the broker for redelivery
    Requeue,
    /// Payload rejected, drop (or dead-letter) without redelivery
    Discard,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Ack => "ack",
            Disposition::Requeue => "requeue",
            Disposition::Discard => "discard",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
