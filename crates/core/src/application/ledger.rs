// Delivery ledger: which deliveries of a queue still await their disposition

use crate::domain::{DeliveryTag, Disposition};
use crate::port::Acknowledger;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Identifies a delivery across resubscriptions
///
/// Delivery tags restart on every new channel, so the subscription epoch is
/// part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryKey {
    pub epoch: u64,
    pub tag: DeliveryTag,
}

/// Outstanding deliveries of one queue
///
/// A key is inserted when the supervisor receives a delivery and removed by the
/// first settlement; the removal is the only gate for sending a disposition.
#[derive(Debug, Default)]
pub struct DeliveryLedger {
    outstanding: Mutex<HashSet<DeliveryKey>>,
}

impl DeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<DeliveryKey>> {
        self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a fresh delivery; false if the key was already outstanding
    pub fn track(&self, key: DeliveryKey) -> bool {
        self.lock().insert(key)
    }

    pub fn is_outstanding(&self, key: DeliveryKey) -> bool {
        self.lock().contains(&key)
    }

    /// Claim the right to settle `key`; only the first caller gets true
    pub fn release(&self, key: DeliveryKey) -> bool {
        self.lock().remove(&key)
    }

    /// Forget every delivery of a lost subscription (the broker redelivers them)
    pub fn forget_epoch(&self, epoch: u64) -> usize {
        let mut outstanding = self.lock();
        let before = outstanding.len();
        outstanding.retain(|k| k.epoch != epoch);
        before - outstanding.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Apply `disposition` to a delivery unless it was already settled
///
/// Returns true if a disposition was sent to the broker.
pub async fn settle(
    queue: &str,
    ledger: &DeliveryLedger,
    acker: &dyn Acknowledger,
    key: DeliveryKey,
    disposition: Disposition,
) -> bool {
    if !ledger.release(key) {
        debug!(
            queue = %queue,
            delivery_tag = key.tag,
            disposition = %disposition,
            "Delivery already settled or forgotten, skipping"
        );
        return false;
    }

    if let Err(e) = acker.settle(key.tag, disposition).await {
        // the channel is gone; the broker redelivers unsettled messages
        warn!(
            queue = %queue,
            delivery_tag = key.tag,
            disposition = %disposition,
            error = %e,
            "Failed to settle delivery"
        );
    }
    true
}
