use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::port::{MessagePort, Payload, PortId};

/// Delivery gate shared between an engine callback and the registry entry
/// that owns it.
///
/// Posting happens while holding the gate lock and `close` takes the same
/// lock, so once `close` returns no post for this subscription can still be
/// in flight. Posting never blocks, so holding the lock across it cannot
/// stall the engine thread behind a slow consumer.
pub(crate) struct Subscription {
    port: PortId,
    poster: Arc<dyn MessagePort>,
    open: Mutex<bool>,
    delivered: AtomicU64,
    rejected: AtomicU64,
}

impl Subscription {
    pub fn new(port: PortId, poster: Arc<dyn MessagePort>) -> Arc<Self> {
        Arc::new(Self {
            port,
            poster,
            open: Mutex::new(true),
            delivered: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        })
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    /// Posts `payload` unless the subscription is closed. `payload` is only
    /// built when it will be posted.
    pub fn deliver(&self, payload: impl FnOnce() -> Payload) -> bool {
        let open = self.open.lock();
        if !*open {
            return false;
        }
        let accepted = self.poster.post(self.port, payload());
        drop(open);

        if accepted {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(port = %self.port, "port rejected subscription event");
        }
        accepted
    }

    /// Fences out further deliveries. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        std::mem::replace(&mut *self.open.lock(), false)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
