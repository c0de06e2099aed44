//! Native port channels.
//!
//! A port is an integer-identified, single-consumer destination. The bridge
//! posts to ports through [`MessagePort`] from arbitrary engine threads; the
//! host binds that trait to its own posting primitive. [`LocalPorts`] is the
//! in-process implementation used by tests and the demo CLI.
//!
//! # Ordering
//!
//! Messages posted by one thread to one port arrive in post order. Nothing
//! is promised across ports, or across producer threads sharing a port
//! beyond what the queue's own serialization gives (at least causally
//! consistent per single producer thread).
//!
//! # Backpressure
//!
//! Posting never blocks. When a bounded port queue is full the new message
//! is dropped, counted, and `post` returns `false`.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::config::BridgeConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(pub i64);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Body of a message posted to a port.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    /// Owned copy of a byte buffer.
    Bytes(Vec<u8>),
    /// Reference to a buffer shared with the producer.
    SharedBytes(Arc<[u8]>),
    Array(Vec<Payload>),
}

impl Payload {
    pub fn ints(values: impl IntoIterator<Item = i64>) -> Self {
        Payload::Array(values.into_iter().map(Payload::Int).collect())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Payload::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Payload]> {
        match self {
            Payload::Array(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    /// Raw bytes of either byte-carrying variant.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(bytes) => Some(bytes.as_slice()),
            Payload::SharedBytes(bytes) => Some(&bytes[..]),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Payload::Null)
    }
}

/// Destination the bridge posts through.
pub trait MessagePort: Send + Sync {
    /// Hands `payload` to `port` for asynchronous delivery. Returns whether it
    /// was accepted; acceptance is not delivery confirmation. Must not block.
    ///
    /// The bridge calls this while holding the posting subscription's gate.
    /// An implementation must not call back into the bridge (for example
    /// `close_observer` or `close_stream`) from inside `post`; doing so
    /// deadlocks.
    fn post(&self, port: PortId, payload: Payload) -> bool;

    /// Whether `port` can still accept messages. Stream workers stop
    /// retrying their end marker once this turns false.
    fn is_open(&self, _port: PortId) -> bool {
        true
    }
}

/// Adapts a host posting function to [`MessagePort`].
pub struct FnPort<F>(pub F);

impl<F> MessagePort for FnPort<F>
where
    F: Fn(PortId, Payload) -> bool + Send + Sync,
{
    fn post(&self, port: PortId, payload: Payload) -> bool {
        (self.0)(port, payload)
    }
}

/// Counters kept by [`LocalPorts`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PortStats {
    /// Messages accepted into a port queue.
    pub accepted: u64,
    /// Messages dropped because the port queue was full.
    pub dropped_full: u64,
    /// Messages posted to a port that is not open.
    pub dropped_closed: u64,
}

struct OpenPort {
    token: u64,
    sender: Sender<Payload>,
}

struct PortsInner {
    next_port: AtomicI64,
    next_token: AtomicU64,
    capacity: usize,
    senders: RwLock<HashMap<PortId, OpenPort>>,
    stats: Mutex<PortStats>,
}

impl PortsInner {
    fn close(&self, port: PortId) -> bool {
        self.senders.write().remove(&port).is_some()
    }

    /// Closes `port` only while it is still the instance identified by `token`.
    fn close_instance(&self, port: PortId, token: u64) {
        let mut senders = self.senders.write();
        if senders.get(&port).is_some_and(|open| open.token == token) {
            senders.remove(&port);
        }
    }

    fn record(&self, update: impl FnOnce(&mut PortStats)) {
        update(&mut *self.stats.lock());
    }
}

/// In-process port registry: one bounded MPSC queue per open port.
///
/// Cloning is cheap and all clones share the same ports.
#[derive(Clone)]
pub struct LocalPorts {
    inner: Arc<PortsInner>,
}

impl LocalPorts {
    /// Creates a registry whose queues hold at most `capacity` pending
    /// messages each; `0` means unbounded.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PortsInner {
                next_port: AtomicI64::new(1),
                next_token: AtomicU64::new(1),
                capacity,
                senders: RwLock::new(HashMap::new()),
                stats: Mutex::new(PortStats::default()),
            }),
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(config.port_queue_capacity)
    }

    /// Opens a port with a freshly allocated id.
    pub fn open(&self) -> PortReceiver {
        let id = PortId(self.inner.next_port.fetch_add(1, Ordering::Relaxed));
        self.open_with_id(id)
    }

    /// Opens a port under a caller-chosen id, replacing any port already open
    /// under that id.
    pub fn open_with_id(&self, id: PortId) -> PortReceiver {
        let (tx, rx) = if self.inner.capacity == 0 {
            crossbeam_channel::unbounded()
        } else {
            crossbeam_channel::bounded(self.inner.capacity)
        };
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let open = OpenPort { token, sender: tx };
        if self.inner.senders.write().insert(id, open).is_some() {
            tracing::debug!(port = %id, "replaced open port");
        }
        PortReceiver {
            id,
            token,
            rx,
            owner: Arc::downgrade(&self.inner),
        }
    }

    /// Closes `port`; later posts to it are rejected.
    pub fn close(&self, port: PortId) -> bool {
        self.inner.close(port)
    }

    pub fn is_open(&self, port: PortId) -> bool {
        self.inner.senders.read().contains_key(&port)
    }

    pub fn stats(&self) -> PortStats {
        self.inner.stats.lock().clone()
    }
}

impl MessagePort for LocalPorts {
    fn is_open(&self, port: PortId) -> bool {
        LocalPorts::is_open(self, port)
    }

    fn post(&self, port: PortId, payload: Payload) -> bool {
        let sent = match self.inner.senders.read().get(&port) {
            Some(open) => open.sender.try_send(payload),
            None => Err(TrySendError::Disconnected(payload)),
        };
        match sent {
            Ok(()) => {
                self.inner.record(|stats| stats.accepted += 1);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.inner.record(|stats| stats.dropped_full += 1);
                tracing::warn!(port = %port, "port queue full; message dropped");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.inner.record(|stats| stats.dropped_closed += 1);
                false
            }
        }
    }
}

/// Consumer end of a [`LocalPorts`] port. Dropping it closes the port.
pub struct PortReceiver {
    id: PortId,
    token: u64,
    rx: Receiver<Payload>,
    owner: Weak<PortsInner>,
}

impl PortReceiver {
    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn try_recv(&self) -> Option<Payload> {
        self.rx.try_recv().ok()
    }

    /// Waits up to `timeout` for the next message.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Payload> {
        match self.rx.recv_timeout(timeout) {
            Ok(payload) => Some(payload),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Takes every message currently queued.
    pub fn drain(&self) -> Vec<Payload> {
        self.rx.try_iter().collect()
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl Drop for PortReceiver {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.close_instance(self.id, self.token);
        }
    }
}

impl fmt::Debug for PortReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortReceiver")
            .field("id", &self.id)
            .field("pending", &self.rx.len())
            .finish()
    }
}
