//! Sync session listeners bound to ports.
//!
//! Payload per event kind:
//!
//! | kind | payload |
//! |------|---------|
//! | connect, disconnect, login, complete | `Null` |
//! | login failure | `Int(code)` |
//! | change | `Array[Array[Int(type_id), Array[Int(id)..] puts, Array[Int(id)..] removals]..]` |
//! | server time | `Int(unix nanos)` |
//!
//! The kind is fixed when a listener is created and erased afterwards: one
//! close call serves every kind.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::engine::{
    SubscriptionId, SyncCallback, SyncChange, SyncEngine, SyncEvent, SyncEventKind,
};
use crate::error::{BridgeError, BridgeResult, HandleKind};
use crate::handle::{HandleTable, SyncListenerHandle};
use crate::port::{MessagePort, Payload, PortId};
use crate::subscription::Subscription;

/// Port payload for a sync event.
pub fn sync_event_payload(event: &SyncEvent) -> Payload {
    match event {
        SyncEvent::Connected
        | SyncEvent::Disconnected
        | SyncEvent::LoggedIn
        | SyncEvent::Complete => Payload::Null,
        SyncEvent::LoginFailed { code } => Payload::Int(i64::from(*code)),
        SyncEvent::Changes { changes } => {
            Payload::Array(changes.iter().map(change_payload).collect())
        }
        SyncEvent::ServerTime { unix_nanos } => Payload::Int(*unix_nanos),
    }
}

fn change_payload(change: &SyncChange) -> Payload {
    let ids = |ids: &[u64]| Payload::ints(ids.iter().map(|id| *id as i64));
    Payload::Array(vec![
        Payload::Int(i64::from(change.entity_id)),
        ids(&change.puts),
        ids(&change.removals),
    ])
}

struct ListenerEntry {
    sync: Arc<dyn SyncEngine>,
    kind: SyncEventKind,
    engine_id: SubscriptionId,
    subscription: Arc<Subscription>,
}

pub(crate) struct SyncListenerRegistry {
    poster: Arc<dyn MessagePort>,
    entries: Mutex<HandleTable<ListenerEntry>>,
}

impl SyncListenerRegistry {
    pub fn new(poster: Arc<dyn MessagePort>) -> Self {
        Self {
            poster,
            entries: Mutex::new(HandleTable::new()),
        }
    }

    pub fn listen(
        &self,
        sync: &Arc<dyn SyncEngine>,
        kind: SyncEventKind,
        port: PortId,
    ) -> BridgeResult<SyncListenerHandle> {
        let subscription = Subscription::new(port, self.poster.clone());
        let sink = subscription.clone();
        let callback: SyncCallback = Arc::new(move |event: &SyncEvent| {
            if event.kind() != kind {
                return;
            }
            sink.deliver(|| sync_event_payload(event));
        });

        let engine_id = sync
            .listen(kind, callback)
            .map_err(|err| BridgeError::from_engine(HandleKind::Sync, err))?;

        let inserted = self.entries.lock().insert(ListenerEntry {
            sync: sync.clone(),
            kind,
            engine_id,
            subscription: subscription.clone(),
        });
        let Ok(raw) = inserted else {
            subscription.close();
            sync.unlisten(kind, engine_id);
            return Err(BridgeError::AllocationFailure(
                "sync listener table exhausted".to_string(),
            ));
        };

        tracing::debug!(port = %port, %kind, "sync listener registered");
        Ok(SyncListenerHandle(raw))
    }

    /// Closes a listener of any kind; `None` is a no-op.
    pub fn close(&self, handle: Option<SyncListenerHandle>) -> BridgeResult<()> {
        let Some(handle) = handle else {
            return Ok(());
        };
        let entry = self
            .entries
            .lock()
            .remove(handle.0)
            .ok_or_else(|| BridgeError::invalid_handle(HandleKind::SyncListener))?;

        entry.subscription.close();
        entry.sync.unlisten(entry.kind, entry.engine_id);
        tracing::debug!(
            port = %entry.subscription.port(),
            kind = %entry.kind,
            delivered = entry.subscription.delivered(),
            "sync listener closed"
        );
        Ok(())
    }

    pub fn kind_of(&self, handle: SyncListenerHandle) -> Option<SyncEventKind> {
        self.entries.lock().get(handle.0).map(|entry| entry.kind)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn close_all(&self) {
        let entries = self.entries.lock().drain();
        for entry in entries {
            entry.subscription.close();
            entry.sync.unlisten(entry.kind, entry.engine_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySync;
    use crate::port::LocalPorts;

    #[test]
    fn change_event_payload_lists_puts_and_removals() {
        let payload = sync_event_payload(&SyncEvent::Changes {
            changes: vec![SyncChange {
                entity_id: 3,
                puts: vec![10, 11],
                removals: vec![4],
            }],
        });
        assert_eq!(
            payload,
            Payload::Array(vec![Payload::Array(vec![
                Payload::Int(3),
                Payload::ints([10, 11]),
                Payload::ints([4]),
            ])])
        );
    }

    #[test]
    fn listener_only_receives_its_kind() {
        let ports = LocalPorts::new(0);
        let registry = SyncListenerRegistry::new(Arc::new(ports.clone()));
        let sync = Arc::new(MemorySync::new());
        let engine: Arc<dyn SyncEngine> = sync.clone();
        let rx = ports.open();

        let handle = registry
            .listen(&engine, SyncEventKind::LoginFailure, rx.id())
            .expect("listen");
        assert_eq!(registry.kind_of(handle), Some(SyncEventKind::LoginFailure));

        sync.emit(&SyncEvent::Connected);
        sync.emit(&SyncEvent::LoginFailed { code: 43 });
        assert_eq!(rx.drain(), vec![Payload::Int(43)]);

        registry.close(Some(handle)).expect("close");
        sync.emit(&SyncEvent::LoginFailed { code: 44 });
        assert!(rx.drain().is_empty());
        assert_eq!(registry.close(None), Ok(()));
    }
}
