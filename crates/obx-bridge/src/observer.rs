//! Data-change observers bound to ports.
//!
//! Each change notification is posted as `Array[Int(type_id)...]` listing the
//! entity types touched by the committed transaction.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::engine::{ChangeCallback, SchemaId, StoreEngine, SubscriptionId};
use crate::error::{BridgeError, BridgeResult, HandleKind};
use crate::handle::{HandleTable, ObserverHandle};
use crate::port::{MessagePort, Payload, PortId};
use crate::subscription::Subscription;

struct ObserverEntry {
    store: Arc<dyn StoreEngine>,
    engine_id: SubscriptionId,
    subscription: Arc<Subscription>,
    type_filter: Option<SchemaId>,
}

/// Snapshot of one live observer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObserverInfo {
    pub port: PortId,
    pub type_filter: Option<SchemaId>,
    pub delivered: u64,
    /// Changes the port refused.
    pub rejected: u64,
}

pub(crate) struct ObserverRegistry {
    poster: Arc<dyn MessagePort>,
    entries: Mutex<HandleTable<ObserverEntry>>,
}

impl ObserverRegistry {
    pub fn new(poster: Arc<dyn MessagePort>) -> Self {
        Self {
            poster,
            entries: Mutex::new(HandleTable::new()),
        }
    }

    pub fn observe(
        &self,
        store: &Arc<dyn StoreEngine>,
        type_filter: Option<SchemaId>,
        port: PortId,
    ) -> BridgeResult<ObserverHandle> {
        let subscription = Subscription::new(port, self.poster.clone());
        let sink = subscription.clone();
        let callback: ChangeCallback = Arc::new(move |type_ids: &[SchemaId]| {
            sink.deliver(|| Payload::ints(type_ids.iter().map(|id| i64::from(*id))));
        });

        let engine_id = store
            .observe(type_filter, callback)
            .map_err(|err| BridgeError::from_engine(HandleKind::Store, err))?;

        let inserted = self.entries.lock().insert(ObserverEntry {
            store: store.clone(),
            engine_id,
            subscription: subscription.clone(),
            type_filter,
        });
        let Ok(raw) = inserted else {
            subscription.close();
            store.unobserve(engine_id);
            return Err(BridgeError::AllocationFailure(
                "observer table exhausted".to_string(),
            ));
        };

        tracing::debug!(port = %port, ?type_filter, "observer registered");
        Ok(ObserverHandle(raw))
    }

    /// Closes `handle`; `None` is a no-op. No change for this observer is
    /// posted once this returns.
    pub fn close(&self, handle: Option<ObserverHandle>) -> BridgeResult<()> {
        let Some(handle) = handle else {
            return Ok(());
        };
        let entry = self
            .entries
            .lock()
            .remove(handle.0)
            .ok_or_else(|| BridgeError::invalid_handle(HandleKind::Observer))?;

        entry.subscription.close();
        entry.store.unobserve(entry.engine_id);
        tracing::debug!(
            port = %entry.subscription.port(),
            delivered = entry.subscription.delivered(),
            "observer closed"
        );
        Ok(())
    }

    pub fn info(&self, handle: ObserverHandle) -> Option<ObserverInfo> {
        let entries = self.entries.lock();
        let entry = entries.get(handle.0)?;
        Some(ObserverInfo {
            port: entry.subscription.port(),
            type_filter: entry.type_filter,
            delivered: entry.subscription.delivered(),
            rejected: entry.subscription.rejected(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Closes every observer; used on teardown.
    pub fn close_all(&self) {
        let entries = self.entries.lock().drain();
        for entry in entries {
            entry.subscription.close();
            entry.store.unobserve(entry.engine_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::port::LocalPorts;

    fn setup() -> (LocalPorts, ObserverRegistry, Arc<MemoryStore>) {
        let ports = LocalPorts::new(0);
        let registry = ObserverRegistry::new(Arc::new(ports.clone()));
        (ports, registry, Arc::new(MemoryStore::new()))
    }

    #[test]
    fn single_type_observer_ignores_other_types() {
        let (ports, registry, store) = setup();
        let rx = ports.open();
        let engine: Arc<dyn StoreEngine> = store.clone();

        let handle = registry
            .observe(&engine, Some(2), rx.id())
            .expect("observe should succeed");

        store.commit(&[1]);
        store.commit(&[1, 2]);

        assert_eq!(rx.drain(), vec![Payload::ints([2])]);
        let info = registry.info(handle).expect("observer should be live");
        assert_eq!(info.type_filter, Some(2));
        assert_eq!(info.delivered, 1);
    }

    #[test]
    fn closing_twice_reports_invalid_handle() {
        let (ports, registry, store) = setup();
        let rx = ports.open();
        let engine: Arc<dyn StoreEngine> = store.clone();
        let handle = registry.observe(&engine, None, rx.id()).expect("observe");

        registry.close(Some(handle)).expect("first close");
        let err = registry.close(Some(handle)).expect_err("second close");
        assert_eq!(err, BridgeError::invalid_handle(HandleKind::Observer));
        assert_eq!(store.observer_count(), 0);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn closed_store_is_invalid_handle() {
        let (ports, registry, store) = setup();
        let rx = ports.open();
        store.close();
        let engine: Arc<dyn StoreEngine> = store;
        let err = registry
            .observe(&engine, None, rx.id())
            .expect_err("observe on closed store");
        assert_eq!(err, BridgeError::invalid_handle(HandleKind::Store));
    }
}
