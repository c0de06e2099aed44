//! Boundary surface of the bridge.
//!
//! A [`Bridge`] is bound once to the host's posting primitive with
//! [`Bridge::init`]; every other operation fails with
//! [`BridgeError::NotInitialized`] until then, except closing a `None`
//! handle, which is always a no-op.

use once_cell::sync::{Lazy, OnceCell};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::async_put::AsyncPutAdapter;
use crate::config::BridgeConfig;
use crate::engine::{
    AsyncEngine, PutMode, QueryEngine, SchemaId, StoreEngine, SyncEngine, SyncEventKind,
};
use crate::error::{BridgeError, BridgeResult, HandleKind};
use crate::finalizer::{
    Attachment, CleanupFn, FinalizerRegistry, FinalizerStats, ManagedRef, NativePtr,
};
use crate::handle::{FinalizerHandle, ObserverHandle, StreamHandle, SyncListenerHandle};
use crate::listener::SyncListenerRegistry;
use crate::observer::{ObserverInfo, ObserverRegistry};
use crate::port::{MessagePort, PortId};
use crate::stream::{CopySemantics, QueryStreams};

struct Runtime {
    observers: ObserverRegistry,
    listeners: SyncListenerRegistry,
    puts: AsyncPutAdapter,
    streams: QueryStreams,
    finalizers: FinalizerRegistry,
}

impl Runtime {
    fn new(poster: Arc<dyn MessagePort>, config: &BridgeConfig) -> Self {
        Self {
            observers: ObserverRegistry::new(poster.clone()),
            listeners: SyncListenerRegistry::new(poster.clone()),
            puts: AsyncPutAdapter::new(poster.clone()),
            streams: QueryStreams::new(
                poster,
                config.stream_thread_name.clone(),
                Duration::from_millis(config.stream_terminal_timeout_ms),
            ),
            finalizers: FinalizerRegistry::new(config.max_finalizers),
        }
    }

    fn shutdown(&self) {
        self.observers.close_all();
        self.listeners.close_all();
        self.streams.close_all();
        let ran = self.finalizers.shutdown();
        tracing::debug!(finalizers_ran = ran, "bridge runtime shut down");
    }
}

/// Live resource counts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    pub observers: usize,
    pub sync_listeners: usize,
    pub streams: usize,
    pub puts_in_flight: usize,
    pub finalizers: FinalizerStats,
}

pub struct Bridge {
    config: BridgeConfig,
    runtime: OnceCell<Runtime>,
}

static GLOBAL: Lazy<Bridge> = Lazy::new(|| {
    let config = BridgeConfig::from_env().unwrap_or_else(|err| {
        tracing::warn!(%err, "ignoring bridge environment overrides");
        BridgeConfig::default()
    });
    Bridge::new(config)
});

/// Process-wide bridge for hosts that cannot carry a `Bridge` reference.
/// Configured from `OBX_BRIDGE_*` environment variables on first use.
pub fn global() -> &'static Bridge {
    &GLOBAL
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            runtime: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Binds the bridge to `poster`. Only the first call binds; later calls
    /// succeed and keep the first binding.
    pub fn init(&self, poster: Arc<dyn MessagePort>) -> BridgeResult<()> {
        let mut bound = false;
        self.runtime.get_or_init(|| {
            bound = true;
            Runtime::new(poster, &self.config)
        });
        if bound {
            tracing::info!(
                max_finalizers = self.config.max_finalizers,
                stream_thread = %self.config.stream_thread_name,
                "bridge initialized"
            );
        } else {
            tracing::debug!("bridge already initialized; keeping first binding");
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.runtime.get().is_some()
    }

    fn runtime(&self) -> BridgeResult<&Runtime> {
        self.runtime.get().ok_or(BridgeError::NotInitialized)
    }

    pub fn observe(
        &self,
        store: &Arc<dyn StoreEngine>,
        port: PortId,
    ) -> BridgeResult<ObserverHandle> {
        self.runtime()?.observers.observe(store, None, port)
    }

    pub fn observe_single_type(
        &self,
        store: &Arc<dyn StoreEngine>,
        type_id: SchemaId,
        port: PortId,
    ) -> BridgeResult<ObserverHandle> {
        self.runtime()?.observers.observe(store, Some(type_id), port)
    }

    /// No change for the observer is posted once this returns.
    pub fn close_observer(&self, handle: Option<ObserverHandle>) -> BridgeResult<()> {
        if handle.is_none() {
            return Ok(());
        }
        self.runtime()?.observers.close(handle)
    }

    pub fn observer_info(&self, handle: ObserverHandle) -> BridgeResult<ObserverInfo> {
        self.runtime()?
            .observers
            .info(handle)
            .ok_or_else(|| BridgeError::invalid_handle(HandleKind::Observer))
    }

    /// Registers a listener for `kind`. The session keeps one listener per
    /// kind, so this replaces any earlier listener of the same kind at the
    /// engine.
    pub fn sync_listener(
        &self,
        sync: &Arc<dyn SyncEngine>,
        kind: SyncEventKind,
        port: PortId,
    ) -> BridgeResult<SyncListenerHandle> {
        self.runtime()?.listeners.listen(sync, kind, port)
    }

    pub fn sync_listener_connect(
        &self,
        sync: &Arc<dyn SyncEngine>,
        port: PortId,
    ) -> BridgeResult<SyncListenerHandle> {
        self.sync_listener(sync, SyncEventKind::Connect, port)
    }

    pub fn sync_listener_disconnect(
        &self,
        sync: &Arc<dyn SyncEngine>,
        port: PortId,
    ) -> BridgeResult<SyncListenerHandle> {
        self.sync_listener(sync, SyncEventKind::Disconnect, port)
    }

    pub fn sync_listener_login(
        &self,
        sync: &Arc<dyn SyncEngine>,
        port: PortId,
    ) -> BridgeResult<SyncListenerHandle> {
        self.sync_listener(sync, SyncEventKind::Login, port)
    }

    pub fn sync_listener_login_failure(
        &self,
        sync: &Arc<dyn SyncEngine>,
        port: PortId,
    ) -> BridgeResult<SyncListenerHandle> {
        self.sync_listener(sync, SyncEventKind::LoginFailure, port)
    }

    pub fn sync_listener_complete(
        &self,
        sync: &Arc<dyn SyncEngine>,
        port: PortId,
    ) -> BridgeResult<SyncListenerHandle> {
        self.sync_listener(sync, SyncEventKind::Complete, port)
    }

    pub fn sync_listener_change(
        &self,
        sync: &Arc<dyn SyncEngine>,
        port: PortId,
    ) -> BridgeResult<SyncListenerHandle> {
        self.sync_listener(sync, SyncEventKind::Change, port)
    }

    pub fn sync_listener_server_time(
        &self,
        sync: &Arc<dyn SyncEngine>,
        port: PortId,
    ) -> BridgeResult<SyncListenerHandle> {
        self.sync_listener(sync, SyncEventKind::ServerTime, port)
    }

    pub fn sync_listener_kind(&self, handle: SyncListenerHandle) -> BridgeResult<SyncEventKind> {
        self.runtime()?
            .listeners
            .kind_of(handle)
            .ok_or_else(|| BridgeError::invalid_handle(HandleKind::SyncListener))
    }

    pub fn close_sync_listener(&self, handle: Option<SyncListenerHandle>) -> BridgeResult<()> {
        if handle.is_none() {
            return Ok(());
        }
        self.runtime()?.listeners.close(handle)
    }

    /// Queues an asynchronous write and returns the object id. Its outcome is
    /// posted to `port` as one `Array[Int(id), Int(code)]` message.
    pub fn put_object_async(
        &self,
        ctx: &Arc<dyn AsyncEngine>,
        port: PortId,
        bytes: Vec<u8>,
        mode: PutMode,
    ) -> BridgeResult<u64> {
        self.runtime()?.puts.put(ctx, port, bytes, mode)
    }

    pub fn puts_in_flight(&self) -> BridgeResult<usize> {
        Ok(self.runtime()?.puts.in_flight())
    }

    /// Streams copies of the query's rows to `port`.
    pub fn query_find_stream(
        &self,
        query: &Arc<dyn QueryEngine>,
        port: PortId,
    ) -> BridgeResult<StreamHandle> {
        self.query_stream(query, port, CopySemantics::Value)
    }

    /// Streams the query's rows to `port` without copying them.
    pub fn query_find_stream_by_reference(
        &self,
        query: &Arc<dyn QueryEngine>,
        port: PortId,
    ) -> BridgeResult<StreamHandle> {
        self.query_stream(query, port, CopySemantics::Reference)
    }

    pub fn query_stream(
        &self,
        query: &Arc<dyn QueryEngine>,
        port: PortId,
        semantics: CopySemantics,
    ) -> BridgeResult<StreamHandle> {
        self.runtime()?.streams.open(query, port, semantics)
    }

    pub fn close_stream(&self, handle: StreamHandle) -> BridgeResult<()> {
        self.runtime()?.streams.close(handle)
    }

    /// Whether the stream has posted its terminal message.
    pub fn is_stream_finished(&self, handle: StreamHandle) -> BridgeResult<bool> {
        self.runtime()?
            .streams
            .is_finished(handle)
            .ok_or_else(|| BridgeError::invalid_handle(HandleKind::Stream))
    }

    /// Attaches `cleanup(native_ptr)` to `object`. A refused attachment hands
    /// the cleanup back; the caller must then release `native_ptr` itself.
    pub fn attach_finalizer(
        &self,
        object: &ManagedRef,
        cleanup: CleanupFn,
        native_ptr: NativePtr,
        size_hint: usize,
    ) -> BridgeResult<Attachment> {
        Ok(self
            .runtime()?
            .finalizers
            .attach(object, cleanup, native_ptr, size_hint))
    }

    pub fn detach_finalizer(
        &self,
        handle: FinalizerHandle,
        object: &ManagedRef,
    ) -> BridgeResult<()> {
        self.runtime()?.finalizers.detach(handle, object)
    }

    /// Runs the finalizers of every unreachable object; returns how many ran.
    pub fn collect_finalizers(&self) -> BridgeResult<usize> {
        Ok(self.runtime()?.finalizers.collect())
    }

    pub fn finalizer_stats(&self) -> BridgeResult<FinalizerStats> {
        Ok(self.runtime()?.finalizers.stats())
    }

    pub fn stats(&self) -> BridgeResult<BridgeStats> {
        let runtime = self.runtime()?;
        Ok(BridgeStats {
            observers: runtime.observers.len(),
            sync_listeners: runtime.listeners.len(),
            streams: runtime.streams.len(),
            puts_in_flight: runtime.puts.in_flight(),
            finalizers: runtime.finalizers.stats(),
        })
    }

    /// Closes every observer, listener and stream, and runs every pending
    /// finalizer. The bridge stays bound; new registrations still work except
    /// finalizer attachment, which is refused from here on.
    pub fn shutdown(&self) {
        if let Some(runtime) = self.runtime.get() {
            runtime.shutdown();
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}
