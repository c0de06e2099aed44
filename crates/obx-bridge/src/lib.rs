#![doc = r#"
Native-callback bridge between an embedded object database engine and a
single-consumer host event loop.

Operation mapping:

| Bridge method | Engine seam | Messages posted to the port |
| --- | --- | --- |
| `observe` / `observe_single_type` | `StoreEngine::observe` | `Array[Int(type_id)..]` per commit |
| `sync_listener_*` | `SyncEngine::listen` | per kind, see `listener` |
| `put_object_async` | `AsyncEngine::put_async` | one `Array[Int(id), Int(code)]` |
| `query_find_stream` | `QueryEngine::visit` | `Bytes` rows, optional error, `Null` |
| `query_find_stream_by_reference` | `QueryEngine::visit` | `SharedBytes` rows, error, `Null` |
| `attach_finalizer` | none | none |

Implementation notes:
- Handles are generation-checked indices; closing twice or using a handle from
  another table reports an invalid handle instead of touching freed state.
- Engine callbacks post while holding a per-subscription gate, so after a
  `close_*` call returns nothing more is posted for that subscription.
- Posting never blocks the engine thread; a full local port drops the message.
"#]

pub mod async_put;
pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod finalizer;
pub mod handle;
pub mod listener;
pub mod memory;
pub mod observer;
pub mod port;
pub mod stream;
mod subscription;

pub use async_put::PutCompletionMessage;
pub use bridge::{Bridge, BridgeStats, global};
pub use config::{BridgeConfig, ConfigError};
pub use engine::{
    AsyncEngine, ChangeCallback, PutCompletion, PutMode, QueryEngine, RowBuf, SchemaId,
    StoreEngine, SubscriptionId, SyncCallback, SyncChange, SyncEngine, SyncEvent, SyncEventKind,
};
pub use error::{
    BridgeError, BridgeResult, EngineError, EngineResult, ErrorCode, HandleKind, status_code,
};
pub use finalizer::{
    Attachment, CleanupFn, FinalizerRegistry, FinalizerStats, ManagedRef, NativePtr,
};
pub use handle::{FinalizerHandle, ObserverHandle, RawHandle, StreamHandle, SyncListenerHandle};
pub use listener::sync_event_payload;
pub use memory::{MemoryBox, MemoryQuery, MemoryStore, MemorySync};
pub use observer::ObserverInfo;
pub use port::{FnPort, LocalPorts, MessagePort, Payload, PortId, PortReceiver, PortStats};
pub use stream::{CopySemantics, StreamItem};
