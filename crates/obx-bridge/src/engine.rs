//! Seams to the embedded database engine.
//!
//! The engine owns its worker threads and calls back into the bridge from
//! them. Callbacks registered here may be invoked concurrently and after the
//! matching `unobserve`/`unlisten` call has started; the bridge fences that
//! race itself.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::EngineResult;

/// Entity type id from the store schema.
pub type SchemaId = u32;

/// Row buffer produced by a query; shared so streams can post by reference.
pub type RowBuf = Arc<[u8]>;

/// Token identifying a callback registration inside the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Invoked with the ids of the entity types touched by a committed transaction.
pub type ChangeCallback = Arc<dyn Fn(&[SchemaId]) + Send + Sync>;

pub trait StoreEngine: Send + Sync {
    /// Registers `callback` for changes to `type_filter`, or to every type
    /// when `None`.
    fn observe(
        &self,
        type_filter: Option<SchemaId>,
        callback: ChangeCallback,
    ) -> EngineResult<SubscriptionId>;

    fn unobserve(&self, id: SubscriptionId);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventKind {
    Connect,
    Disconnect,
    Login,
    LoginFailure,
    Complete,
    Change,
    ServerTime,
}

impl SyncEventKind {
    pub const ALL: [SyncEventKind; 7] = [
        SyncEventKind::Connect,
        SyncEventKind::Disconnect,
        SyncEventKind::Login,
        SyncEventKind::LoginFailure,
        SyncEventKind::Complete,
        SyncEventKind::Change,
        SyncEventKind::ServerTime,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SyncEventKind::Connect => "connect",
            SyncEventKind::Disconnect => "disconnect",
            SyncEventKind::Login => "login",
            SyncEventKind::LoginFailure => "login_failure",
            SyncEventKind::Complete => "complete",
            SyncEventKind::Change => "change",
            SyncEventKind::ServerTime => "server_time",
        }
    }
}

impl fmt::Display for SyncEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Objects of one entity type put or removed by a sync update.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncChange {
    pub entity_id: SchemaId,
    pub puts: Vec<u64>,
    pub removals: Vec<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncEvent {
    Connected,
    Disconnected,
    LoggedIn,
    LoginFailed { code: i32 },
    /// Initial synchronization finished.
    Complete,
    Changes { changes: Vec<SyncChange> },
    ServerTime { unix_nanos: i64 },
}

impl SyncEvent {
    pub fn kind(&self) -> SyncEventKind {
        match self {
            SyncEvent::Connected => SyncEventKind::Connect,
            SyncEvent::Disconnected => SyncEventKind::Disconnect,
            SyncEvent::LoggedIn => SyncEventKind::Login,
            SyncEvent::LoginFailed { .. } => SyncEventKind::LoginFailure,
            SyncEvent::Complete => SyncEventKind::Complete,
            SyncEvent::Changes { .. } => SyncEventKind::Change,
            SyncEvent::ServerTime { .. } => SyncEventKind::ServerTime,
        }
    }
}

pub type SyncCallback = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

pub trait SyncEngine: Send + Sync {
    /// Registers `callback` as the listener for `kind`, replacing any listener
    /// of that kind already set on the session.
    fn listen(&self, kind: SyncEventKind, callback: SyncCallback) -> EngineResult<SubscriptionId>;

    /// Clears the `kind` listener if it is still the registration `id`.
    fn unlisten(&self, kind: SyncEventKind, id: SubscriptionId);
}

/// Conflict policy for an asynchronous write.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PutMode {
    /// Insert or overwrite.
    #[default]
    Put,
    /// Fails if the id already exists.
    Insert,
    /// Fails if the id does not exist.
    Update,
}

/// Invoked once by the engine with the id the write was attempted under and
/// its outcome.
pub type PutCompletion = Box<dyn FnOnce(u64, EngineResult<()>) + Send>;

pub trait AsyncEngine: Send + Sync {
    /// Queues a write of `bytes` and returns the id assigned to the object.
    /// On `Ok`, `done` must be invoked exactly once, possibly before this
    /// call returns. On `Err`, `done` is dropped without being invoked.
    fn put_async(&self, bytes: Vec<u8>, mode: PutMode, done: PutCompletion)
    -> EngineResult<u64>;
}

pub trait QueryEngine: Send + Sync {
    /// Visits matching rows in result order until exhausted or until `visitor`
    /// returns `false`.
    fn visit(&self, visitor: &mut dyn FnMut(&RowBuf) -> bool) -> EngineResult<()>;
}
