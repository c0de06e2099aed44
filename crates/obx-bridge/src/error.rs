use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of result codes shared by every bridge operation. `0` is success.
///
/// Engine failures are reported with the engine's own code, passed through
/// unmodified; `EngineError` is only used when the engine did not supply a
/// usable (non-zero) code.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Success = 0,
    NotInitialized = 1,
    InvalidHandle = 2,
    AllocationFailure = 3,
    EngineError = 4,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Which handle family a handle error refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleKind {
    Store,
    Sync,
    AsyncContext,
    Query,
    Observer,
    SyncListener,
    Stream,
    Finalizer,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleKind::Store => "store",
            HandleKind::Sync => "sync",
            HandleKind::AsyncContext => "async context",
            HandleKind::Query => "query",
            HandleKind::Observer => "observer",
            HandleKind::SyncListener => "sync listener",
            HandleKind::Stream => "stream",
            HandleKind::Finalizer => "finalizer",
        };
        f.write_str(name)
    }
}

/// Failure reported by the engine behind the bridge.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// The store, sync session, async context or query was already closed.
    #[error("engine object closed")]
    Closed,

    #[error("engine error {code}: {detail}")]
    Failed { code: i32, detail: String },
}

impl EngineError {
    pub fn failed(code: i32, detail: impl Into<String>) -> Self {
        EngineError::Failed {
            code,
            detail: detail.into(),
        }
    }

    /// Integer code as it crosses the bridge. A zero engine code would read as
    /// success, so it is reported as [`ErrorCode::EngineError`].
    pub fn code(&self) -> i32 {
        match self {
            EngineError::Closed => ErrorCode::InvalidHandle.as_i32(),
            EngineError::Failed { code: 0, .. } => ErrorCode::EngineError.as_i32(),
            EngineError::Failed { code, .. } => *code,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge not initialized: call init first")]
    NotInitialized,

    #[error("invalid {kind} handle")]
    InvalidHandle { kind: HandleKind },

    #[error("allocation refused: {0}")]
    AllocationFailure(String),

    #[error(transparent)]
    Engine(EngineError),
}

impl BridgeError {
    pub fn invalid_handle(kind: HandleKind) -> Self {
        BridgeError::InvalidHandle { kind }
    }

    /// Maps an engine failure on an engine object of `kind`; a closed engine
    /// object is an invalid handle from the caller's point of view.
    pub fn from_engine(kind: HandleKind, err: EngineError) -> Self {
        match err {
            EngineError::Closed => BridgeError::InvalidHandle { kind },
            other => BridgeError::Engine(other),
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            BridgeError::NotInitialized => ErrorCode::NotInitialized,
            BridgeError::InvalidHandle { .. } => ErrorCode::InvalidHandle,
            BridgeError::AllocationFailure(_) => ErrorCode::AllocationFailure,
            BridgeError::Engine(_) => ErrorCode::EngineError,
        }
    }

    /// Integer code as returned across the boundary; engine codes pass through.
    pub fn code(&self) -> i32 {
        match self {
            BridgeError::Engine(err) => err.code(),
            other => other.error_code().as_i32(),
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Collapses a bridge result into the integer status returned by `close_*`
/// and `detach_*` style calls.
pub fn status_code<T>(result: &BridgeResult<T>) -> i32 {
    match result {
        Ok(_) => ErrorCode::Success.as_i32(),
        Err(err) => err.code(),
    }
}
