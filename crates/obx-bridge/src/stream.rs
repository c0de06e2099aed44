//! Query results streamed to a port.
//!
//! Every stream posts its rows in result order, then exactly one terminal
//! `Null`. An engine failure posts `Array[Int(code), Text(detail)]` right
//! before the terminal. Rows are `Bytes` (copied) or `SharedBytes` (shared
//! with the engine's buffer) depending on [`CopySemantics`].
//!
//! Rows are produced on a dedicated thread per stream. Closing a stream
//! fences out further rows and, if production had not finished, posts the
//! terminal itself, so a consumer waiting for the end marker never hangs.
//! The terminal only counts once the port accepts it: against a full port
//! the worker keeps retrying until the consumer makes room or the port
//! closes.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::engine::{QueryEngine, RowBuf};
use crate::error::{BridgeError, BridgeResult, ErrorCode, HandleKind};
use crate::handle::{HandleTable, StreamHandle};
use crate::port::{MessagePort, Payload, PortId};

/// How rows are framed when posted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopySemantics {
    /// Each row is copied into its own buffer.
    #[default]
    Value,
    /// Rows reference the engine's shared buffer.
    Reference,
}

impl CopySemantics {
    fn row_payload(self, row: &RowBuf) -> Payload {
        match self {
            CopySemantics::Value => Payload::Bytes(row.to_vec()),
            CopySemantics::Reference => Payload::SharedBytes(row.clone()),
        }
    }
}

/// Consumer-side view of a stream message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamItem<'a> {
    Row(&'a [u8]),
    Error { code: i32, detail: &'a str },
    End,
}

impl<'a> StreamItem<'a> {
    pub fn from_payload(payload: &'a Payload) -> Option<Self> {
        match payload {
            Payload::Null => Some(StreamItem::End),
            Payload::Bytes(_) | Payload::SharedBytes(_) => payload.as_bytes().map(StreamItem::Row),
            Payload::Array(items) => match items.as_slice() {
                [Payload::Int(code), Payload::Text(detail)] => Some(StreamItem::Error {
                    code: i32::try_from(*code).ok()?,
                    detail,
                }),
                _ => None,
            },
            _ => None,
        }
    }
}

fn error_payload(code: i32, detail: String) -> Payload {
    Payload::Array(vec![Payload::Int(i64::from(code)), Payload::Text(detail)])
}

enum RowOutcome {
    Posted,
    Stopped,
    Rejected,
}

const RETRY_BACKOFF_START: Duration = Duration::from_millis(1);
const RETRY_BACKOFF_MAX: Duration = Duration::from_millis(50);

#[derive(Default)]
struct Progress {
    cancelled: bool,
    /// Production is over; only the tail (optional error, then `Null`) is
    /// left to deliver.
    finishing: bool,
    /// The port accepted the terminal `Null`.
    terminated: bool,
    pending_error: Option<Payload>,
    rows: u64,
}

struct StreamState {
    port: PortId,
    poster: Arc<dyn MessagePort>,
    progress: Mutex<Progress>,
}

impl StreamState {
    fn post_row(&self, payload: impl FnOnce() -> Payload) -> RowOutcome {
        let mut progress = self.progress.lock();
        if progress.cancelled || progress.finishing {
            return RowOutcome::Stopped;
        }
        if !self.poster.post(self.port, payload()) {
            return RowOutcome::Rejected;
        }
        progress.rows += 1;
        RowOutcome::Posted
    }

    /// Ends production and records the error to report before the terminal.
    /// Returns `false` when production had already ended. An error is not
    /// reported for a cancelled stream.
    fn begin_finish(&self, error: Option<(i32, String)>) -> bool {
        let mut progress = self.progress.lock();
        if progress.finishing {
            return false;
        }
        progress.finishing = true;
        if !progress.cancelled {
            progress.pending_error = error.map(|(code, detail)| error_payload(code, detail));
        }
        true
    }

    /// One attempt at posting whatever is left of the tail.
    fn try_deliver_tail(&self) -> bool {
        let mut progress = self.progress.lock();
        if progress.terminated {
            return true;
        }
        if progress.cancelled {
            progress.pending_error = None;
        }
        if let Some(error) = progress.pending_error.take() {
            if !self.poster.post(self.port, error.clone()) {
                progress.pending_error = Some(error);
                return false;
            }
        }
        if !self.poster.post(self.port, Payload::Null) {
            return false;
        }
        progress.terminated = true;
        true
    }

    /// Retries the tail with backoff until the port accepts it, the port is
    /// closed, or `timeout` elapses.
    fn deliver_tail(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        let mut backoff = RETRY_BACKOFF_START;
        loop {
            if self.try_deliver_tail() {
                return true;
            }
            if !self.poster.is_open(self.port) {
                tracing::debug!(port = %self.port, "port closed before stream terminal");
                return false;
            }
            if started.elapsed() >= timeout {
                tracing::warn!(port = %self.port, "stream terminal not accepted; giving up");
                return false;
            }
            thread::sleep(backoff);
            backoff = (backoff * 2).min(RETRY_BACKOFF_MAX);
        }
    }

    /// Stops production and makes one attempt at the terminal. If the port
    /// is full the worker keeps retrying. Returns whether production was
    /// still running.
    fn cancel(&self) -> bool {
        self.progress.lock().cancelled = true;
        let stopped = self.begin_finish(None);
        self.try_deliver_tail();
        stopped
    }

    fn is_terminated(&self) -> bool {
        self.progress.lock().terminated
    }

    fn rows(&self) -> u64 {
        self.progress.lock().rows
    }
}

fn produce(
    state: &StreamState,
    query: &dyn QueryEngine,
    semantics: CopySemantics,
    terminal_timeout: Duration,
) {
    let mut rejected_at = None;
    let result = query.visit(&mut |row: &RowBuf| {
        match state.post_row(|| semantics.row_payload(row)) {
            RowOutcome::Posted => true,
            RowOutcome::Stopped => false,
            RowOutcome::Rejected => {
                rejected_at = Some(state.rows());
                false
            }
        }
    });

    let error = match (result, rejected_at) {
        (Err(err), _) => Some((err.code(), err.to_string())),
        (Ok(()), Some(row)) => Some((
            ErrorCode::AllocationFailure.as_i32(),
            format!("port rejected row {row}"),
        )),
        (Ok(()), None) => None,
    };
    if let Some((code, detail)) = &error {
        tracing::debug!(port = %state.port, code, %detail, "query stream failed");
    }
    state.begin_finish(error);
    state.deliver_tail(terminal_timeout);
}

struct StreamEntry {
    state: Arc<StreamState>,
    _worker: JoinHandle<()>,
}

pub(crate) struct QueryStreams {
    poster: Arc<dyn MessagePort>,
    thread_name: String,
    terminal_timeout: Duration,
    entries: Mutex<HandleTable<StreamEntry>>,
}

impl QueryStreams {
    pub fn new(
        poster: Arc<dyn MessagePort>,
        thread_name: impl Into<String>,
        terminal_timeout: Duration,
    ) -> Self {
        Self {
            poster,
            thread_name: thread_name.into(),
            terminal_timeout,
            entries: Mutex::new(HandleTable::new()),
        }
    }

    pub fn open(
        &self,
        query: &Arc<dyn QueryEngine>,
        port: PortId,
        semantics: CopySemantics,
    ) -> BridgeResult<StreamHandle> {
        let state = Arc::new(StreamState {
            port,
            poster: self.poster.clone(),
            progress: Mutex::new(Progress::default()),
        });

        let worker_state = state.clone();
        let worker_query = query.clone();
        let terminal_timeout = self.terminal_timeout;
        let worker = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || {
                produce(
                    &worker_state,
                    worker_query.as_ref(),
                    semantics,
                    terminal_timeout,
                )
            })
            .map_err(|err| {
                BridgeError::AllocationFailure(format!("failed to spawn stream worker: {err}"))
            })?;

        let inserted = self.entries.lock().insert(StreamEntry {
            state: state.clone(),
            _worker: worker,
        });
        let Ok(raw) = inserted else {
            state.cancel();
            return Err(BridgeError::AllocationFailure(
                "stream table exhausted".to_string(),
            ));
        };

        tracing::debug!(port = %port, ?semantics, "query stream opened");
        Ok(StreamHandle(raw))
    }

    /// Cancels the stream if still producing and releases the handle. A
    /// finished stream closes successfully; a second close is an invalid
    /// handle. A terminal the port has not accepted yet is attempted again;
    /// the worker keeps retrying it after the handle is gone.
    pub fn close(&self, handle: StreamHandle) -> BridgeResult<()> {
        let entry = self
            .entries
            .lock()
            .remove(handle.0)
            .ok_or_else(|| BridgeError::invalid_handle(HandleKind::Stream))?;

        if entry.state.cancel() {
            tracing::debug!(
                port = %entry.state.port,
                rows = entry.state.rows(),
                "query stream cancelled"
            );
        }
        Ok(())
    }

    pub fn is_finished(&self, handle: StreamHandle) -> Option<bool> {
        self.entries
            .lock()
            .get(handle.0)
            .map(|entry| entry.state.is_terminated())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn close_all(&self) {
        let entries = self.entries.lock().drain();
        for entry in entries {
            entry.state.cancel();
        }
    }
}
