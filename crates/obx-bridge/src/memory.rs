//! In-memory engine behind the bridge seams.
//!
//! Enough of a store, a sync session, an async write box and a query to drive
//! every adapter end to end. Callbacks are always invoked with no engine lock
//! held, from the thread that triggers them ([`MemoryStore::commit`],
//! [`MemorySync::emit`]) or from the box's writer thread.

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::engine::{
    AsyncEngine, ChangeCallback, PutCompletion, PutMode, QueryEngine, RowBuf, SchemaId,
    StoreEngine, SubscriptionId, SyncCallback, SyncEngine, SyncEvent, SyncEventKind,
};
use crate::error::{EngineError, EngineResult};

pub const CODE_NOT_FOUND: i32 = 404;
pub const CODE_ILLEGAL_STATE: i32 = 10_001;
pub const CODE_ILLEGAL_ARGUMENT: i32 = 10_002;

/// Length of the little-endian object id prefix every object buffer carries.
pub const ID_PREFIX_LEN: usize = 8;

struct StoreObserver {
    type_filter: Option<SchemaId>,
    callback: ChangeCallback,
}

#[derive(Default)]
struct StoreState {
    closed: bool,
    next_id: u64,
    observers: BTreeMap<u64, StoreObserver>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates a committed transaction touching `type_ids` and notifies
    /// observers. A single-type observer hears only about its own type.
    /// Returns how many observers were notified.
    pub fn commit(&self, type_ids: &[SchemaId]) -> usize {
        let targets: Vec<(Vec<SchemaId>, ChangeCallback)> = {
            let state = self.state.lock();
            if state.closed || type_ids.is_empty() {
                return 0;
            }
            state
                .observers
                .values()
                .filter_map(|observer| match observer.type_filter {
                    None => Some((type_ids.to_vec(), observer.callback.clone())),
                    Some(filter) if type_ids.contains(&filter) => {
                        Some((vec![filter], observer.callback.clone()))
                    }
                    Some(_) => None,
                })
                .collect()
        };

        for (types, callback) in &targets {
            callback(types);
        }
        targets.len()
    }

    /// Closes the store; registered observers are dropped and new ones refused.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.observers.clear();
    }

    pub fn observer_count(&self) -> usize {
        self.state.lock().observers.len()
    }
}

impl StoreEngine for MemoryStore {
    fn observe(
        &self,
        type_filter: Option<SchemaId>,
        callback: ChangeCallback,
    ) -> EngineResult<SubscriptionId> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(EngineError::Closed);
        }
        state.next_id += 1;
        let id = state.next_id;
        state.observers.insert(
            id,
            StoreObserver {
                type_filter,
                callback,
            },
        );
        Ok(SubscriptionId(id))
    }

    fn unobserve(&self, id: SubscriptionId) {
        self.state.lock().observers.remove(&id.0);
    }
}

#[derive(Default)]
struct SyncState {
    closed: bool,
    next_id: u64,
    listeners: HashMap<SyncEventKind, (SubscriptionId, SyncCallback)>,
}

/// Sync session holding at most one listener per event kind.
#[derive(Default)]
pub struct MemorySync {
    state: Mutex<SyncState>,
}

impl MemorySync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatches `event` to the listener of its kind. Returns whether one was
    /// registered.
    pub fn emit(&self, event: &SyncEvent) -> bool {
        let callback = {
            let state = self.state.lock();
            if state.closed {
                return false;
            }
            match state.listeners.get(&event.kind()) {
                Some((_, callback)) => callback.clone(),
                None => return false,
            }
        };
        callback(event);
        true
    }

    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.listeners.clear();
    }

    pub fn has_listener(&self, kind: SyncEventKind) -> bool {
        self.state.lock().listeners.contains_key(&kind)
    }
}

impl SyncEngine for MemorySync {
    fn listen(&self, kind: SyncEventKind, callback: SyncCallback) -> EngineResult<SubscriptionId> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(EngineError::Closed);
        }
        state.next_id += 1;
        let id = SubscriptionId(state.next_id);
        if state.listeners.insert(kind, (id, callback)).is_some() {
            tracing::debug!(%kind, "sync listener replaced");
        }
        Ok(id)
    }

    fn unlisten(&self, kind: SyncEventKind, id: SubscriptionId) {
        let mut state = self.state.lock();
        if state.listeners.get(&kind).is_some_and(|(current, _)| *current == id) {
            state.listeners.remove(&kind);
        }
    }
}

/// Prefixes `body` with the little-endian object id.
pub fn encode_object(id: u64, body: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(ID_PREFIX_LEN + body.len());
    bytes.extend_from_slice(&id.to_le_bytes());
    bytes.extend_from_slice(body);
    bytes
}

/// Reads the object id prefix.
pub fn object_id(bytes: &[u8]) -> Option<u64> {
    let prefix: [u8; ID_PREFIX_LEN] = bytes.get(..ID_PREFIX_LEN)?.try_into().ok()?;
    Some(u64::from_le_bytes(prefix))
}

struct WriteJob {
    id: u64,
    bytes: Vec<u8>,
    mode: PutMode,
    done: PutCompletion,
}

type Objects = Arc<Mutex<BTreeMap<u64, Vec<u8>>>>;

fn apply_write(objects: &Objects, id: u64, bytes: Vec<u8>, mode: PutMode) -> EngineResult<()> {
    let mut objects = objects.lock();
    let exists = objects.contains_key(&id);
    match mode {
        PutMode::Insert if exists => {
            return Err(EngineError::failed(
                CODE_ILLEGAL_STATE,
                format!("object {id} already exists"),
            ));
        }
        PutMode::Update if !exists => {
            return Err(EngineError::failed(
                CODE_NOT_FOUND,
                format!("object {id} not found"),
            ));
        }
        _ => {}
    }
    objects.insert(id, bytes);
    Ok(())
}

fn run_writer(jobs: Receiver<WriteJob>, objects: Objects) {
    for WriteJob {
        id,
        bytes,
        mode,
        done,
    } in jobs
    {
        let result = apply_write(&objects, id, bytes, mode);
        if let Err(err) = &result {
            tracing::trace!(id, %err, "async write failed");
        }
        done(id, result);
    }
}

/// Object box whose asynchronous writes are applied in submission order by a
/// single writer thread.
///
/// Objects are byte buffers starting with an 8-byte little-endian id. An id of
/// `0` asks the box to assign the next free id, which is written back into the
/// stored buffer.
pub struct MemoryBox {
    next_id: AtomicU64,
    objects: Objects,
    jobs: Mutex<Option<Sender<WriteJob>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl MemoryBox {
    pub fn new() -> EngineResult<Self> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let objects: Objects = Arc::default();
        let writer_objects = objects.clone();
        let writer = thread::Builder::new()
            .name("obx-memory-writer".to_string())
            .spawn(move || run_writer(rx, writer_objects))
            .map_err(|err| EngineError::failed(CODE_ILLEGAL_STATE, err.to_string()))?;

        Ok(Self {
            next_id: AtomicU64::new(1),
            objects,
            jobs: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn get(&self, id: u64) -> Option<Vec<u8>> {
        self.objects.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting writes and waits for queued ones to complete.
    pub fn close(&self) {
        let sender = self.jobs.lock().take();
        drop(sender);
        if let Some(writer) = self.writer.lock().take() {
            if writer.join().is_err() {
                tracing::warn!("memory box writer panicked");
            }
        }
    }

    fn assign_id(&self, requested: u64) -> u64 {
        if requested == 0 {
            self.next_id.fetch_add(1, Ordering::AcqRel)
        } else {
            self.next_id.fetch_max(requested.saturating_add(1), Ordering::AcqRel);
            requested
        }
    }
}

impl AsyncEngine for MemoryBox {
    fn put_async(
        &self,
        mut bytes: Vec<u8>,
        mode: PutMode,
        done: PutCompletion,
    ) -> EngineResult<u64> {
        let Some(requested) = object_id(&bytes) else {
            return Err(EngineError::failed(
                CODE_ILLEGAL_ARGUMENT,
                format!("object buffer shorter than {ID_PREFIX_LEN} bytes"),
            ));
        };
        if requested == 0 && mode == PutMode::Update {
            return Err(EngineError::failed(
                CODE_ILLEGAL_ARGUMENT,
                "update requires an object id",
            ));
        }

        let jobs = self.jobs.lock();
        let Some(sender) = jobs.as_ref() else {
            return Err(EngineError::Closed);
        };
        let id = self.assign_id(requested);
        bytes[..ID_PREFIX_LEN].copy_from_slice(&id.to_le_bytes());
        sender
            .send(WriteJob {
                id,
                bytes,
                mode,
                done,
            })
            .map_err(|_| EngineError::Closed)?;
        Ok(id)
    }
}

impl Drop for MemoryBox {
    fn drop(&mut self) {
        self.close();
    }
}

/// Fixed result set, optionally slowed down or failing part way.
pub struct MemoryQuery {
    rows: Vec<RowBuf>,
    row_delay: Option<Duration>,
    failure: Option<(usize, EngineError)>,
    closed: AtomicBool,
}

impl MemoryQuery {
    pub fn new<R: AsRef<[u8]>>(rows: impl IntoIterator<Item = R>) -> Self {
        Self {
            rows: rows.into_iter().map(|row| RowBuf::from(row.as_ref())).collect(),
            row_delay: None,
            failure: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Sleeps before visiting each row.
    pub fn with_row_delay(mut self, delay: Duration) -> Self {
        self.row_delay = Some(delay);
        self
    }

    /// Fails with `err` after visiting `rows` rows.
    pub fn failing_after(mut self, rows: usize, err: EngineError) -> Self {
        self.failure = Some((rows, err));
        self
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn failure_at(&self, index: usize) -> Option<EngineError> {
        match &self.failure {
            Some((at, err)) if *at == index => Some(err.clone()),
            _ => None,
        }
    }
}

impl QueryEngine for MemoryQuery {
    fn visit(&self, visitor: &mut dyn FnMut(&RowBuf) -> bool) -> EngineResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }
        for (index, row) in self.rows.iter().enumerate() {
            if let Some(err) = self.failure_at(index) {
                return Err(err);
            }
            if let Some(delay) = self.row_delay {
                thread::sleep(delay);
            }
            if !visitor(row) {
                return Ok(());
            }
        }
        match self.failure_at(self.rows.len()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn unfiltered_observer_sees_every_committed_type() {
        let store = MemoryStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = store
            .observe(
                None,
                Arc::new(move |types: &[SchemaId]| sink.lock().push(types.to_vec())),
            )
            .expect("observe");

        assert_eq!(store.commit(&[1, 3]), 1);
        store.unobserve(id);
        assert_eq!(store.commit(&[1]), 0);
        assert_eq!(*seen.lock(), vec![vec![1, 3]]);
    }

    #[test]
    fn newer_sync_listener_replaces_older_and_stale_unlisten_is_ignored() {
        let sync = MemorySync::new();
        let hits = Arc::new(AtomicU64::new(0));
        let first = sync
            .listen(SyncEventKind::Connect, Arc::new(|_: &SyncEvent| {}))
            .expect("listen");
        let counter = hits.clone();
        let second = sync
            .listen(
                SyncEventKind::Connect,
                Arc::new(move |_: &SyncEvent| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .expect("listen");

        sync.unlisten(SyncEventKind::Connect, first);
        assert!(sync.emit(&SyncEvent::Connected));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        sync.unlisten(SyncEventKind::Connect, second);
        assert!(!sync.has_listener(SyncEventKind::Connect));
    }

    fn put(boxed: &MemoryBox, bytes: Vec<u8>, mode: PutMode) -> (u64, u64, EngineResult<()>) {
        let (tx, rx) = mpsc::channel();
        let id = boxed
            .put_async(
                bytes,
                mode,
                Box::new(move |id, result| {
                    let _ = tx.send((id, result));
                }),
            )
            .expect("queued");
        let (done_id, result) = rx.recv().expect("completion");
        (id, done_id, result)
    }

    #[test]
    fn box_assigns_ids_and_enforces_put_mode() {
        let boxed = MemoryBox::new().expect("box");
        let (id, done_id, result) = put(&boxed, encode_object(0, b"a"), PutMode::Put);
        assert_eq!(id, 1);
        assert_eq!(done_id, 1);
        assert_eq!(result, Ok(()));
        assert_eq!(boxed.get(1).as_deref().and_then(object_id), Some(1));

        let (_, _, result) = put(&boxed, encode_object(1, b"b"), PutMode::Insert);
        assert_eq!(result.map_err(|err| err.code()), Err(CODE_ILLEGAL_STATE));

        let (_, done_id, result) = put(&boxed, encode_object(9, b"c"), PutMode::Update);
        assert_eq!(done_id, 9);
        assert_eq!(result.map_err(|err| err.code()), Err(CODE_NOT_FOUND));

        let (id, _, _) = put(&boxed, encode_object(0, b"d"), PutMode::Put);
        assert_eq!(id, 10, "explicit ids advance the id counter");
    }

    #[test]
    fn closed_box_rejects_synchronously() {
        let boxed = MemoryBox::new().expect("box");
        boxed.close();
        let err = boxed
            .put_async(encode_object(0, b""), PutMode::Put, Box::new(|_, _| {}))
            .expect_err("closed");
        assert_eq!(err, EngineError::Closed);

        let short = MemoryBox::new().expect("box");
        let err = short
            .put_async(vec![1, 2], PutMode::Put, Box::new(|_, _| {}))
            .expect_err("short buffer");
        assert_eq!(err.code(), CODE_ILLEGAL_ARGUMENT);
    }

    #[test]
    fn query_fails_after_configured_row() {
        let query = MemoryQuery::new(["a", "b", "c"])
            .failing_after(2, EngineError::failed(CODE_ILLEGAL_STATE, "cursor broke"));
        let mut rows = Vec::new();
        let result = query.visit(&mut |row| {
            rows.push(row.to_vec());
            true
        });
        assert_eq!(rows, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(result.map_err(|err| err.code()), Err(CODE_ILLEGAL_STATE));
    }
}
