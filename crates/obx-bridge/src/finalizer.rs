//! Finalizers tying native resources to managed object lifetimes.
//!
//! A finalizer pairs a [`ManagedRef`] with a native pointer and a cleanup
//! function. Exactly one of two things happens to every attached finalizer:
//! it runs (its object became unreachable and a [`collect`] pass reclaimed
//! it, or the registry was torn down), or it is detached (ownership of the
//! pointer moved elsewhere and cleanup is skipped). The registry lock decides
//! which one wins.
//!
//! Cleanup runs outside any caller's context. Its return value is ignored
//! and a panic inside it is caught and logged, never propagated.
//!
//! [`collect`]: FinalizerRegistry::collect

use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::error::{BridgeError, BridgeResult, HandleKind};
use crate::handle::{FinalizerHandle, HandleTable};

/// Address of the native resource a finalizer releases.
pub type NativePtr = usize;

/// Releases a native resource. The returned status is discarded.
pub type CleanupFn = Box<dyn FnOnce(NativePtr) -> i32 + Send>;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

struct ManagedCell {
    id: u64,
}

/// Reference to a managed-runtime object. The object is reachable while at
/// least one clone is alive.
#[derive(Clone)]
pub struct ManagedRef {
    cell: Arc<ManagedCell>,
}

impl ManagedRef {
    pub fn new() -> Self {
        Self {
            cell: Arc::new(ManagedCell {
                id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.cell.id
    }

    fn downgrade(&self) -> Weak<ManagedCell> {
        Arc::downgrade(&self.cell)
    }
}

impl Default for ManagedRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManagedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedRef").field("id", &self.cell.id).finish()
    }
}

struct FinalizerEntry {
    object: Weak<ManagedCell>,
    cleanup: CleanupFn,
    native_ptr: NativePtr,
    size_hint: usize,
}

impl FinalizerEntry {
    fn belongs_to(&self, object: &ManagedRef) -> bool {
        std::ptr::eq(self.object.as_ptr(), Arc::as_ptr(&object.cell))
    }

    fn is_unreachable(&self) -> bool {
        self.object.strong_count() == 0
    }

    fn run(self) {
        let FinalizerEntry {
            cleanup,
            native_ptr,
            ..
        } = self;
        match catch_unwind(AssertUnwindSafe(move || cleanup(native_ptr))) {
            Ok(status) => {
                tracing::trace!(native_ptr, status, "finalizer ran");
            }
            Err(_) => {
                tracing::warn!(native_ptr, "finalizer cleanup panicked; ignored");
            }
        }
    }
}

/// Outcome of [`FinalizerRegistry::attach`].
pub enum Attachment {
    Attached(FinalizerHandle),
    /// Not attached; the caller keeps responsibility for the native pointer
    /// and gets its cleanup function back.
    Refused(CleanupFn),
}

impl Attachment {
    pub fn handle(&self) -> Option<FinalizerHandle> {
        match self {
            Attachment::Attached(handle) => Some(*handle),
            Attachment::Refused(_) => None,
        }
    }
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attachment::Attached(handle) => f.debug_tuple("Attached").field(handle).finish(),
            Attachment::Refused(_) => f.write_str("Refused"),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FinalizerStats {
    pub pending: usize,
    pub ran: u64,
    pub detached: u64,
    pub refused: u64,
    /// Sum of the size hints of pending finalizers. Advisory only.
    pub external_bytes: usize,
}

#[derive(Default)]
struct Counters {
    ran: u64,
    detached: u64,
    refused: u64,
    external_bytes: usize,
}

pub struct FinalizerRegistry {
    max_pending: usize,
    shut_down: AtomicBool,
    entries: Mutex<HandleTable<FinalizerEntry>>,
    counters: Mutex<Counters>,
}

impl FinalizerRegistry {
    /// `max_pending` caps pending finalizers; `0` means unlimited.
    pub fn new(max_pending: usize) -> Self {
        Self {
            max_pending,
            shut_down: AtomicBool::new(false),
            entries: Mutex::new(HandleTable::new()),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Attaches `cleanup(native_ptr)` to `object`.
    ///
    /// When the registry refuses (it is at capacity or shut down), the
    /// cleanup function is
    /// handed back in [`Attachment::Refused`]: the caller still owns
    /// `native_ptr` and must release it itself.
    pub fn attach(
        &self,
        object: &ManagedRef,
        cleanup: CleanupFn,
        native_ptr: NativePtr,
        size_hint: usize,
    ) -> Attachment {
        let mut entries = self.entries.lock();
        let full = self.max_pending != 0 && entries.len() >= self.max_pending;
        if full || self.shut_down.load(Ordering::Acquire) {
            drop(entries);
            self.counters.lock().refused += 1;
            return Attachment::Refused(cleanup);
        }

        let inserted = entries.insert(FinalizerEntry {
            object: object.downgrade(),
            cleanup,
            native_ptr,
            size_hint,
        });
        drop(entries);

        match inserted {
            Ok(raw) => {
                let mut counters = self.counters.lock();
                counters.external_bytes = counters.external_bytes.saturating_add(size_hint);
                Attachment::Attached(FinalizerHandle(raw))
            }
            Err(entry) => {
                self.counters.lock().refused += 1;
                Attachment::Refused(entry.cleanup)
            }
        }
    }

    /// Cancels the finalizer without running its cleanup.
    pub fn detach(&self, handle: FinalizerHandle, object: &ManagedRef) -> BridgeResult<()> {
        let mut entries = self.entries.lock();
        let owned = entries
            .get(handle.0)
            .is_some_and(|entry| entry.belongs_to(object));
        if !owned {
            return Err(BridgeError::invalid_handle(HandleKind::Finalizer));
        }
        let entry = entries
            .remove(handle.0)
            .ok_or_else(|| BridgeError::invalid_handle(HandleKind::Finalizer))?;
        drop(entries);

        let mut counters = self.counters.lock();
        counters.detached += 1;
        counters.external_bytes = counters.external_bytes.saturating_sub(entry.size_hint);
        Ok(())
    }

    /// Reclamation pass: runs the cleanup of every finalizer whose object is
    /// no longer reachable. Returns how many ran.
    pub fn collect(&self) -> usize {
        let reclaimed = self
            .entries
            .lock()
            .remove_where(FinalizerEntry::is_unreachable);
        self.run_all(reclaimed)
    }

    pub fn is_pending(&self, handle: FinalizerHandle) -> bool {
        self.entries.lock().get(handle.0).is_some()
    }

    pub fn stats(&self) -> FinalizerStats {
        let pending = self.entries.lock().len();
        let counters = self.counters.lock();
        FinalizerStats {
            pending,
            ran: counters.ran,
            detached: counters.detached,
            refused: counters.refused,
            external_bytes: counters.external_bytes,
        }
    }

    /// Runs every pending finalizer regardless of reachability. Later
    /// attaches are refused.
    pub fn shutdown(&self) -> usize {
        let pending = {
            let mut entries = self.entries.lock();
            self.shut_down.store(true, Ordering::Release);
            entries.drain()
        };
        self.run_all(pending)
    }

    fn run_all(&self, entries: Vec<FinalizerEntry>) -> usize {
        let count = entries.len();
        if count == 0 {
            return 0;
        }
        let bytes = entries
            .iter()
            .map(|entry| entry.size_hint)
            .fold(0, usize::saturating_add);
        for entry in entries {
            entry.run();
        }
        let mut counters = self.counters.lock();
        counters.ran += count as u64;
        counters.external_bytes = counters.external_bytes.saturating_sub(bytes);
        tracing::debug!(count, "finalizers ran");
        count
    }
}

impl Drop for FinalizerRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_cleanup(counter: &Arc<AtomicUsize>) -> CleanupFn {
        let counter = counter.clone();
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            0
        })
    }

    #[test]
    fn reachable_object_is_not_finalized() {
        let registry = FinalizerRegistry::new(0);
        let runs = Arc::new(AtomicUsize::new(0));
        let object = ManagedRef::new();
        let handle = registry
            .attach(&object, counting_cleanup(&runs), 0x10, 64)
            .handle()
            .expect("attach");

        assert_eq!(registry.collect(), 0);
        assert!(registry.is_pending(handle));
        assert_eq!(registry.stats().external_bytes, 64);

        let clone = object.clone();
        drop(object);
        assert_eq!(registry.collect(), 0, "a clone keeps the object reachable");
        drop(clone);
        assert_eq!(registry.collect(), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(registry.stats().external_bytes, 0);
    }

    #[test]
    fn detach_with_foreign_object_is_rejected() {
        let registry = FinalizerRegistry::new(0);
        let runs = Arc::new(AtomicUsize::new(0));
        let owner = ManagedRef::new();
        let stranger = ManagedRef::new();
        let handle = registry
            .attach(&owner, counting_cleanup(&runs), 1, 0)
            .handle()
            .expect("attach");

        let err = registry.detach(handle, &stranger).expect_err("foreign object");
        assert_eq!(err, BridgeError::invalid_handle(HandleKind::Finalizer));
        assert!(registry.is_pending(handle));
    }

    #[test]
    fn full_registry_refuses_and_hands_cleanup_back() {
        let registry = FinalizerRegistry::new(1);
        let runs = Arc::new(AtomicUsize::new(0));
        let object = ManagedRef::new();
        registry
            .attach(&object, counting_cleanup(&runs), 1, 0)
            .handle()
            .expect("first attach");

        let Attachment::Refused(cleanup) =
            registry.attach(&object, counting_cleanup(&runs), 2, 0)
        else {
            panic!("registry should be full");
        };
        cleanup(2);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(registry.stats().refused, 1);
    }

    #[test]
    fn panicking_cleanup_is_contained() {
        let registry = FinalizerRegistry::new(0);
        let object = ManagedRef::new();
        registry
            .attach(&object, Box::new(|_| panic!("native free failed")), 1, 0)
            .handle()
            .expect("attach");
        drop(object);
        assert_eq!(registry.collect(), 1);
        assert_eq!(registry.stats().ran, 1);
    }

    #[test]
    fn teardown_runs_pending_finalizers() {
        let runs = Arc::new(AtomicUsize::new(0));
        let object = ManagedRef::new();
        {
            let registry = FinalizerRegistry::new(0);
            registry
                .attach(&object, counting_cleanup(&runs), 1, 0)
                .handle()
                .expect("attach");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn oversized_hints_saturate_instead_of_overflowing() {
        let registry = FinalizerRegistry::new(0);
        let runs = Arc::new(AtomicUsize::new(0));
        let object = ManagedRef::new();
        for hint in [usize::MAX, 1] {
            registry
                .attach(&object, counting_cleanup(&runs), 1, hint)
                .handle()
                .expect("attach");
        }
        assert_eq!(registry.stats().pending, 2);
        assert_eq!(registry.stats().external_bytes, usize::MAX);

        drop(object);
        assert_eq!(registry.collect(), 2);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(registry.stats().external_bytes, 0);
    }

    #[test]
    fn attach_after_shutdown_is_refused() {
        let registry = FinalizerRegistry::new(0);
        let object = ManagedRef::new();
        assert_eq!(registry.shutdown(), 0);
        let attachment = registry.attach(&object, Box::new(|_| 0), 1, 0);
        assert!(matches!(attachment, Attachment::Refused(_)));
        assert_eq!(registry.stats().refused, 1);
    }
}
