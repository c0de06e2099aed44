//! Generation-checked handle arena.
//!
//! Every handle family handed out by the bridge is an index into a
//! [`HandleTable`] tagged with the slot's generation at insertion time.
//! Removing an entry bumps the slot generation, so a handle that was closed,
//! or that belongs to another table, never resolves to a live entry even
//! after the slot is reused.

use std::num::NonZeroU64;

/// Non-zero 64-bit handle value: generation in the high half, slot index in
/// the low half. Generations start at 1, so zero is free to mean NULL.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(NonZeroU64);

impl RawHandle {
    fn new(index: u32, generation: u32) -> Option<Self> {
        NonZeroU64::new((u64::from(generation) << 32) | u64::from(index)).map(Self)
    }

    /// Interprets an integer received from a host; `0` is NULL.
    pub fn from_u64(value: u64) -> Option<Self> {
        NonZeroU64::new(value).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }

    fn index(self) -> u32 {
        self.0.get() as u32
    }

    fn generation(self) -> u32 {
        (self.0.get() >> 32) as u32
    }
}

macro_rules! typed_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) RawHandle);

        impl $name {
            /// Integer form for hosts that can only carry integers.
            pub fn as_raw(self) -> u64 {
                self.0.get()
            }

            /// Rebuilds a handle from its integer form; `0` is NULL.
            pub fn from_raw(value: u64) -> Option<Self> {
                RawHandle::from_u64(value).map(Self)
            }
        }
    };
}

typed_handle!(
    /// Live data-change observer on a store.
    ObserverHandle
);
typed_handle!(
    /// Live listener for one sync event kind.
    SyncListenerHandle
);
typed_handle!(
    /// In-flight query result stream.
    StreamHandle
);
typed_handle!(
    /// Pending finalizer attached to a managed object.
    FinalizerHandle
);

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

#[derive(Debug)]
pub(crate) struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` and returns its handle. Hands `value` back once the
    /// index space is exhausted.
    pub fn insert(&mut self, value: T) -> Result<RawHandle, T> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let Ok(index) = u32::try_from(self.slots.len()) else {
                    return Err(value);
                };
                self.slots.push(Slot {
                    generation: 1,
                    value: None,
                });
                index
            }
        };
        let slot = &mut self.slots[index as usize];
        let Some(handle) = RawHandle::new(index, slot.generation) else {
            self.free.push(index);
            return Err(value);
        };
        slot.value = Some(value);
        self.len += 1;
        Ok(handle)
    }

    pub fn get(&self, handle: RawHandle) -> Option<&T> {
        let slot = self.slots.get(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn remove(&mut self, handle: RawHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = match slot.generation.wrapping_add(1) {
            0 => 1,
            next => next,
        };
        self.free.push(handle.index());
        self.len -= 1;
        Some(value)
    }

    /// Removes every entry for which `predicate` holds and returns them.
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Vec<T> {
        let handles: Vec<RawHandle> = self
            .iter()
            .filter(|(_, value)| predicate(*value))
            .map(|(handle, _)| handle)
            .collect();
        handles
            .into_iter()
            .filter_map(|handle| self.remove(handle))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<T> {
        self.remove_where(|_| true)
    }

    pub fn iter(&self) -> impl Iterator<Item = (RawHandle, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let value = slot.value.as_ref()?;
            let handle = RawHandle::new(index as u32, slot.generation)?;
            Some((handle, value))
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }
}
