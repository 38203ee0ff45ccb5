//! Reference-counted callback arena
//!
//! Callbacks are stored by value and addressed through `CallbackHandle`s
//! (slot index + generation). A slot is freed when its last reference is
//! released, and the generation bump makes every outstanding handle to it
//! stale.

use parking_lot::Mutex;

/// Opaque handle to a callback stored in a `CallbackArena`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle {
    index: u32,
    generation: u32,
}

impl CallbackHandle {
    /// Packed form for logs
    pub fn to_raw(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }
}

struct Entry<C> {
    callback: C,
    refs: usize,
}

struct Slot<C> {
    generation: u32,
    entry: Option<Entry<C>>,
}

struct ArenaInner<C> {
    slots: Vec<Slot<C>>,
    free: Vec<u32>,
}

impl<C> ArenaInner<C> {
    fn entry_mut(&mut self, handle: CallbackHandle) -> Option<&mut Entry<C>> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut()
    }
}

/// Arena of callbacks with explicit reference counts
pub struct CallbackArena<C> {
    inner: Mutex<ArenaInner<C>>,
}

impl<C> CallbackArena<C> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ArenaInner {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Store a callback with one reference
    pub fn insert(&self, callback: C) -> CallbackHandle {
        let mut inner = self.inner.lock();
        let entry = Some(Entry { callback, refs: 1 });

        if let Some(index) = inner.free.pop() {
            let slot = &mut inner.slots[index as usize];
            slot.entry = entry;
            return CallbackHandle { index, generation: slot.generation };
        }

        let index = inner.slots.len() as u32;
        inner.slots.push(Slot { generation: 0, entry });
        CallbackHandle { index, generation: 0 }
    }

    /// Drop a reference. Returns true when this freed the slot.
    pub fn release(&self, handle: CallbackHandle) -> bool {
        let mut inner = self.inner.lock();
        let freed = match inner.entry_mut(handle) {
            Some(entry) => {
                entry.refs -= 1;
                entry.refs == 0
            }
            None => return false,
        };

        if freed {
            let slot = &mut inner.slots[handle.index as usize];
            slot.entry = None;
            slot.generation = slot.generation.wrapping_add(1);
            inner.free.push(handle.index);
        }
        freed
    }

    /// Number of live callbacks
    pub fn len(&self) -> usize {
        self.inner.lock().slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C: Clone> CallbackArena<C> {
    /// Copy of the callback behind a live handle
    pub fn get(&self, handle: CallbackHandle) -> Option<C> {
        self.inner.lock().entry_mut(handle).map(|entry| entry.callback.clone())
    }
}

impl<C: PartialEq> CallbackArena<C> {
    /// Reference an equal live callback if one is stored, otherwise insert
    pub fn acquire(&self, callback: C) -> CallbackHandle {
        let mut inner = self.inner.lock();
        let found = inner.slots.iter().enumerate().find_map(|(index, slot)| {
            slot.entry
                .as_ref()
                .filter(|entry| entry.callback == callback)
                .map(|_| CallbackHandle { index: index as u32, generation: slot.generation })
        });

        if let Some(handle) = found {
            if let Some(entry) = inner.entry_mut(handle) {
                entry.refs += 1;
            }
            return handle;
        }

        drop(inner);
        self.insert(callback)
    }
}

impl<C> Default for CallbackArena<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_frees_and_invalidates() {
        let arena = CallbackArena::new();
        let handle = arena.insert("a");
        assert_eq!(arena.get(handle), Some("a"));
        assert!(arena.release(handle));
        assert_eq!(arena.get(handle), None);
        assert!(!arena.release(handle));

        // Slot reuse yields a different handle
        let reused = arena.insert("b");
        assert_ne!(reused, handle);
        assert_ne!(reused.to_raw(), handle.to_raw());
        assert_eq!(arena.get(handle), None);
        assert_eq!(arena.get(reused), Some("b"));
    }

    #[test]
    fn test_acquire_shares_equal_callbacks() {
        let arena = CallbackArena::new();
        let first = arena.acquire(7u64);
        let second = arena.acquire(7u64);
        let other = arena.acquire(8u64);
        assert_eq!(first, second);
        assert_ne!(first, other);

        // Two references: the first release keeps the entry
        assert!(!arena.release(first));
        assert_eq!(arena.get(first), Some(7));
        assert!(arena.release(first));
        assert_eq!(arena.get(first), None);
        assert_eq!(arena.len(), 1);
    }
}
