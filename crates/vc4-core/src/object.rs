//! # Reference-Counted Object Tables
//!
//! Every API object lives in an [`ObjectTable`]: a slot arena addressed by
//! generation-checked [`Handle`]s. Each live slot carries an atomic external
//! reference count and an `Arc` to the object.
//!
//! The external count and the `Arc` count are separate. The external count is
//! what `retain`/`release` manipulate; the table drops its `Arc` exactly when
//! the external count reaches zero. Commands that still hold a clone of the
//! `Arc` keep the storage alive until they finish, but the handle is dead.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::RwLock;

use crate::error::{Error, Result};
use crate::types::Handle;

// =============================================================================
// SLOTS
// =============================================================================

struct Entry<T> {
    refs: AtomicU32,
    object: Arc<T>,
}

struct Slot<T> {
    generation: u32,
    entry: Option<Entry<T>>,
}

struct Slots<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

// =============================================================================
// OBJECT TABLE
// =============================================================================

/// Generation-checked arena of reference-counted objects
pub struct ObjectTable<T> {
    inner: RwLock<Slots<T>>,
    invalid: Error,
}

impl<T> ObjectTable<T> {
    /// Create an empty table; lookups of unknown handles fail with `invalid`
    pub const fn new(invalid: Error) -> Self {
        Self {
            inner: RwLock::new(Slots {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
            invalid,
        }
    }

    /// Insert an object with a reference count of one
    pub fn insert(&self, object: T) -> Handle<T> {
        self.insert_arc(Arc::new(object))
    }

    /// Insert an already shared object with a reference count of one
    pub fn insert_arc(&self, object: Arc<T>) -> Handle<T> {
        let mut inner = self.inner.write();
        let entry = Entry {
            refs: AtomicU32::new(1),
            object,
        };
        inner.live += 1;

        if let Some(index) = inner.free.pop() {
            let slot = &mut inner.slots[index as usize];
            slot.entry = Some(entry);
            return Handle::from_parts(index, slot.generation);
        }

        let index = inner.slots.len() as u32;
        inner.slots.push(Slot {
            generation: 1,
            entry: Some(entry),
        });
        Handle::from_parts(index, 1)
    }

    /// Look up a live object
    pub fn get(&self, handle: Handle<T>) -> Result<Arc<T>> {
        let inner = self.inner.read();
        Self::entry(&inner, handle)
            .map(|e| Arc::clone(&e.object))
            .ok_or(self.invalid)
    }

    /// Whether the handle names a live object
    pub fn contains(&self, handle: Handle<T>) -> bool {
        let inner = self.inner.read();
        Self::entry(&inner, handle).is_some()
    }

    /// Increment the external reference count
    pub fn retain(&self, handle: Handle<T>) -> Result<u32> {
        let inner = self.inner.read();
        let entry = Self::entry(&inner, handle).ok_or(self.invalid)?;

        let mut current = entry.refs.load(Ordering::Acquire);
        loop {
            if current == 0 || current == u32::MAX {
                return Err(self.invalid);
            }
            match entry.refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current + 1),
                Err(actual) => current = actual,
            }
        }
    }

    /// Decrement the external reference count
    ///
    /// Returns the removed object when the count reaches zero. The handle is
    /// invalid from that point on.
    pub fn release(&self, handle: Handle<T>) -> Result<Option<Arc<T>>> {
        let mut inner = self.inner.write();
        let index = handle.index() as usize;
        let remaining = {
            let entry = Self::entry(&inner, handle).ok_or(self.invalid)?;
            let refs = entry.refs.load(Ordering::Acquire);
            if refs == 0 {
                return Err(self.invalid);
            }
            entry.refs.store(refs - 1, Ordering::Release);
            refs - 1
        };

        if remaining > 0 {
            return Ok(None);
        }

        let slot = &mut inner.slots[index];
        let entry = slot.entry.take();
        slot.generation = slot.generation.wrapping_add(1).max(1);
        inner.free.push(index as u32);
        inner.live -= 1;
        log::trace!("object table: slot {} freed", index);
        Ok(entry.map(|e| e.object))
    }

    /// Current external reference count
    pub fn reference_count(&self, handle: Handle<T>) -> Result<u32> {
        let inner = self.inner.read();
        Self::entry(&inner, handle)
            .map(|e| e.refs.load(Ordering::Acquire))
            .ok_or(self.invalid)
    }

    /// Number of live objects
    pub fn len(&self) -> usize {
        self.inner.read().live
    }

    /// Whether the table holds no live objects
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every live object
    pub fn snapshot(&self) -> Vec<(Handle<T>, Arc<T>)> {
        let inner = self.inner.read();
        inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.entry.as_ref().map(|e| {
                    (
                        Handle::from_parts(index as u32, slot.generation),
                        Arc::clone(&e.object),
                    )
                })
            })
            .collect()
    }

    fn entry(inner: &Slots<T>, handle: Handle<T>) -> Option<&Entry<T>> {
        let slot = inner.slots.get(handle.index() as usize)?;
        if slot.generation != handle.generation() {
            return None;
        }
        slot.entry.as_ref()
    }
}

impl<T> core::fmt::Debug for ObjectTable<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ObjectTable")
            .field("live", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_starts_at_one() {
        let table = ObjectTable::new(Error::InvalidKernel);
        let h = table.insert(5u32);
        assert_eq!(table.reference_count(h), Ok(1));
        assert_eq!(*table.get(h).unwrap(), 5);
    }

    #[test]
    fn test_retain_release_balance() {
        let table = ObjectTable::new(Error::InvalidKernel);
        let h = table.insert(1u32);
        assert_eq!(table.retain(h), Ok(2));
        assert!(table.release(h).unwrap().is_none());
        assert_eq!(table.reference_count(h), Ok(1));
    }

    #[test]
    fn test_release_to_zero_invalidates() {
        let table = ObjectTable::new(Error::InvalidMemObject);
        let h = table.insert(9u32);
        let removed = table.release(h).unwrap();
        assert_eq!(removed.as_deref(), Some(&9));
        assert_eq!(table.release(h), Err(Error::InvalidMemObject));
        assert_eq!(table.retain(h), Err(Error::InvalidMemObject));
        assert!(table.is_empty());
    }

    #[test]
    fn test_stale_handle_rejected_after_reuse() {
        let table = ObjectTable::new(Error::InvalidEvent);
        let old = table.insert(1u32);
        table.release(old).unwrap();
        let new = table.insert(2u32);
        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);
        assert_eq!(table.get(old).err(), Some(Error::InvalidEvent));
        assert_eq!(*table.get(new).unwrap(), 2);
    }

    #[test]
    fn test_null_handle_rejected() {
        let table: ObjectTable<u32> = ObjectTable::new(Error::InvalidContext);
        assert_eq!(table.get(Handle::null()).err(), Some(Error::InvalidContext));
    }

    #[test]
    fn test_outstanding_arc_survives_release() {
        let table = ObjectTable::new(Error::InvalidKernel);
        let h = table.insert(alloc::string::String::from("kernel"));
        let held = table.get(h).unwrap();
        table.release(h).unwrap();
        assert_eq!(held.as_str(), "kernel");
    }

    #[test]
    fn test_concurrent_retain_release() {
        use std::thread;

        let table = Arc::new(ObjectTable::new(Error::InvalidKernel));
        let h = table.insert(0u32);
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        table.retain(h).unwrap();
                        table.release(h).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(table.reference_count(h), Ok(1));
    }
}
