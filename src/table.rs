//! Slot table with a free list and per-slot reference counts.
//!
//! Both the task scheduler and the job system address their records through
//! small integer handles into one of these tables. A slot is alive from the
//! moment it is allocated until its reference count drops to zero, at which
//! point the index returns to the free list and may be handed out again.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Hook invoked once when the last reference to a slot is dropped, right
/// before the index returns to the free list. Records use this to release
/// their stored closure so captured resources are freed promptly.
pub(crate) trait Recycle: Default {
    fn recycle(&self);
}

pub(crate) struct Slot<T> {
    pub refs: AtomicU32,
    pub data: T,
}

/// A growable array of records addressed by integer handle.
///
/// The backing vec holds `Arc`s so that a caller can clone a slot out from
/// under the table lock and never hold that lock while touching the record,
/// in particular never while executing user work. The free list is LIFO, so
/// a released index is the first candidate for the next allocation.
pub(crate) struct SlotTable<T> {
    slots: RwLock<Vec<Arc<Slot<T>>>>,
    free: Mutex<Vec<u32>>,
    limit: Option<usize>,
}

impl<T: Recycle> SlotTable<T> {
    /// Creates a table with `initial` pre-allocated slots. When `limit` is
    /// set, the table refuses to grow past it; exhausting a bounded table is
    /// a resource-budget bug in the caller and is asserted, not returned.
    pub fn new(initial: usize, limit: Option<usize>) -> Self {
        let initial = match limit {
            Some(limit) => initial.min(limit),
            None => initial,
        };

        let slots = (0..initial)
            .map(|_| {
                Arc::new(Slot {
                    refs: AtomicU32::new(0),
                    data: T::default(),
                })
            })
            .collect();

        SlotTable {
            slots: RwLock::new(slots),
            free: Mutex::new((0..initial as u32).collect()),
            limit,
        }
    }

    /// Pops a free index, growing the backing array when none is available.
    /// The slot starts out with `initial_refs` references; the caller is
    /// responsible for resetting the record's fields before the handle
    /// escapes, so a recycled slot never leaks state from its previous
    /// occupant.
    pub fn allocate(&self, initial_refs: u32) -> (u32, Arc<Slot<T>>) {
        let popped = self.free.lock().unwrap().pop();

        let (index, slot) = match popped {
            Some(index) => (index, self.get(index)),
            None => {
                let mut slots = self.slots.write().unwrap();
                if let Some(limit) = self.limit
                    && slots.len() >= limit
                {
                    // Release the guard first so the panic unwinds without
                    // poisoning the lock; handles dropped during the unwind
                    // still call back into the table.
                    drop(slots);
                    panic!("slot table exhausted: {limit} records in flight");
                }
                let index = slots.len() as u32;
                let slot = Arc::new(Slot {
                    refs: AtomicU32::new(0),
                    data: T::default(),
                });
                slots.push(Arc::clone(&slot));
                (index, slot)
            }
        };

        // Nobody else can observe the slot between free-list pop and handle
        // construction, so a plain store is enough here.
        slot.refs.store(initial_refs, Ordering::Release);
        (index, slot)
    }

    pub fn get(&self, index: u32) -> Arc<Slot<T>> {
        Arc::clone(&self.slots.read().unwrap()[index as usize])
    }

    pub fn incref(&self, index: u32) {
        self.get(index).refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference; at zero the record is recycled and the index
    /// becomes available for reuse. The handle value must not be
    /// dereferenced past this point.
    pub fn release(&self, index: u32) {
        let slot = self.get(index);
        if slot.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            slot.data.recycle();
            self.free.lock().unwrap().push(index);
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots.read().unwrap().len()
    }

    #[cfg(test)]
    pub fn free_len(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[derive(Default)]
    struct TestRecord {
        recycled: AtomicU32,
    }

    impl Recycle for TestRecord {
        fn recycle(&self) {
            self.recycled.fetch_add(1, Ordering::AcqRel);
        }
    }

    #[test]
    fn allocated_indices_are_unique() {
        let table: SlotTable<TestRecord> = SlotTable::new(4, None);
        let mut seen = HashSet::new();
        for _ in 0..16 {
            let (index, _) = table.allocate(1);
            assert!(seen.insert(index), "index {index} handed out twice");
        }
    }

    #[test]
    fn grows_past_initial_size() {
        let table: SlotTable<TestRecord> = SlotTable::new(2, None);
        let handles: Vec<_> = (0..8).map(|_| table.allocate(1)).collect();
        assert_eq!(table.len(), 8);
        drop(handles);
    }

    #[test]
    fn release_recycles_and_reuses() {
        let table: SlotTable<TestRecord> = SlotTable::new(1, None);
        let (index, slot) = table.allocate(1);
        table.release(index);
        assert_eq!(slot.data.recycled.load(Ordering::Acquire), 1);

        // LIFO free list: the next allocation takes the same slot back.
        let (again, _) = table.allocate(1);
        assert_eq!(again, index);
    }

    #[test]
    fn refcount_keeps_slot_alive() {
        let table: SlotTable<TestRecord> = SlotTable::new(1, None);
        let (index, slot) = table.allocate(2);
        table.release(index);
        assert_eq!(slot.data.recycled.load(Ordering::Acquire), 0);
        table.release(index);
        assert_eq!(slot.data.recycled.load(Ordering::Acquire), 1);
    }

    #[test]
    #[should_panic(expected = "slot table exhausted")]
    fn bounded_table_asserts_on_exhaustion() {
        let table: SlotTable<TestRecord> = SlotTable::new(2, Some(2));
        let _a = table.allocate(1);
        let _b = table.allocate(1);
        let _c = table.allocate(1);
    }
}
