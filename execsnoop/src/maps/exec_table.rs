use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::{DashMap, mapref::entry::Entry};
use execsnoop_common::{ExecEvent, pipeline::PendingExecs};

/// `-E2BIG`, what a full BPF hash map answers to an insert of a new key.
const E2BIG: i64 = -7;

/// Fixed-capacity pid -> pending execve table.
///
/// Inserting an existing pid overwrites it in place and never needs capacity. A new pid is
/// refused once `capacity` entries are held. Entries leave only through [`remove`].
///
/// [`remove`]: PendingExecs::remove
pub struct ExecTable {
    capacity: usize,
    len: AtomicUsize,
    entries: DashMap<u32, Box<ExecEvent>>,
    overwritten: AtomicU64,
}

impl ExecTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            len: AtomicUsize::new(0),
            entries: DashMap::with_capacity(capacity),
            overwritten: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Entries waiting for their exit probe.
    pub fn pending(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// Pending entries replaced by a later enter for the same pid.
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.entries.contains_key(&pid)
    }
}

impl PendingExecs for ExecTable {
    fn insert(&self, pid: u32, event: &ExecEvent) -> Result<(), i64> {
        match self.entries.entry(pid) {
            Entry::Occupied(mut pending) => {
                **pending.get_mut() = *event;
                self.overwritten.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Entry::Vacant(slot) => {
                self.len
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                        (len < self.capacity).then_some(len + 1)
                    })
                    .map_err(|_| E2BIG)?;
                slot.insert(Box::new(*event));
                Ok(())
            }
        }
    }

    fn with_pending<R>(&self, pid: u32, f: impl FnOnce(&mut ExecEvent) -> R) -> Option<R> {
        let mut pending = self.entries.get_mut(&pid)?;
        Some(f(&mut pending))
    }

    fn remove(&self, pid: u32) {
        if self.entries.remove(&pid).is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
