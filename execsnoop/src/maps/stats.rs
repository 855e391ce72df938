use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::{DashMap, mapref::entry::Entry};
use execsnoop_common::{DROP_REASONS, DropReason, pipeline::ProcessCounters};

/// pid -> number of lifecycle records emitted for it.
///
/// Bounded like the BPF hash map it stands in for: once `capacity` pids are tracked new
/// pids are not counted. Entries are never removed.
pub struct ProcessStats {
    capacity: usize,
    len: AtomicUsize,
    counts: DashMap<u32, AtomicU64>,
}

impl ProcessStats {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            len: AtomicUsize::new(0),
            counts: DashMap::with_capacity(capacity),
        }
    }

    pub fn get(&self, pid: u32) -> Option<u64> {
        self.counts
            .get(&pid)
            .map(|count| count.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> Vec<(u32, u64)> {
        let mut counts: Vec<_> = self
            .counts
            .iter()
            .map(|entry| (*entry.key(), entry.value().load(Ordering::Relaxed)))
            .collect();
        counts.sort_unstable();
        counts
    }
}

impl ProcessCounters for ProcessStats {
    fn increment(&self, pid: u32) {
        if let Some(count) = self.counts.get(&pid) {
            count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        match self.counts.entry(pid) {
            Entry::Occupied(count) => {
                count.get().fetch_add(1, Ordering::Relaxed);
            }
            Entry::Vacant(slot) => {
                let claimed = self
                    .len
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                        (len < self.capacity).then_some(len + 1)
                    });
                if claimed.is_ok() {
                    slot.insert(AtomicU64::new(1));
                }
            }
        }
    }
}

/// Probe invocations that ended without a record, by reason.
#[derive(Default)]
pub struct DropCounters([AtomicU64; DROP_REASONS as usize]);

impl DropCounters {
    pub fn record(&self, reason: DropReason) {
        self.0[reason as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, reason: DropReason) -> u64 {
        self.0[reason as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> DropSnapshot {
        DropSnapshot::from_fn(|reason| self.get(reason))
    }
}

/// Drop counts, one field per [`DropReason`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DropSnapshot {
    pub scratch_unavailable: u64,
    pub table_full: u64,
    pub ring_full: u64,
    pub unmatched: u64,
    pub task_unreadable: u64,
}

impl DropSnapshot {
    pub fn from_fn(mut count: impl FnMut(DropReason) -> u64) -> Self {
        Self {
            scratch_unavailable: count(DropReason::ScratchUnavailable),
            table_full: count(DropReason::TableFull),
            ring_full: count(DropReason::RingFull),
            unmatched: count(DropReason::Unmatched),
            task_unreadable: count(DropReason::TaskUnreadable),
        }
    }
}
