use std::{
    mem,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use bytemuck::Pod;
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use execsnoop_common::pipeline::{EventOutput, Reservation};
use tokio::sync::Notify;

/// Per-record header the kernel ring buffer keeps in front of each sample.
const RECORD_HEADER: usize = 8;

/// Bytes a reservation of `size` occupies in the ring, header and alignment included.
pub const fn record_len(size: usize) -> usize {
    (size + RECORD_HEADER + 7) & !7
}

/// Bounded multi-producer ring buffer with the BPF ring buffer's protocol.
///
/// Space is claimed with a single atomic update at reserve time and returned when the
/// consumer drops the record (or the producer discards it). Records become visible in
/// submission order. Neither side ever takes a lock.
pub struct RingBuf {
    capacity: usize,
    used: AtomicUsize,
    submit_tx: Sender<(Bytes, usize)>,
    submit_rx: Receiver<(Bytes, usize)>,
    readable: Notify,
    rejected: AtomicU64,
}

impl RingBuf {
    pub fn with_byte_size(capacity: usize) -> Self {
        let (submit_tx, submit_rx) = crossbeam_channel::unbounded();
        Self {
            capacity,
            used: AtomicUsize::new(0),
            submit_tx,
            submit_rx,
            readable: Notify::new(),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes held by reserved or unread records.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Reservations refused for lack of space.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Reserves a zeroed slot for one `T`, `None` when the ring is full.
    pub fn reserve<T: Pod>(&self) -> Option<RingBufEntry<'_, T>> {
        let charged = record_len(mem::size_of::<T>());
        let claimed = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(charged).filter(|&next| next <= self.capacity)
            });
        if claimed.is_err() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        Some(RingBufEntry {
            ring: self,
            value: Some(bytemuck::zeroed_box()),
            charged,
        })
    }

    /// Pops the oldest submitted record.
    pub fn next(&self) -> Option<RingBufItem<'_>> {
        let (data, charged) = self.submit_rx.try_recv().ok()?;
        Some(RingBufItem {
            ring: self,
            data,
            charged,
        })
    }

    /// Waits until at least one record has been submitted.
    pub async fn readable(&self) {
        loop {
            if !self.submit_rx.is_empty() {
                return;
            }
            self.readable.notified().await;
        }
    }

    fn push(&self, data: Bytes, charged: usize) {
        // Both ends live in `self`, so the channel is never disconnected.
        if self.submit_tx.send((data, charged)).is_ok() {
            self.readable.notify_one();
        }
    }

    fn release(&self, charged: usize) {
        self.used.fetch_sub(charged, Ordering::AcqRel);
    }
}

/// A reserved, not yet published slot.
pub struct RingBufEntry<'a, T: Pod> {
    ring: &'a RingBuf,
    value: Option<Box<T>>,
    charged: usize,
}

impl<T: Pod> RingBufEntry<'_, T> {
    /// Publishes the record. The slot is gone afterwards.
    pub fn submit(mut self) {
        if let Some(value) = self.value.take() {
            let data = Bytes::copy_from_slice(bytemuck::bytes_of(&*value));
            self.ring.push(data, self.charged);
        }
    }

    /// Returns the slot's space without publishing.
    pub fn discard(mut self) {
        if self.value.take().is_some() {
            self.ring.release(self.charged);
        }
    }
}

impl<T: Pod> Drop for RingBufEntry<'_, T> {
    fn drop(&mut self) {
        if self.value.take().is_some() {
            self.ring.release(self.charged);
        }
    }
}

impl<T: Pod> Deref for RingBufEntry<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `submit`/`discard`/`drop` take the value, and they consume the entry.
        self.value.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Pod> DerefMut for RingBufEntry<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_deref_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Pod> Reservation<T> for RingBufEntry<'_, T> {
    fn submit(self) {
        RingBufEntry::submit(self)
    }

    fn discard(self) {
        RingBufEntry::discard(self)
    }
}

impl<T: Pod> EventOutput<T> for RingBuf {
    type Entry<'a>
        = RingBufEntry<'a, T>
    where
        Self: 'a;

    fn reserve(&self) -> Option<RingBufEntry<'_, T>> {
        RingBuf::reserve(self)
    }
}

/// A record taken off the ring. Its space is returned when it is dropped.
pub struct RingBufItem<'a> {
    ring: &'a RingBuf,
    data: Bytes,
    charged: usize,
}

impl Deref for RingBufItem<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for RingBufItem<'_> {
    fn drop(&mut self) {
        self.ring.release(self.charged);
    }
}
