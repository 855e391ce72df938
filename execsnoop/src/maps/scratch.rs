use std::{
    ops::{Deref, DerefMut},
    sync::{Mutex, MutexGuard},
};

use execsnoop_common::{ExecEvent, pipeline::ScratchStore};

/// One staging [`ExecEvent`] per execution unit, selected by CPU id.
///
/// A slot is only ever handed out once at a time; a second concurrent request for the same
/// CPU fails instead of waiting.
pub struct ScratchPool {
    slots: Box<[Mutex<Box<ExecEvent>>]>,
}

impl ScratchPool {
    pub fn new(cpus: usize) -> Self {
        let slots = (0..cpus)
            .map(|_| Mutex::new(bytemuck::zeroed_box::<ExecEvent>()))
            .collect();
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

pub struct ScratchSlot<'a>(MutexGuard<'a, Box<ExecEvent>>);

impl Deref for ScratchSlot<'_> {
    type Target = ExecEvent;

    fn deref(&self) -> &ExecEvent {
        &self.0
    }
}

impl DerefMut for ScratchSlot<'_> {
    fn deref_mut(&mut self) -> &mut ExecEvent {
        &mut self.0
    }
}

impl ScratchStore for ScratchPool {
    type Slot<'a>
        = ScratchSlot<'a>
    where
        Self: 'a;

    fn slot(&self, cpu: u32) -> Option<ScratchSlot<'_>> {
        let slot = self.slots.get(cpu as usize)?;
        // Contents are fully rewritten by every user, so a poisoned slot is still usable.
        let guard = match slot.try_lock() {
            Ok(guard) => guard,
            Err(std::sync::TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(std::sync::TryLockError::WouldBlock) => return None,
        };
        Some(ScratchSlot(guard))
    }
}
