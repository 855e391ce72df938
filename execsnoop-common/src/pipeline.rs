//! Probe logic shared by the BPF object and the in-process maps.
//!
//! Each function is one probe invocation. They never block and never retry: a missing
//! resource ends the invocation with a [`DropReason`] after releasing whatever was
//! acquired.

use core::ops::DerefMut;

use crate::{
    ARGS_CAPACITY, DropReason, EventHeader, EventKind, ExecEvent, TASK_COMM_LEN,
    args::{UserMemory, read_args},
};

/// Attributes of the task the probe fired in.
pub trait TaskInfo {
    /// `tgid << 32 | pid`, as returned by `bpf_get_current_pid_tgid`.
    fn pid_tgid(&self) -> u64;
    /// `gid << 32 | uid`, as returned by `bpf_get_current_uid_gid`.
    fn uid_gid(&self) -> u64;
    /// Parent thread group id, 0 when unknown.
    fn parent_tgid(&self) -> u32;
    fn comm(&self) -> Result<[u8; TASK_COMM_LEN], i64>;
    fn ktime_ns(&self) -> u64;
    /// Execution unit the probe runs on.
    fn cpu(&self) -> u32;
    /// Exit status, only meaningful in exit probes.
    fn exit_code(&self) -> i32;

    fn tgid(&self) -> u32 {
        (self.pid_tgid() >> 32) as u32
    }
}

/// One staging slot per execution unit.
pub trait ScratchStore {
    type Slot<'a>: DerefMut<Target = ExecEvent>
    where
        Self: 'a;

    fn slot(&self, cpu: u32) -> Option<Self::Slot<'_>>;
}

/// Pending execve events keyed by pid.
pub trait PendingExecs {
    /// Stores `event` under `pid`, replacing any previous entry.
    fn insert(&self, pid: u32, event: &ExecEvent) -> Result<(), i64>;

    /// Runs `f` on the entry for `pid`, `None` on a miss.
    fn with_pending<R>(&self, pid: u32, f: impl FnOnce(&mut ExecEvent) -> R) -> Option<R>;

    fn remove(&self, pid: u32);
}

/// A reserved ring buffer slot.
///
/// Dropping a reservation without submitting it must release it.
pub trait Reservation<T>: DerefMut<Target = T> {
    fn submit(self);
    fn discard(self);
}

/// A ring buffer accepting records of type `T`.
pub trait EventOutput<T> {
    type Entry<'a>: Reservation<T>
    where
        Self: 'a;

    fn reserve(&self) -> Option<Self::Entry<'_>>;

    /// Copies the first `len` bytes of `src` into a reserved record.
    ///
    /// Callers keep `len` within both slices.
    #[inline(always)]
    fn copy_bytes(&self, dst: &mut [u8], src: &[u8], len: usize) {
        dst[..len].copy_from_slice(&src[..len]);
    }
}

/// Per-pid lifecycle counters.
pub trait ProcessCounters {
    fn increment(&self, pid: u32);
}

/// `sys_enter_execve`: stage the identity and arguments, park them under the pid.
#[inline(always)]
pub fn sys_enter_execve<T, M, S, P>(
    task: &T,
    mem: &M,
    argv: u64,
    max_args: u32,
    scratch: &S,
    execs: &P,
) -> Result<(), DropReason>
where
    T: TaskInfo,
    M: UserMemory,
    S: ScratchStore,
    P: PendingExecs,
{
    let mut slot = scratch
        .slot(task.cpu())
        .ok_or(DropReason::ScratchUnavailable)?;
    let event: &mut ExecEvent = &mut slot;

    let uid_gid = task.uid_gid();
    event.header = EventHeader::zeroed();
    event.header.pid = task.tgid();
    event.header.ppid = task.parent_tgid();
    event.header.uid = uid_gid as u32;
    event.header.gid = (uid_gid >> 32) as u32;
    event.header.timestamp_ns = task.ktime_ns();
    event.header.kind = EventKind::Execve as u32;

    read_args(mem, argv, max_args, event);

    execs
        .insert(event.header.pid, event)
        .map_err(|_| DropReason::TableFull)
}

/// `sys_exit_execve`: finalize the pending event for the pid and publish it.
///
/// The pending entry is removed whether or not publication succeeded.
#[inline(always)]
pub fn sys_exit_execve<T, P, O>(task: &T, ret: i64, execs: &P, events: &O) -> Result<(), DropReason>
where
    T: TaskInfo,
    P: PendingExecs,
    O: EventOutput<ExecEvent>,
{
    let pid = task.tgid();
    let published = execs
        .with_pending(pid, |pending| publish_exec(task, ret, pending, events))
        .ok_or(DropReason::Unmatched)?;
    execs.remove(pid);
    published
}

#[inline(always)]
fn publish_exec<T, O>(task: &T, ret: i64, pending: &mut ExecEvent, events: &O) -> Result<(), DropReason>
where
    T: TaskInfo,
    O: EventOutput<ExecEvent>,
{
    pending.header.retval = ret as i32;

    // Always the full record size, the trailer length is not known to the verifier.
    let mut entry = events.reserve().ok_or(DropReason::RingFull)?;
    let event: &mut ExecEvent = &mut entry;

    let len = (pending.header.args_size as usize).min(ARGS_CAPACITY);
    event.header = pending.header;
    event.header.args_size = len as u32;
    // execve may rename the task, so comm is read at exit.
    event.header.comm = task.comm().unwrap_or([0u8; TASK_COMM_LEN]);
    events.copy_bytes(&mut event.args, &pending.args, len);

    entry.submit();
    Ok(())
}

/// One-shot lifecycle record (fork, exec, exit) for the current task.
#[inline(always)]
pub fn emit_process_event<T, O, C>(
    task: &T,
    kind: EventKind,
    events: &O,
    counters: &C,
) -> Result<(), DropReason>
where
    T: TaskInfo,
    O: EventOutput<EventHeader>,
    C: ProcessCounters,
{
    let mut entry = events.reserve().ok_or(DropReason::RingFull)?;

    let comm = match task.comm() {
        Ok(comm) => comm,
        Err(_) => {
            entry.discard();
            return Err(DropReason::TaskUnreadable);
        }
    };

    let uid_gid = task.uid_gid();
    let event: &mut EventHeader = &mut entry;
    *event = EventHeader::zeroed();
    event.pid = task.tgid();
    event.ppid = task.parent_tgid();
    event.uid = uid_gid as u32;
    event.gid = (uid_gid >> 32) as u32;
    event.comm = comm;
    event.timestamp_ns = task.ktime_ns();
    event.kind = kind as u32;
    if kind == EventKind::Exit {
        event.retval = task.exit_code();
    }

    counters.increment(event.pid);
    entry.submit();
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{boxed::Box, cell::RefCell, vec::Vec};

    use super::*;

    struct Current {
        pid: u32,
    }

    impl TaskInfo for Current {
        fn pid_tgid(&self) -> u64 {
            (u64::from(self.pid) << 32) | u64::from(self.pid)
        }

        fn uid_gid(&self) -> u64 {
            0
        }

        fn parent_tgid(&self) -> u32 {
            1
        }

        fn comm(&self) -> Result<[u8; TASK_COMM_LEN], i64> {
            let mut comm = [0u8; TASK_COMM_LEN];
            comm[..2].copy_from_slice(b"ls");
            Ok(comm)
        }

        fn ktime_ns(&self) -> u64 {
            0
        }

        fn cpu(&self) -> u32 {
            0
        }

        fn exit_code(&self) -> i32 {
            0
        }
    }

    struct OnePending(RefCell<Option<Box<ExecEvent>>>);

    impl PendingExecs for OnePending {
        fn insert(&self, _pid: u32, event: &ExecEvent) -> Result<(), i64> {
            *self.0.borrow_mut() = Some(Box::new(*event));
            Ok(())
        }

        fn with_pending<R>(&self, _pid: u32, f: impl FnOnce(&mut ExecEvent) -> R) -> Option<R> {
            self.0.borrow_mut().as_deref_mut().map(f)
        }

        fn remove(&self, _pid: u32) {
            self.0.borrow_mut().take();
        }
    }

    /// Output that records every trailer copy it is asked to make.
    #[derive(Default)]
    struct Recording {
        copies: RefCell<Vec<usize>>,
        published: RefCell<Vec<Box<ExecEvent>>>,
    }

    struct Held<'a> {
        output: &'a Recording,
        event: Box<ExecEvent>,
    }

    impl core::ops::Deref for Held<'_> {
        type Target = ExecEvent;

        fn deref(&self) -> &ExecEvent {
            &self.event
        }
    }

    impl DerefMut for Held<'_> {
        fn deref_mut(&mut self) -> &mut ExecEvent {
            &mut self.event
        }
    }

    impl Reservation<ExecEvent> for Held<'_> {
        fn submit(self) {
            self.output.published.borrow_mut().push(self.event);
        }

        fn discard(self) {}
    }

    impl EventOutput<ExecEvent> for Recording {
        type Entry<'a>
            = Held<'a>
        where
            Self: 'a;

        fn reserve(&self) -> Option<Held<'_>> {
            Some(Held {
                output: self,
                event: Box::new(ExecEvent::zeroed()),
            })
        }

        fn copy_bytes(&self, dst: &mut [u8], src: &[u8], len: usize) {
            self.copies.borrow_mut().push(len);
            dst[..len].copy_from_slice(&src[..len]);
        }
    }

    #[test]
    fn trailer_goes_through_the_output_copy() {
        let mut pending = ExecEvent::zeroed();
        pending.header.pid = 7;
        pending.header.args_count = 2;
        pending.header.args_size = 11;
        pending.args[..11].copy_from_slice(b"/bin/ls\0-l\0");
        let execs = OnePending(RefCell::new(Some(Box::new(pending))));
        let output = Recording::default();

        sys_exit_execve(&Current { pid: 7 }, 0, &execs, &output).unwrap();

        assert_eq!(*output.copies.borrow(), [11]);
        let published = output.published.borrow();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].args(), b"/bin/ls\0-l\0");
        assert_eq!(&published[0].header.comm[..3], b"ls\0");
    }

    #[test]
    fn oversized_trailer_is_clamped_before_the_copy() {
        let mut pending = ExecEvent::zeroed();
        pending.header.args_size = u32::MAX;
        let execs = OnePending(RefCell::new(Some(Box::new(pending))));
        let output = Recording::default();

        sys_exit_execve(&Current { pid: 1 }, 0, &execs, &output).unwrap();

        assert_eq!(*output.copies.borrow(), [ARGS_CAPACITY]);
        assert!(execs.0.borrow().is_none());
    }
}
