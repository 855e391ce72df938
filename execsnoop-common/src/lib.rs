#![cfg_attr(not(test), no_std)]

pub mod args;
pub mod pipeline;

/// Length of the kernel's `task->comm`.
pub const TASK_COMM_LEN: usize = 16;

/// Upper bound on a single captured argument, terminating NUL included.
pub const ARG_SIZE: usize = 128;

/// Static bound on the argument scan. The `MAX_ARGS` tunable may lower it, never raise it.
pub const MAX_ARGS: usize = 60;

/// Arguments captured when nothing else is configured.
pub const DEFAULT_MAX_ARGS: u32 = 20;

/// Size of the argument trailer carried by every execve record.
pub const ARGS_CAPACITY: usize = MAX_ARGS * ARG_SIZE;

pub const HEADER_SIZE: usize = core::mem::size_of::<EventHeader>();
pub const EXEC_EVENT_SIZE: usize = core::mem::size_of::<ExecEvent>();

/// Discriminant stored in [`EventHeader::kind`].
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// `sched_process_fork`: a new task was created.
    Fork = 0,
    /// `sched_process_exec`: the task replaced its image.
    Exec = 1,
    /// `sched_process_exit`: the task terminated.
    Exit = 2,
    /// A correlated `execve` enter/exit pair, argument trailer attached.
    Execve = 3,
}

impl EventKind {
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Fork),
            1 => Some(Self::Exec),
            2 => Some(Self::Exit),
            3 => Some(Self::Execve),
            _ => None,
        }
    }
}

/// Fixed header shared by every record published to user space.
///
/// The layout is `repr(C)` with no implicit padding: 56 bytes, 8-byte aligned.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "user", derive(bytemuck::Pod, bytemuck::Zeroable))]
pub struct EventHeader {
    /// Thread group id of the traced process.
    pub pid: u32,
    /// Thread group id of the parent, 0 when unknown.
    pub ppid: u32,
    pub uid: u32,
    pub gid: u32,
    /// Process name, NUL padded.
    pub comm: [u8; TASK_COMM_LEN],
    /// `bpf_ktime_get_ns()` at capture time (CLOCK_MONOTONIC).
    pub timestamp_ns: u64,
    /// Syscall result for execve records, exit code for exit records.
    pub retval: i32,
    /// An [`EventKind`] discriminant.
    pub kind: u32,
    pub args_count: u32,
    /// Meaningful bytes at the start of the trailer.
    pub args_size: u32,
}

impl EventHeader {
    pub const fn zeroed() -> Self {
        Self {
            pid: 0,
            ppid: 0,
            uid: 0,
            gid: 0,
            comm: [0u8; TASK_COMM_LEN],
            timestamp_ns: 0,
            retval: 0,
            kind: 0,
            args_count: 0,
            args_size: 0,
        }
    }

    pub fn kind(&self) -> Option<EventKind> {
        EventKind::from_raw(self.kind)
    }
}

/// An execve record: header plus concatenated NUL-terminated arguments.
///
/// Too large for the BPF stack, so it only ever lives in map memory (scratch slot,
/// correlation table, ring buffer reservation).
#[repr(C)]
#[derive(Clone, Copy)]
#[cfg_attr(feature = "user", derive(bytemuck::Pod, bytemuck::Zeroable))]
pub struct ExecEvent {
    pub header: EventHeader,
    pub args: [u8; ARGS_CAPACITY],
}

impl ExecEvent {
    pub const fn zeroed() -> Self {
        Self {
            header: EventHeader::zeroed(),
            args: [0u8; ARGS_CAPACITY],
        }
    }

    /// The meaningful part of the trailer.
    pub fn args(&self) -> &[u8] {
        let len = (self.header.args_size as usize).min(ARGS_CAPACITY);
        &self.args[..len]
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for EventHeader {}

#[cfg(feature = "user")]
unsafe impl aya::Pod for ExecEvent {}

/// Byte offsets of the `task_struct` fields the probes read, as found in the running
/// kernel's BTF. Zero means not found.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TaskOffsets {
    /// `task_struct::real_parent`, a `task_struct *`.
    pub real_parent: u32,
    /// `task_struct::tgid`.
    pub tgid: u32,
    /// `task_struct::exit_code`, `status << 8 | signal` as `wait(2)` reports it.
    pub exit_code: u32,
}

impl TaskOffsets {
    pub const UNKNOWN: TaskOffsets = TaskOffsets {
        real_parent: 0,
        tgid: 0,
        exit_code: 0,
    };

    pub const fn parent_known(&self) -> bool {
        self.real_parent != 0 && self.tgid != 0
    }

    pub const fn exit_code_known(&self) -> bool {
        self.exit_code != 0
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for TaskOffsets {}

/// Why a probe invocation produced no record.
///
/// Doubles as the index into the per-CPU drop counters.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// The per-CPU staging slot could not be obtained.
    ScratchUnavailable = 0,
    /// The correlation table rejected a new pending entry.
    TableFull = 1,
    /// The ring buffer had no room for the reservation.
    RingFull = 2,
    /// An execve exit arrived with no pending entry for the pid.
    Unmatched = 3,
    /// The current task could not be read.
    TaskUnreadable = 4,
}

pub const DROP_REASONS: u32 = 5;

impl DropReason {
    pub const ALL: [DropReason; DROP_REASONS as usize] = [
        DropReason::ScratchUnavailable,
        DropReason::TableFull,
        DropReason::RingFull,
        DropReason::Unmatched,
        DropReason::TaskUnreadable,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            DropReason::ScratchUnavailable => "scratch_unavailable",
            DropReason::TableFull => "table_full",
            DropReason::RingFull => "ring_full",
            DropReason::Unmatched => "unmatched",
            DropReason::TaskUnreadable => "task_unreadable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_has_no_padding() {
        assert_eq!(HEADER_SIZE, 56);
        assert_eq!(core::mem::align_of::<EventHeader>(), 8);
        assert_eq!(EXEC_EVENT_SIZE, HEADER_SIZE + ARGS_CAPACITY);
    }

    #[test]
    fn kind_discriminants() {
        for kind in [EventKind::Fork, EventKind::Exec, EventKind::Exit, EventKind::Execve] {
            assert_eq!(EventKind::from_raw(kind as u32), Some(kind));
        }
        assert_eq!(EventKind::from_raw(4), None);
    }

    #[test]
    fn unknown_offsets_read_nothing() {
        assert!(!TaskOffsets::UNKNOWN.parent_known());
        assert!(!TaskOffsets::UNKNOWN.exit_code_known());
        let partial = TaskOffsets {
            real_parent: 2456,
            ..TaskOffsets::UNKNOWN
        };
        assert!(!partial.parent_known());
    }

    #[test]
    fn args_view_is_clamped() {
        let mut event = ExecEvent::zeroed();
        event.header.args_size = u32::MAX;
        assert_eq!(event.args().len(), ARGS_CAPACITY);
    }
}
