#![no_std]
#![no_main]

use core::{
    mem::MaybeUninit,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU64, Ordering},
};

use aya_ebpf::{
    bindings::BPF_NOEXIST,
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_get_current_uid_gid,
        bpf_ktime_get_ns, bpf_probe_read_kernel, bpf_probe_read_kernel_buf, bpf_probe_read_user,
        bpf_probe_read_user_str_bytes,
        r#gen::{bpf_get_current_task, bpf_get_smp_processor_id},
    },
    macros::{map, tracepoint},
    maps::{HashMap, PerCpuArray, RingBuf, ring_buf::RingBufEntry},
    programs::TracePointContext,
};
use aya_log_ebpf::debug;
use execsnoop_common::{
    DEFAULT_MAX_ARGS, DROP_REASONS, DropReason, EventKind, ExecEvent, TASK_COMM_LEN, TaskOffsets,
    args::UserMemory,
    pipeline::{
        self, EventOutput, PendingExecs, ProcessCounters, Reservation, ScratchStore, TaskInfo,
        emit_process_event,
    },
};

/// Finalized execve records.
#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(1 << 24, 0);

/// Pending execve records keyed by tgid.
#[map]
static EXECS: HashMap<u32, ExecEvent> = HashMap::with_max_entries(10240, 0);

/// ExecEvent is larger than the BPF stack.
#[map]
static HEAP: PerCpuArray<ExecEvent> = PerCpuArray::with_max_entries(1, 0);

/// Fork, exec and exit records.
#[map]
static PROCESS_EVENTS: RingBuf = RingBuf::with_byte_size(256 * 1024, 0);

#[map]
static PROCESS_STATS: HashMap<u32, u64> = HashMap::with_max_entries(1024, 0);

/// Indexed by `DropReason`.
#[map]
static DROPS: PerCpuArray<u64> = PerCpuArray::with_max_entries(DROP_REASONS, 0);

/// Set by the loader, clamped to `execsnoop_common::MAX_ARGS` by the scan.
#[unsafe(no_mangle)]
static MAX_ARGS: u32 = DEFAULT_MAX_ARGS;

/// Set by the loader from the kernel's BTF.
#[unsafe(no_mangle)]
static TASK_OFFSETS: TaskOffsets = TaskOffsets::UNKNOWN;

// Offsets from /sys/kernel/tracing/events/{syscalls,sched}/*/format.
const SYS_ENTER_EXECVE_ARGV: usize = 24;
const SYS_EXIT_RET: usize = 16;

fn task_offsets() -> TaskOffsets {
    unsafe { core::ptr::read_volatile(&TASK_OFFSETS) }
}

/// Reads a `T` at `offset` bytes into a kernel `task_struct`.
fn task_field<T>(task: *const u8, offset: u32) -> Option<T> {
    if task.is_null() || offset == 0 {
        return None;
    }
    let field = task.wrapping_add(offset as usize) as *const T;
    unsafe { bpf_probe_read_kernel(field) }.ok()
}

fn current_task() -> *const u8 {
    unsafe { bpf_get_current_task() as *const u8 }
}

/// The task the tracepoint fired in. Fork records describe the parent, which is current
/// in `sched_process_fork`.
struct CurrentTask;

impl TaskInfo for CurrentTask {
    fn pid_tgid(&self) -> u64 {
        bpf_get_current_pid_tgid()
    }

    fn uid_gid(&self) -> u64 {
        bpf_get_current_uid_gid()
    }

    fn parent_tgid(&self) -> u32 {
        let offsets = task_offsets();
        if !offsets.parent_known() {
            return 0;
        }
        let parent: Option<u64> = task_field(current_task(), offsets.real_parent);
        parent
            .and_then(|parent| task_field::<i32>(parent as *const u8, offsets.tgid))
            .map_or(0, |tgid| tgid as u32)
    }

    fn comm(&self) -> Result<[u8; TASK_COMM_LEN], i64> {
        bpf_get_current_comm().map_err(|e| e as i64)
    }

    fn ktime_ns(&self) -> u64 {
        unsafe { bpf_ktime_get_ns() }
    }

    fn cpu(&self) -> u32 {
        unsafe { bpf_get_smp_processor_id() }
    }

    fn exit_code(&self) -> i32 {
        let offsets = task_offsets();
        if !offsets.exit_code_known() {
            return 0;
        }
        task_field(current_task(), offsets.exit_code).unwrap_or(0)
    }
}

struct UserSpace;

impl UserMemory for UserSpace {
    fn read_arg_ptr(&self, argv: u64, index: usize) -> Option<u64> {
        let slot = (argv as *const u64).wrapping_add(index);
        unsafe { bpf_probe_read_user(slot) }.ok()
    }

    fn read_str(&self, src: u64, dst: &mut [u8]) -> Result<usize, i64> {
        let bytes = unsafe { bpf_probe_read_user_str_bytes(src as *const u8, dst) }
            .map_err(|e| e as i64)?;
        // the helper's count includes the terminator, the slice does not
        Ok(bytes.len() + 1)
    }
}

struct Heap;

impl ScratchStore for Heap {
    type Slot<'a> = &'a mut ExecEvent;

    fn slot(&self, _cpu: u32) -> Option<Self::Slot<'_>> {
        HEAP.get_ptr_mut(0).map(|ptr| unsafe { &mut *ptr })
    }
}

struct Execs;

impl PendingExecs for Execs {
    fn insert(&self, pid: u32, event: &ExecEvent) -> Result<(), i64> {
        EXECS.insert(&pid, event, 0).map_err(|e| e as i64)
    }

    fn with_pending<R>(&self, pid: u32, f: impl FnOnce(&mut ExecEvent) -> R) -> Option<R> {
        let ptr = EXECS.get_ptr_mut(&pid)?;
        Some(f(unsafe { &mut *ptr }))
    }

    fn remove(&self, pid: u32) {
        let _ = EXECS.remove(&pid);
    }
}

struct Ring(&'static RingBuf);

struct Slot<T: 'static>(RingBufEntry<T>);

impl<T: 'static> Deref for Slot<T> {
    type Target = T;

    fn deref(&self) -> &T {
        let inner: &MaybeUninit<T> = &self.0;
        unsafe { &*inner.as_ptr() }
    }
}

impl<T: 'static> DerefMut for Slot<T> {
    fn deref_mut(&mut self) -> &mut T {
        let inner: &mut MaybeUninit<T> = &mut self.0;
        unsafe { &mut *inner.as_mut_ptr() }
    }
}

impl<T: 'static> Reservation<T> for Slot<T> {
    fn submit(self) {
        self.0.submit(0)
    }

    fn discard(self) {
        self.0.discard(0)
    }
}

impl<T: 'static> EventOutput<T> for Ring {
    type Entry<'a> = Slot<T>;

    fn reserve(&self) -> Option<Slot<T>> {
        self.0.reserve::<T>(0).map(Slot)
    }

    fn copy_bytes(&self, dst: &mut [u8], src: &[u8], len: usize) {
        // the slicing bounds `len` for the verifier
        if let (Some(dst), Some(src)) = (dst.get_mut(..len), src.get(..len)) {
            let _ = unsafe { bpf_probe_read_kernel_buf(src.as_ptr(), dst) };
        }
    }
}

struct Stats;

impl ProcessCounters for Stats {
    fn increment(&self, pid: u32) {
        if let Some(count) = PROCESS_STATS.get_ptr_mut(&pid) {
            unsafe { AtomicU64::from_ptr(count) }.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if PROCESS_STATS.insert(&pid, &1, BPF_NOEXIST as u64).is_err() {
            // lost the insert race to another CPU
            if let Some(count) = PROCESS_STATS.get_ptr_mut(&pid) {
                unsafe { AtomicU64::from_ptr(count) }.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn record_drop(reason: DropReason) {
    if let Some(count) = DROPS.get_ptr_mut(reason as u32) {
        unsafe { *count += 1 };
    }
}

#[tracepoint]
pub fn sys_enter_execve(ctx: TracePointContext) -> u32 {
    match try_sys_enter_execve(&ctx) {
        Ok(()) => 0,
        Err(reason) => {
            record_drop(reason);
            debug!(&ctx, "execve enter dropped: {}", reason as u32);
            0
        }
    }
}

fn try_sys_enter_execve(ctx: &TracePointContext) -> Result<(), DropReason> {
    let argv: u64 = unsafe { ctx.read_at(SYS_ENTER_EXECVE_ARGV) }
        .map_err(|_| DropReason::TaskUnreadable)?;
    let max_args = unsafe { core::ptr::read_volatile(&MAX_ARGS) };
    pipeline::sys_enter_execve(&CurrentTask, &UserSpace, argv, max_args, &Heap, &Execs)
}

#[tracepoint]
pub fn sys_exit_execve(ctx: TracePointContext) -> u32 {
    match try_sys_exit_execve(&ctx) {
        Ok(()) => 0,
        Err(reason) => {
            record_drop(reason);
            0
        }
    }
}

fn try_sys_exit_execve(ctx: &TracePointContext) -> Result<(), DropReason> {
    let ret: i64 = unsafe { ctx.read_at(SYS_EXIT_RET) }.map_err(|_| DropReason::TaskUnreadable)?;
    pipeline::sys_exit_execve(&CurrentTask, ret, &Execs, &Ring(&EVENTS))
}

#[tracepoint]
pub fn sched_process_fork(ctx: TracePointContext) -> u32 {
    match emit_process_event(&CurrentTask, EventKind::Fork, &Ring(&PROCESS_EVENTS), &Stats) {
        Ok(()) => 0,
        Err(reason) => {
            record_drop(reason);
            debug!(&ctx, "fork record dropped: {}", reason as u32);
            0
        }
    }
}

#[tracepoint]
pub fn sched_process_exec(ctx: TracePointContext) -> u32 {
    match emit_process_event(&CurrentTask, EventKind::Exec, &Ring(&PROCESS_EVENTS), &Stats) {
        Ok(()) => 0,
        Err(reason) => {
            record_drop(reason);
            debug!(&ctx, "exec record dropped: {}", reason as u32);
            0
        }
    }
}

#[tracepoint]
pub fn sched_process_exit(ctx: TracePointContext) -> u32 {
    let pid_tgid = bpf_get_current_pid_tgid();
    let tgid = (pid_tgid >> 32) as u32;
    // thread exits are not process exits
    if tgid != pid_tgid as u32 {
        return 0;
    }

    let result = emit_process_event(&CurrentTask, EventKind::Exit, &Ring(&PROCESS_EVENTS), &Stats);
    if let Err(reason) = result {
        record_drop(reason);
        debug!(&ctx, "exit record dropped: {}", reason as u32);
    }
    0
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[unsafe(link_section = "license")]
#[unsafe(no_mangle)]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
