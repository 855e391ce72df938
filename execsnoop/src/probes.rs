use std::sync::Arc;

use execsnoop_common::{
    DropReason, EventKind,
    args::UserMemory,
    pipeline::{self, emit_process_event},
};
use tracing::trace;

use crate::{
    config::{ConfigError, ProbeConfig},
    maps::{DropCounters, ExecTable, ProcessStats, RingBuf, ScratchPool},
    task::Task,
};

/// The probe programs running against in-process maps.
///
/// Every handler is one probe invocation: it never blocks, never reports failure to the
/// caller, and leaves a dropped invocation visible only through [`drops`](Self::drops).
/// Clones share the same maps.
#[derive(Clone)]
pub struct Probes {
    max_args: u32,
    scratch: Arc<ScratchPool>,
    execs: Arc<ExecTable>,
    events: Arc<RingBuf>,
    process_events: Arc<RingBuf>,
    stats: Arc<ProcessStats>,
    drops: Arc<DropCounters>,
}

impl Probes {
    pub fn new(config: &ProbeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            max_args: config.max_args,
            scratch: Arc::new(ScratchPool::new(config.cpus)),
            execs: Arc::new(ExecTable::with_capacity(config.exec_table_capacity)),
            events: Arc::new(RingBuf::with_byte_size(config.events_ring_bytes)),
            process_events: Arc::new(RingBuf::with_byte_size(config.process_ring_bytes)),
            stats: Arc::new(ProcessStats::with_capacity(config.stats_capacity)),
            drops: Arc::new(DropCounters::default()),
        })
    }

    /// `syscalls/sys_enter_execve`
    pub fn sys_enter_execve<M: UserMemory>(&self, task: &Task, mem: &M, argv: u64) {
        let result = pipeline::sys_enter_execve(
            task,
            mem,
            argv,
            self.max_args,
            &*self.scratch,
            &*self.execs,
        );
        self.settle(task, "sys_enter_execve", result);
    }

    /// `syscalls/sys_exit_execve`
    pub fn sys_exit_execve(&self, task: &Task, ret: i64) {
        let result = pipeline::sys_exit_execve(task, ret, &*self.execs, &*self.events);
        self.settle(task, "sys_exit_execve", result);
    }

    /// `sched/sched_process_fork`, with `task` being the forking (parent) task.
    pub fn sched_process_fork(&self, task: &Task) {
        self.lifecycle(task, EventKind::Fork, "sched_process_fork");
    }

    /// `sched/sched_process_exec`
    pub fn sched_process_exec(&self, task: &Task) {
        self.lifecycle(task, EventKind::Exec, "sched_process_exec");
    }

    /// `sched/sched_process_exit`
    pub fn sched_process_exit(&self, task: &Task) {
        self.lifecycle(task, EventKind::Exit, "sched_process_exit");
    }

    pub fn events(&self) -> &Arc<RingBuf> {
        &self.events
    }

    pub fn process_events(&self) -> &Arc<RingBuf> {
        &self.process_events
    }

    pub fn execs(&self) -> &Arc<ExecTable> {
        &self.execs
    }

    pub fn stats(&self) -> &Arc<ProcessStats> {
        &self.stats
    }

    pub fn drops(&self) -> &Arc<DropCounters> {
        &self.drops
    }

    fn lifecycle(&self, task: &Task, kind: EventKind, probe: &'static str) {
        let result = emit_process_event(task, kind, &*self.process_events, &*self.stats);
        self.settle(task, probe, result);
    }

    fn settle(&self, task: &Task, probe: &'static str, result: Result<(), DropReason>) {
        if let Err(reason) = result {
            self.drops.record(reason);
            trace!(probe, pid = task.pid, reason = reason.as_str(), "record dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use execsnoop_common::{EventHeader, ExecEvent, HEADER_SIZE};

    use super::*;
    use crate::memory::SyntheticMemory;

    fn probes() -> Probes {
        Probes::new(&ProbeConfig {
            cpus: 2,
            ..ProbeConfig::default()
        })
        .unwrap()
    }

    fn next_exec(ring: &RingBuf) -> Option<ExecEvent> {
        ring.next().map(|item| bytemuck::pod_read_unaligned(&item))
    }

    #[test]
    fn exit_without_enter_is_a_noop() {
        let probes = probes();
        probes.sys_exit_execve(&Task::new(7).named("ls"), 0);
        assert!(probes.events().next().is_none());
        assert_eq!(probes.execs().pending(), 0);
        assert_eq!(probes.drops().get(DropReason::Unmatched), 1);
    }

    #[test]
    fn enter_and_exit_may_run_on_different_cpus() {
        let probes = probes();
        let mut mem = SyntheticMemory::new();
        let argv = mem.argv(&["/usr/bin/env"]);
        probes.sys_enter_execve(&Task::new(9).on_cpu(0), &mem, argv);
        probes.sys_exit_execve(&Task::new(9).on_cpu(1).named("env"), 0);

        let event = next_exec(probes.events()).unwrap();
        assert_eq!(event.header.pid, 9);
        assert_eq!(event.args(), b"/usr/bin/env\0");
    }

    #[test]
    fn busy_scratch_drops_the_enter() {
        let probes = probes();
        let mem = SyntheticMemory::new();
        let task = Task::new(3).on_cpu(5);
        probes.sys_enter_execve(&task, &mem, 0);
        assert_eq!(probes.drops().get(DropReason::ScratchUnavailable), 1);
        assert!(!probes.execs().contains(3));
    }

    #[test]
    fn lifecycle_records_count_per_pid() {
        let probes = probes();
        let task = Task::new(50).parent(1).named("sleep");
        probes.sched_process_fork(&task);
        probes.sched_process_exec(&task);
        probes.sched_process_exit(&task.clone().exited(3));

        let kinds: Vec<_> = std::iter::from_fn(|| probes.process_events().next())
            .map(|item| bytemuck::pod_read_unaligned::<EventHeader>(&item[..HEADER_SIZE]))
            .map(|header| (header.kind(), header.retval))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (Some(EventKind::Fork), 0),
                (Some(EventKind::Exec), 0),
                (Some(EventKind::Exit), 3),
            ]
        );
        assert_eq!(probes.stats().get(50), Some(3));
    }

    #[test]
    fn unreadable_task_discards_the_reservation() {
        let probes = probes();
        let mut task = Task::new(4);
        task.comm = None;
        probes.sched_process_exec(&task);
        assert!(probes.process_events().next().is_none());
        assert_eq!(probes.process_events().used(), 0);
        assert_eq!(probes.stats().get(4), None);
        assert_eq!(probes.drops().get(DropReason::TaskUnreadable), 1);
    }
}
