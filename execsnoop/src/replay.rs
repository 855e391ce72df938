//! Runs the probes over a recorded sequence of invocations instead of the live kernel.
//!
//! A trace is JSON lines, one probe invocation per line:
//!
//! ```text
//! {"op":"enter_execve","cpu":0,"pid":100,"ppid":1,"argv":["/bin/ls","-l"]}
//! {"op":"exit_execve","cpu":0,"pid":100,"comm":"ls","ret":0}
//! {"op":"exit","pid":100,"ppid":1,"comm":"ls","exit_code":0}
//! ```
//!
//! A `null` argv entry is a pointer to unreadable memory; `"unreadable": true` makes the
//! task's name unreadable. `ktime_ns` defaults to the line number. Blank lines and lines
//! starting with `#` are skipped.

use std::io::BufRead;

use serde::Deserialize;
use thiserror::Error;

use crate::{
    clock::BootClock,
    config::{ConfigError, ProbeConfig},
    decode::{DecodeError, Record, decode},
    maps::{DropSnapshot, RingBuf},
    memory::SyntheticMemory,
    probes::Probes,
    task::Task,
};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to read trace")]
    Io(#[from] std::io::Error),
    #[error("line {line}: invalid probe invocation")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("probe produced an undecodable record")]
    Decode(#[from] DecodeError),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TraceTask {
    pub pid: u32,
    /// Defaults to `pid`.
    pub tid: Option<u32>,
    #[serde(default)]
    pub ppid: u32,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default)]
    pub comm: String,
    #[serde(default)]
    pub unreadable: bool,
    #[serde(default)]
    pub cpu: u32,
    pub ktime_ns: Option<u64>,
}

impl TraceTask {
    fn task(&self, line: usize) -> Task {
        let mut task = Task::new(self.pid)
            .parent(self.ppid)
            .uid(self.uid)
            .gid(self.gid)
            .named(&self.comm)
            .on_cpu(self.cpu)
            .at(self.ktime_ns.unwrap_or(line as u64));
        task.tid = self.tid.unwrap_or(self.pid);
        if self.unreadable {
            task.comm = None;
        }
        task
    }
}

/// One probe invocation.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    EnterExecve {
        #[serde(flatten)]
        task: TraceTask,
        #[serde(default)]
        argv: Vec<Option<String>>,
    },
    ExitExecve {
        #[serde(flatten)]
        task: TraceTask,
        #[serde(default)]
        ret: i64,
    },
    Fork {
        #[serde(flatten)]
        task: TraceTask,
    },
    Exec {
        #[serde(flatten)]
        task: TraceTask,
    },
    Exit {
        #[serde(flatten)]
        task: TraceTask,
        #[serde(default)]
        exit_code: i32,
    },
}

/// What a replay left behind.
#[derive(Debug)]
pub struct ReplayOutcome {
    /// Execve records followed by lifecycle records, each in publication order.
    pub records: Vec<Record>,
    pub drops: DropSnapshot,
    /// Execve enters still waiting for their exit.
    pub pending: usize,
    pub overwritten: u64,
}

/// Feeds every step to a fresh set of probes, then drains both rings.
///
/// Nothing is consumed while the trace runs, so a trace larger than the rings shows
/// ring-full drops the way a stalled consumer would.
pub fn replay<R: BufRead>(input: R, config: &ProbeConfig) -> Result<ReplayOutcome, ReplayError> {
    let probes = Probes::new(config)?;
    feed(input, &probes)?;

    let clock = BootClock::epoch();
    let mut records = drain(probes.events(), &clock)?;
    records.extend(drain(probes.process_events(), &clock)?);

    Ok(ReplayOutcome {
        records,
        drops: probes.drops().snapshot(),
        pending: probes.execs().pending(),
        overwritten: probes.execs().overwritten(),
    })
}

/// Runs every step of `input` against `probes`, returning the number of steps.
///
/// Records stay in the rings for whoever consumes them.
pub fn feed<R: BufRead>(input: R, probes: &Probes) -> Result<usize, ReplayError> {
    let mut steps = 0;
    for (index, line) in input.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let number = index + 1;
        let step: Step = serde_json::from_str(trimmed).map_err(|source| ReplayError::Parse {
            line: number,
            source,
        })?;
        run_step(probes, &step, number);
        steps += 1;
    }
    Ok(steps)
}

pub fn run_step(probes: &Probes, step: &Step, line: usize) {
    match step {
        Step::EnterExecve { task, argv } => {
            let mut mem = SyntheticMemory::new();
            let args: Vec<Option<&[u8]>> = argv
                .iter()
                .map(|arg| arg.as_deref().map(str::as_bytes))
                .collect();
            let argv = mem.argv_with(&args);
            probes.sys_enter_execve(&task.task(line), &mem, argv);
        }
        Step::ExitExecve { task, ret } => probes.sys_exit_execve(&task.task(line), *ret),
        Step::Fork { task } => probes.sched_process_fork(&task.task(line)),
        Step::Exec { task } => probes.sched_process_exec(&task.task(line)),
        Step::Exit { task, exit_code } => {
            probes.sched_process_exit(&task.task(line).exited(*exit_code))
        }
    }
}

fn drain(ring: &RingBuf, clock: &BootClock) -> Result<Vec<Record>, DecodeError> {
    std::iter::from_fn(|| ring.next())
        .map(|item| decode(&item, clock))
        .collect()
}
