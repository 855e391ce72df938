use std::path::PathBuf;

use aya::{
    Ebpf, EbpfError, EbpfLoader,
    maps::{HashMap, MapData, MapError, PerCpuArray, RingBuf},
    programs::{ProgramError, TracePoint},
};
use execsnoop_common::{DropReason, TaskOffsets};
use thiserror::Error;
use tracing::{info, warn};

use crate::{btf, config::RunConfig, maps::DropSnapshot, server::StatsSource};

/// `(category, name)` of every tracepoint the object provides; the program is named after
/// the tracepoint.
pub const TRACEPOINTS: [(&str, &str); 5] = [
    ("syscalls", "sys_enter_execve"),
    ("syscalls", "sys_exit_execve"),
    ("sched", "sched_process_fork"),
    ("sched", "sched_process_exec"),
    ("sched", "sched_process_exit"),
];

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to load {path}")]
    Object {
        path: PathBuf,
        #[source]
        source: EbpfError,
    },
    #[error("program {0} not found in the object")]
    MissingProgram(&'static str),
    #[error("program {name}")]
    Program {
        name: &'static str,
        #[source]
        source: ProgramError,
    },
    #[error("map {0} not found in the object")]
    MissingMap(&'static str),
    #[error("map {name}")]
    Map {
        name: &'static str,
        #[source]
        source: MapError,
    },
}

/// A loaded and attached object. Dropping it detaches the probes.
pub struct Tracer {
    // owns the programs and their links
    _ebpf: Ebpf,
    pub events: RingBuf<MapData>,
    pub process_events: RingBuf<MapData>,
    pub stats: KernelStats,
}

pub fn load(config: &RunConfig) -> Result<Tracer, LoadError> {
    bump_memlock_rlimit();

    let offsets = task_offsets(config);
    let mut ebpf = EbpfLoader::new()
        .set_global("MAX_ARGS", &config.max_args, true)
        .set_global("TASK_OFFSETS", &offsets, true)
        .load_file(&config.bpf_object)
        .map_err(|source| LoadError::Object {
            path: config.bpf_object.clone(),
            source,
        })?;
    if let Err(e) = aya_log::EbpfLogger::init(&mut ebpf) {
        // This can happen if you remove all log statements from your eBPF program.
        warn!("failed to initialize eBPF logger: {e}");
    }

    for (category, name) in TRACEPOINTS {
        let program: &mut TracePoint = ebpf
            .program_mut(name)
            .ok_or(LoadError::MissingProgram(name))?
            .try_into()
            .map_err(|source| LoadError::Program { name, source })?;
        program
            .load()
            .map_err(|source| LoadError::Program { name, source })?;
        program
            .attach(category, name)
            .map_err(|source| LoadError::Program { name, source })?;
        info!("Attached tracepoint {category}/{name}");
    }

    let events = RingBuf::try_from(take_map(&mut ebpf, "EVENTS")?)
        .map_err(|source| LoadError::Map { name: "EVENTS", source })?;
    let process_events = RingBuf::try_from(take_map(&mut ebpf, "PROCESS_EVENTS")?).map_err(
        |source| LoadError::Map {
            name: "PROCESS_EVENTS",
            source,
        },
    )?;
    let counts = HashMap::try_from(take_map(&mut ebpf, "PROCESS_STATS")?).map_err(|source| {
        LoadError::Map {
            name: "PROCESS_STATS",
            source,
        }
    })?;
    let drops = PerCpuArray::try_from(take_map(&mut ebpf, "DROPS")?)
        .map_err(|source| LoadError::Map { name: "DROPS", source })?;

    Ok(Tracer {
        _ebpf: ebpf,
        events,
        process_events,
        stats: KernelStats { counts, drops },
    })
}

/// Offsets for the object's `TASK_OFFSETS`. Without them records carry ppid 0 and exit
/// code 0.
fn task_offsets(config: &RunConfig) -> TaskOffsets {
    let offsets = match btf::read_task_offsets(&config.btf) {
        Ok(offsets) => offsets,
        Err(e) => {
            warn!(error = %e, "task_struct layout unavailable");
            return TaskOffsets::UNKNOWN;
        }
    };
    if !offsets.parent_known() || !offsets.exit_code_known() {
        warn!(?offsets, "task_struct fields missing from BTF");
    } else {
        info!(?offsets, "Resolved task_struct offsets");
    }
    offsets
}

fn take_map(ebpf: &mut Ebpf, name: &'static str) -> Result<aya::maps::Map, LoadError> {
    ebpf.take_map(name).ok_or(LoadError::MissingMap(name))
}

/// Bump the memlock rlimit. This is needed for older kernels that don't use the
/// new memcg based accounting, see https://lwn.net/Articles/837122/
fn bump_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("remove limit on locked memory failed, ret is: {ret}");
    }
}

/// `PROCESS_STATS` and `DROPS` of a loaded object.
pub struct KernelStats {
    counts: HashMap<MapData, u32, u64>,
    drops: PerCpuArray<MapData, u64>,
}

impl StatsSource for KernelStats {
    fn process_counts(&self) -> Result<Vec<(u32, u64)>, MapError> {
        let mut counts = self.counts.iter().collect::<Result<Vec<_>, _>>()?;
        counts.sort_unstable();
        Ok(counts)
    }

    fn process_count(&self, pid: u32) -> Result<Option<u64>, MapError> {
        match self.counts.get(&pid, 0) {
            Ok(count) => Ok(Some(count)),
            Err(MapError::KeyNotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn drops(&self) -> Result<DropSnapshot, MapError> {
        let mut totals = [0u64; DropReason::ALL.len()];
        for reason in DropReason::ALL {
            let per_cpu = self.drops.get(&(reason as u32), 0)?;
            totals[reason as usize] = per_cpu.iter().sum();
        }
        Ok(DropSnapshot::from_fn(|reason| totals[reason as usize]))
    }
}
