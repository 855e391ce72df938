use std::{
    fs::File,
    io::{BufReader, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::Arc,
};

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use execsnoop::{
    BootClock, ExecutionStorage, ProbeConfig, Probes, Record, RunConfig,
    btf::VMLINUX_BTF,
    collector::{FORWARD_CAPACITY, RecordSink, drain_kernel, drain_probes, print_forwarded},
    config::{DEFAULT_BPF_OBJECT, DEFAULT_HISTORY, DEFAULT_LISTEN},
    loader,
    replay::{feed, replay},
    server::{AppState, HostStats, start_http_server},
};
use execsnoop_common::DEFAULT_MAX_ARGS;
use tokio::{signal, sync::mpsc};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "execsnoop")]
#[command(version, about = "Trace process executions with eBPF", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load the BPF object, trace the live kernel and serve the HTTP API
    Run(RunArgs),
    /// Run the probes over a recorded trace and print the records as JSON lines
    Replay(ReplayArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Compiled BPF object
    #[arg(long, value_name = "PATH", env = "EXECSNOOP_BPF_PATH", default_value = DEFAULT_BPF_OBJECT)]
    bpf_object: PathBuf,

    /// Kernel BTF used to locate task_struct fields
    #[arg(long, value_name = "PATH", default_value = VMLINUX_BTF)]
    btf: PathBuf,

    /// Arguments captured per execve
    #[arg(long, value_name = "N", default_value_t = DEFAULT_MAX_ARGS)]
    max_args: u32,

    #[arg(long, value_name = "ADDR", default_value = DEFAULT_LISTEN)]
    listen: SocketAddr,

    /// Records kept for the HTTP API
    #[arg(long, value_name = "N", default_value_t = DEFAULT_HISTORY)]
    history: usize,

    /// Also print every record to stdout as a JSON line
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct ReplayArgs {
    /// JSON-lines trace of probe invocations
    #[arg(value_name = "TRACE")]
    trace: PathBuf,

    #[arg(long, value_name = "N", default_value_t = DEFAULT_MAX_ARGS)]
    max_args: u32,

    /// Scratch slots; defaults to the number of CPUs
    #[arg(long, value_name = "N")]
    cpus: Option<usize>,

    /// Pending execve entries
    #[arg(long, value_name = "N")]
    table_capacity: Option<usize>,

    /// Size of the execve ring buffer
    #[arg(long, value_name = "BYTES")]
    ring_bytes: Option<usize>,

    /// Consume the rings while the trace runs and serve the HTTP API on ADDR until Ctrl-C
    #[arg(long, value_name = "ADDR")]
    serve: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Also picks up the `log` records aya-log forwards from the probes.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Replay(args) => match args.serve {
            Some(listen) => serve_replay(args, listen).await,
            None => run_replay(args),
        },
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = RunConfig {
        bpf_object: args.bpf_object,
        btf: args.btf,
        max_args: args.max_args,
        listen: args.listen,
        history: args.history,
    };
    config.validate()?;

    info!("Starting eBPF process execution tracer with HTTP API");

    // Establish boot offset: wall_clock_now - monotonic_now
    let clock = BootClock::now();
    let tracer = loader::load(&config).context("failed to load the BPF object")?;
    info!(max_args = config.max_args, "eBPF programs loaded and attached");

    let storage = ExecutionStorage::new(config.history);
    let mut sink = RecordSink::new(clock).with_storage(storage.clone());
    if args.json {
        sink = sink.with_forward(print_to_stdout());
    }

    // the rest of `tracer` keeps the programs attached until we return
    let rings = [
        ("EVENTS", tracer.events),
        ("PROCESS_EVENTS", tracer.process_events),
    ];
    for (name, ring) in rings {
        let sink = sink.clone();
        tokio::spawn(async move {
            if let Err(e) = drain_kernel(ring, sink).await {
                error!("Error reading {name}: {e}");
            }
        });
    }

    let state = AppState {
        storage,
        stats: Arc::new(tracer.stats),
    };
    let server_handle = start_http_server(config.listen, state).await?;

    info!("Waiting for Ctrl-C...");
    signal::ctrl_c().await?;
    info!("Exiting...");

    server_handle.abort();
    Ok(())
}

fn probe_config(args: &ReplayArgs) -> ProbeConfig {
    let defaults = ProbeConfig::default();
    ProbeConfig {
        max_args: args.max_args,
        cpus: args.cpus.unwrap_or(defaults.cpus),
        exec_table_capacity: args.table_capacity.unwrap_or(defaults.exec_table_capacity),
        events_ring_bytes: args.ring_bytes.unwrap_or(defaults.events_ring_bytes),
        ..defaults
    }
}

fn open_trace(args: &ReplayArgs) -> anyhow::Result<BufReader<File>> {
    let file = File::open(&args.trace)
        .with_context(|| format!("failed to open {}", args.trace.display()))?;
    Ok(BufReader::new(file))
}

/// A bounded channel whose records are printed as JSON lines.
fn print_to_stdout() -> mpsc::Sender<Record> {
    let (tx, rx) = mpsc::channel(FORWARD_CAPACITY);
    tokio::spawn(async move {
        if let Err(e) = print_forwarded(rx, std::io::stdout()).await {
            error!("Error writing records: {e}");
        }
    });
    tx
}

fn run_replay(args: ReplayArgs) -> anyhow::Result<()> {
    let config = probe_config(&args);
    let outcome = replay(open_trace(&args)?, &config)
        .with_context(|| format!("failed to replay {}", args.trace.display()))?;

    let mut stdout = std::io::stdout().lock();
    for record in &outcome.records {
        serde_json::to_writer(&mut stdout, record)?;
        writeln!(stdout)?;
    }

    info!(
        records = outcome.records.len(),
        pending = outcome.pending,
        overwritten = outcome.overwritten,
        drops = ?outcome.drops,
        "Replay finished"
    );
    Ok(())
}

async fn serve_replay(args: ReplayArgs, listen: SocketAddr) -> anyhow::Result<()> {
    let probes = Probes::new(&probe_config(&args))?;
    let storage = ExecutionStorage::new(DEFAULT_HISTORY);
    let sink = RecordSink::new(BootClock::epoch())
        .with_storage(storage.clone())
        .with_forward(print_to_stdout());
    let drains = drain_probes(&probes, &sink);

    let state = AppState {
        storage,
        stats: Arc::new(HostStats::of(&probes)),
    };
    let server_handle = start_http_server(listen, state).await?;

    let steps = feed(open_trace(&args)?, &probes)
        .with_context(|| format!("failed to replay {}", args.trace.display()))?;
    info!(
        steps,
        pending = probes.execs().pending(),
        drops = ?probes.drops().snapshot(),
        "Trace replayed, waiting for Ctrl-C..."
    );
    signal::ctrl_c().await?;
    info!("Exiting...");

    server_handle.abort();
    for drain in drains {
        drain.abort();
    }
    Ok(())
}
