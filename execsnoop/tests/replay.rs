use std::{
    fs::File,
    io::{BufReader, Write},
    process::Command,
};

use execsnoop::{
    BootClock, ExecutionStorage, ProbeConfig, Probes, Record,
    collector::{FORWARD_CAPACITY, RecordSink, drain_probes, print_forwarded},
    maps::record_len,
    replay::{ReplayError, feed, replay},
    server::{HostStats, StatsSource},
};
use execsnoop_common::EXEC_EVENT_SIZE;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;

const LS_TRACE: &str = r#"{"op":"fork","pid":100,"ppid":1,"comm":"bash"}
{"op":"enter_execve","cpu":1,"pid":100,"ppid":1,"uid":0,"argv":["/bin/ls","-l"]}
{"op":"exec","cpu":1,"pid":100,"ppid":1,"comm":"ls"}
{"op":"exit_execve","cpu":1,"pid":100,"ppid":1,"comm":"ls","ret":0}
{"op":"exit","cpu":1,"pid":100,"ppid":1,"comm":"ls","exit_code":0}
"#;

fn trace_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn config() -> ProbeConfig {
    ProbeConfig {
        cpus: 2,
        ..ProbeConfig::default()
    }
}

#[test]
fn replays_a_shell_running_ls() {
    let file = trace_file(LS_TRACE);
    let outcome = replay(BufReader::new(File::open(file.path()).unwrap()), &config()).unwrap();

    let Record::Exec(exec) = &outcome.records[0] else {
        panic!("expected the execve record first");
    };
    assert_eq!(exec.pid, 100);
    assert_eq!(exec.ppid, 1);
    assert_eq!(exec.uid, 0);
    assert_eq!(exec.comm, "ls");
    assert_eq!(exec.retval, 0);
    assert_eq!(exec.args, vec!["/bin/ls", "-l"]);

    let kinds: Vec<_> = outcome.records[1..]
        .iter()
        .map(|record| match record {
            Record::Process(process) => (process.kind, process.comm.clone()),
            Record::Exec(_) => panic!("one execve record only"),
        })
        .map(|(kind, comm)| (serde_json::to_value(kind).unwrap(), comm))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (serde_json::json!("fork"), "bash".to_owned()),
            (serde_json::json!("exec"), "ls".to_owned()),
            (serde_json::json!("exit"), "ls".to_owned()),
        ]
    );
    assert_eq!(outcome.pending, 0);
}

#[test]
fn a_stalled_consumer_loses_events_to_a_full_ring() {
    let mut trace = String::new();
    for pid in 1..=3 {
        trace.push_str(&format!(
            "{{\"op\":\"enter_execve\",\"pid\":{pid},\"argv\":[\"/bin/true\"]}}\n\
             {{\"op\":\"exit_execve\",\"pid\":{pid}}}\n"
        ));
    }
    let file = trace_file(&trace);
    let config = ProbeConfig {
        events_ring_bytes: 2 * record_len(EXEC_EVENT_SIZE),
        ..config()
    };

    let outcome = replay(BufReader::new(File::open(file.path()).unwrap()), &config).unwrap();
    let pids: Vec<_> = outcome.records.iter().map(Record::pid).collect();
    assert_eq!(pids, vec![1, 2]);
    assert_eq!(outcome.drops.ring_full, 1);
    assert_eq!(outcome.pending, 0);
}

#[test]
fn dangling_enters_stay_pending() {
    let file = trace_file(
        "{\"op\":\"enter_execve\",\"pid\":7,\"argv\":[\"a\"]}\n\
         {\"op\":\"enter_execve\",\"pid\":7,\"argv\":[\"b\"]}\n",
    );
    let outcome = replay(BufReader::new(File::open(file.path()).unwrap()), &config()).unwrap();
    assert!(outcome.records.is_empty());
    assert_eq!(outcome.pending, 1);
    assert_eq!(outcome.overwritten, 1);
}

#[test]
fn malformed_line_is_reported() {
    let file = trace_file("{\"op\":\"fork\",\"pid\":1}\nnot json\n");
    let err = replay(BufReader::new(File::open(file.path()).unwrap()), &config()).unwrap_err();
    assert!(matches!(err, ReplayError::Parse { line: 2, .. }));
}

#[test]
fn cli_prints_one_json_line_per_record() {
    let file = trace_file(LS_TRACE);
    let output = Command::new(env!("CARGO_BIN_EXE_execsnoop"))
        .args(["replay", "--cpus", "2"])
        .arg(file.path())
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");

    let stdout = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<serde_json::Value> = stdout
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(lines[0]["type"], "exec");
    assert_eq!(lines[0]["command"], "ls");
    assert_eq!(lines[0]["args"], serde_json::json!(["/bin/ls", "-l"]));
    assert_eq!(lines[3]["kind"], "exit");
    assert_eq!(lines[3]["exit_code"], 0);
}

#[test]
fn cli_rejects_max_args_above_the_bound() {
    let file = trace_file(LS_TRACE);
    let output = Command::new(env!("CARGO_BIN_EXE_execsnoop"))
        .args(["replay", "--max-args", "61"])
        .arg(file.path())
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn live_replay_feeds_the_store_the_subscriber_and_the_stats() {
    let probes = Probes::new(&config()).unwrap();
    let storage = ExecutionStorage::new(16);
    let (tx, rx) = mpsc::channel(FORWARD_CAPACITY);
    let sink = RecordSink::new(BootClock::epoch())
        .with_storage(storage.clone())
        .with_forward(tx);
    let drains = drain_probes(&probes, &sink);
    drop(sink);

    assert_eq!(feed(LS_TRACE.as_bytes(), &probes).unwrap(), 5);
    for _ in 0..100_000 {
        if storage.executions().await.len() == 1 && storage.processes().await.len() == 3 {
            break;
        }
        tokio::task::yield_now().await;
    }
    for drain in drains {
        drain.abort();
        let _ = drain.await;
    }

    let executions = storage.executions_by_pid(100);
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].args, vec!["/bin/ls", "-l"]);
    assert_eq!(storage.processes().await.len(), 3);

    let mut out = Vec::new();
    print_forwarded(rx, &mut out).await.unwrap();
    assert_eq!(String::from_utf8(out).unwrap().lines().count(), 4);

    let stats = HostStats::of(&probes);
    assert_eq!(stats.process_count(100).unwrap(), Some(3));
    assert_eq!(stats.drops().unwrap(), Default::default());
    assert_eq!(stats.table().map(|table| table.pending), Some(0));
    assert_eq!(probes.events().used(), 0);
}

#[test]
fn cli_rejects_an_unusable_serve_address() {
    let file = trace_file(LS_TRACE);
    let output = Command::new(env!("CARGO_BIN_EXE_execsnoop"))
        .args(["replay", "--serve", "not-an-address"])
        .arg(file.path())
        .output()
        .unwrap();
    assert!(!output.status.success());
}
