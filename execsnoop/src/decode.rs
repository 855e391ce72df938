//! Turns raw ring buffer records into owned, serializable values.

use chrono::{DateTime, Utc};
use execsnoop_common::{ARGS_CAPACITY, EventHeader, EventKind, HEADER_SIZE};
use serde::Serialize;
use thiserror::Error;

use crate::clock::BootClock;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record of {0} bytes is shorter than the {header}-byte header", header = HEADER_SIZE)]
    Truncated(usize),
    #[error("unknown record kind {0}")]
    UnknownKind(u32),
    #[error("args_size {size} exceeds the {available} trailer bytes present")]
    ArgsOverflow { size: u32, available: usize },
}

/// A correlated execve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecRecord {
    pub pid: u32,
    pub ppid: u32,
    pub uid: u32,
    pub gid: u32,
    /// Task name after the exec.
    pub comm: String,
    /// Basename of `argv[0]`, `comm` when that says nothing.
    pub command: String,
    pub args: Vec<String>,
    pub retval: i32,
    pub timestamp_ns: u64,
    pub timestamp: DateTime<Utc>,
}

impl ExecRecord {
    /// Arguments joined by spaces.
    pub fn command_line(&self) -> String {
        self.args.join(" ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Fork,
    Exec,
    Exit,
}

/// A fork, exec or exit of one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessRecord {
    pub kind: Lifecycle,
    pub pid: u32,
    pub ppid: u32,
    pub uid: u32,
    pub gid: u32,
    pub comm: String,
    /// Only set for exits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub timestamp_ns: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    Exec(ExecRecord),
    Process(ProcessRecord),
}

impl Record {
    pub fn pid(&self) -> u32 {
        match self {
            Record::Exec(exec) => exec.pid,
            Record::Process(process) => process.pid,
        }
    }
}

/// Decodes one record as it was published by a probe.
///
/// Only the first `args_size` trailer bytes are looked at, and of the strings found there
/// only the first `args_count`.
pub fn decode(data: &[u8], clock: &BootClock) -> Result<Record, DecodeError> {
    if data.len() < HEADER_SIZE {
        return Err(DecodeError::Truncated(data.len()));
    }
    let header: EventHeader = bytemuck::pod_read_unaligned(&data[..HEADER_SIZE]);
    let kind = header.kind().ok_or(DecodeError::UnknownKind(header.kind))?;
    let comm = comm_str(&header.comm);
    let timestamp = clock.wall(header.timestamp_ns);

    let lifecycle = match kind {
        EventKind::Fork => Lifecycle::Fork,
        EventKind::Exec => Lifecycle::Exec,
        EventKind::Exit => Lifecycle::Exit,
        EventKind::Execve => {
            let trailer = &data[HEADER_SIZE..];
            let size = header.args_size as usize;
            if size > trailer.len().min(ARGS_CAPACITY) {
                return Err(DecodeError::ArgsOverflow {
                    size: header.args_size,
                    available: trailer.len().min(ARGS_CAPACITY),
                });
            }
            let args = split_args(&trailer[..size], header.args_count as usize);
            let command = command_name(args.first().map(String::as_str), &comm);
            return Ok(Record::Exec(ExecRecord {
                pid: header.pid,
                ppid: header.ppid,
                uid: header.uid,
                gid: header.gid,
                comm,
                command,
                args,
                retval: header.retval,
                timestamp_ns: header.timestamp_ns,
                timestamp,
            }));
        }
    };

    Ok(Record::Process(ProcessRecord {
        kind: lifecycle,
        pid: header.pid,
        ppid: header.ppid,
        uid: header.uid,
        gid: header.gid,
        comm,
        exit_code: (lifecycle == Lifecycle::Exit).then_some(header.retval),
        timestamp_ns: header.timestamp_ns,
        timestamp,
    }))
}

/// `comm` up to its first NUL.
pub fn comm_str(comm: &[u8]) -> String {
    let end = comm.iter().position(|&b| b == 0).unwrap_or(comm.len());
    String::from_utf8_lossy(&comm[..end]).into_owned()
}

/// Splits NUL-terminated strings, keeping empty ones, at most `count` of them.
///
/// A final string missing its terminator is still returned.
pub fn split_args(trailer: &[u8], count: usize) -> Vec<String> {
    if trailer.is_empty() {
        return Vec::new();
    }
    let trailer = trailer.strip_suffix(&[0]).unwrap_or(trailer);
    trailer
        .split(|&b| b == 0)
        .take(count)
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect()
}

fn command_name(argv0: Option<&str>, comm: &str) -> String {
    let base = argv0
        .map(|arg| arg.trim_end_matches('/'))
        .and_then(|arg| arg.rsplit('/').next())
        .unwrap_or_default();
    if base.is_empty() || base == "." {
        comm.to_owned()
    } else {
        base.to_owned()
    }
}
