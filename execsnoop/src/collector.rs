use std::{io::Write, sync::Arc};

use aya::maps::{MapData, RingBuf as KernelRingBuf};
use tokio::{
    io::unix::AsyncFd,
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    clock::BootClock,
    decode::{Record, decode},
    maps::RingBuf,
    probes::Probes,
    store::ExecutionStorage,
};

/// Records buffered for a forward subscriber before new ones are lost.
pub const FORWARD_CAPACITY: usize = 1024;

/// Where decoded records go: the log, the history store, and an optional subscriber.
#[derive(Clone)]
pub struct RecordSink {
    clock: BootClock,
    storage: Option<ExecutionStorage>,
    forward: Option<mpsc::Sender<Record>>,
}

impl RecordSink {
    pub fn new(clock: BootClock) -> Self {
        Self {
            clock,
            storage: None,
            forward: None,
        }
    }

    pub fn with_storage(mut self, storage: ExecutionStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Also hand every record to `forward`. A full channel loses the record.
    pub fn with_forward(mut self, forward: mpsc::Sender<Record>) -> Self {
        self.forward = Some(forward);
        self
    }

    pub fn decode(&self, data: &[u8]) -> Option<Record> {
        match decode(data, &self.clock) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(len = data.len(), "skipping malformed record: {e}");
                None
            }
        }
    }

    pub async fn deliver(&self, record: Record) {
        match &record {
            Record::Exec(exec) => info!(
                pid = exec.pid,
                ppid = exec.ppid,
                uid = exec.uid,
                command = %exec.command,
                args = %exec.command_line(),
                retval = exec.retval,
                timestamp = %exec.timestamp,
                "Process execution captured"
            ),
            Record::Process(process) => debug!(
                kind = ?process.kind,
                pid = process.pid,
                ppid = process.ppid,
                comm = %process.comm,
                "Process lifecycle event"
            ),
        }

        if let Some(forward) = &self.forward {
            match forward.try_send(record.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(record)) => {
                    debug!(pid = record.pid(), "subscriber full, record dropped");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }

        if let Some(storage) = &self.storage {
            storage.add(record).await;
        }
    }
}

/// Drains an in-process ring until the task is cancelled.
pub async fn drain_host(ring: Arc<RingBuf>, sink: RecordSink) {
    loop {
        ring.readable().await;
        loop {
            // the item must be released before awaiting the store
            let Some(record) = ring.next().map(|item| sink.decode(&item)) else {
                break;
            };
            if let Some(record) = record {
                sink.deliver(record).await;
            }
        }
    }
}

/// Drains both rings of `probes` until the returned tasks are aborted.
pub fn drain_probes(probes: &Probes, sink: &RecordSink) -> [JoinHandle<()>; 2] {
    [probes.events(), probes.process_events()]
        .map(|ring| tokio::spawn(drain_host(Arc::clone(ring), sink.clone())))
}

/// Writes each forwarded record to `out` as a JSON line, until every sender is gone.
pub async fn print_forwarded<W: Write>(
    mut records: mpsc::Receiver<Record>,
    mut out: W,
) -> std::io::Result<()> {
    while let Some(record) = records.recv().await {
        serde_json::to_writer(&mut out, &record)?;
        writeln!(out)?;
        out.flush()?;
    }
    Ok(())
}

/// Drains a kernel ring buffer, waking on its epoll readiness.
pub async fn drain_kernel(ring: KernelRingBuf<MapData>, sink: RecordSink) -> std::io::Result<()> {
    let mut poll = AsyncFd::new(ring)?;
    loop {
        let mut guard = poll.readable_mut().await?;
        let mut records = Vec::new();
        {
            let ring = guard.get_inner_mut();
            while let Some(item) = ring.next() {
                records.extend(sink.decode(&item));
            }
        }
        guard.clear_ready();
        drop(guard);

        for record in records {
            sink.deliver(record).await;
        }
    }
}
