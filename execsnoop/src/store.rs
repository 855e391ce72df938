use std::{collections::VecDeque, sync::Arc};

use dashmap::DashMap;
use tokio::sync::RwLock;

use crate::decode::{ExecRecord, ProcessRecord, Record};

/// Recent records kept for the HTTP API.
///
/// Executions and lifecycle records each keep the newest `history` entries, oldest
/// evicted first. Executions are also indexed by pid.
#[derive(Clone)]
pub struct ExecutionStorage {
    history: usize,
    executions: Arc<RwLock<VecDeque<ExecRecord>>>,
    pid_executions: Arc<DashMap<u32, VecDeque<ExecRecord>>>,
    processes: Arc<RwLock<VecDeque<ProcessRecord>>>,
}

impl ExecutionStorage {
    pub fn new(history: usize) -> Self {
        Self {
            history,
            executions: Arc::new(RwLock::new(VecDeque::with_capacity(history))),
            pid_executions: Arc::new(DashMap::new()),
            processes: Arc::new(RwLock::new(VecDeque::with_capacity(history))),
        }
    }

    pub async fn add(&self, record: Record) {
        match record {
            Record::Exec(exec) => self.add_execution(exec).await,
            Record::Process(process) => self.add_process(process).await,
        }
    }

    pub async fn add_execution(&self, execution: ExecRecord) {
        let mut executions = self.executions.write().await;

        if executions.len() >= self.history {
            if let Some(removed) = executions.pop_front() {
                // per-pid lists are in arrival order, so the evicted one is at the front
                if let Some(mut pid_vec) = self.pid_executions.get_mut(&removed.pid) {
                    pid_vec.pop_front();
                    if pid_vec.is_empty() {
                        drop(pid_vec);
                        self.pid_executions.remove(&removed.pid);
                    }
                }
            }
        }

        self.pid_executions
            .entry(execution.pid)
            .or_default()
            .push_back(execution.clone());
        executions.push_back(execution);
    }

    pub async fn add_process(&self, process: ProcessRecord) {
        let mut processes = self.processes.write().await;
        if processes.len() >= self.history {
            processes.pop_front();
        }
        processes.push_back(process);
    }

    pub async fn executions(&self) -> Vec<ExecRecord> {
        self.executions.read().await.iter().cloned().collect()
    }

    pub fn executions_by_pid(&self, pid: u32) -> Vec<ExecRecord> {
        self.pid_executions
            .get(&pid)
            .map(|executions| executions.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn processes(&self) -> Vec<ProcessRecord> {
        self.processes.read().await.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;
    use crate::decode::Lifecycle;

    fn exec(pid: u32, arg: &str) -> ExecRecord {
        ExecRecord {
            pid,
            ppid: 1,
            uid: 0,
            gid: 0,
            comm: "sh".into(),
            command: arg.into(),
            args: vec![arg.into()],
            retval: 0,
            timestamp_ns: 0,
            timestamp: DateTime::UNIX_EPOCH,
        }
    }

    fn exit(pid: u32) -> ProcessRecord {
        ProcessRecord {
            kind: Lifecycle::Exit,
            pid,
            ppid: 1,
            uid: 0,
            gid: 0,
            comm: "sh".into(),
            exit_code: Some(0),
            timestamp_ns: 0,
            timestamp: DateTime::UNIX_EPOCH,
        }
    }

    #[tokio::test]
    async fn keeps_the_newest_executions() {
        let storage = ExecutionStorage::new(2);
        storage.add_execution(exec(1, "a")).await;
        storage.add_execution(exec(2, "b")).await;
        storage.add_execution(exec(1, "c")).await;

        let args: Vec<_> = storage
            .executions()
            .await
            .into_iter()
            .map(|e| e.command)
            .collect();
        assert_eq!(args, vec!["b", "c"]);

        let pid1: Vec<_> = storage
            .executions_by_pid(1)
            .into_iter()
            .map(|e| e.command)
            .collect();
        assert_eq!(pid1, vec!["c"]);
    }

    #[tokio::test]
    async fn evicted_pid_disappears_from_index() {
        let storage = ExecutionStorage::new(1);
        storage.add_execution(exec(1, "a")).await;
        storage.add_execution(exec(2, "b")).await;
        assert!(storage.executions_by_pid(1).is_empty());
        assert_eq!(storage.executions_by_pid(2).len(), 1);
    }

    #[tokio::test]
    async fn lifecycle_history_is_bounded() {
        let storage = ExecutionStorage::new(2);
        for pid in 1..=3 {
            storage.add(Record::Process(exit(pid))).await;
        }
        let pids: Vec<_> = storage.processes().await.iter().map(|p| p.pid).collect();
        assert_eq!(pids, vec![2, 3]);
        assert!(storage.executions().await.is_empty());
    }
}
