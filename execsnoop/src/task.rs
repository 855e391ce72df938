use execsnoop_common::{TASK_COMM_LEN, pipeline::TaskInfo};

/// `-EFAULT`
pub(crate) const EFAULT: i64 = -14;

/// Snapshot of the task a probe invocation runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub pid: u32,
    pub tid: u32,
    pub ppid: u32,
    pub uid: u32,
    pub gid: u32,
    /// `None` when the name cannot be read.
    pub comm: Option<[u8; TASK_COMM_LEN]>,
    pub cpu: u32,
    pub ktime_ns: u64,
    pub exit_code: i32,
}

impl Task {
    /// Main thread of `pid` on CPU 0, everything else zero.
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            tid: pid,
            ppid: 0,
            uid: 0,
            gid: 0,
            comm: Some([0u8; TASK_COMM_LEN]),
            cpu: 0,
            ktime_ns: 0,
            exit_code: 0,
        }
    }

    pub fn parent(mut self, ppid: u32) -> Self {
        self.ppid = ppid;
        self
    }

    pub fn uid(mut self, uid: u32) -> Self {
        self.uid = uid;
        self
    }

    pub fn gid(mut self, gid: u32) -> Self {
        self.gid = gid;
        self
    }

    /// Sets the name, truncated the way the kernel truncates `comm`.
    pub fn named(mut self, name: &str) -> Self {
        self.comm = Some(comm_bytes(name));
        self
    }

    pub fn on_cpu(mut self, cpu: u32) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn at(mut self, ktime_ns: u64) -> Self {
        self.ktime_ns = ktime_ns;
        self
    }

    pub fn exited(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }
}

/// NUL-padded, at most 15 bytes of name.
pub fn comm_bytes(name: &str) -> [u8; TASK_COMM_LEN] {
    let mut comm = [0u8; TASK_COMM_LEN];
    let len = name.len().min(TASK_COMM_LEN - 1);
    comm[..len].copy_from_slice(&name.as_bytes()[..len]);
    comm
}

impl TaskInfo for Task {
    fn pid_tgid(&self) -> u64 {
        ((self.pid as u64) << 32) | self.tid as u64
    }

    fn uid_gid(&self) -> u64 {
        ((self.gid as u64) << 32) | self.uid as u64
    }

    fn parent_tgid(&self) -> u32 {
        self.ppid
    }

    fn comm(&self) -> Result<[u8; TASK_COMM_LEN], i64> {
        self.comm.ok_or(EFAULT)
    }

    fn ktime_ns(&self) -> u64 {
        self.ktime_ns
    }

    fn cpu(&self) -> u32 {
        self.cpu
    }

    fn exit_code(&self) -> i32 {
        self.exit_code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_pack_like_the_bpf_helpers() {
        let task = Task::new(100).uid(1000).gid(50);
        assert_eq!(task.tgid(), 100);
        assert_eq!(task.uid_gid() as u32, 1000);
        assert_eq!((task.uid_gid() >> 32) as u32, 50);
    }

    #[test]
    fn long_names_are_truncated() {
        let comm = comm_bytes("a-very-long-process-name");
        assert_eq!(&comm[..15], b"a-very-long-pro");
        assert_eq!(comm[15], 0);
    }
}
