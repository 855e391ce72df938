use chrono::{DateTime, Duration, Utc};

/// Nanoseconds on `CLOCK_MONOTONIC`, the clock `bpf_ktime_get_ns` reads.
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC is always available on Linux; on failure ts stays zero.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

/// Maps probe timestamps (monotonic, since boot) to wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootClock {
    boot_offset: Duration,
}

impl BootClock {
    /// Captures `wall_now - monotonic_now` once.
    pub fn now() -> Self {
        let wall = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let mono = monotonic_ns() as i64;
        Self::from_offset(Duration::nanoseconds(wall - mono))
    }

    pub fn from_offset(boot_offset: Duration) -> Self {
        Self { boot_offset }
    }

    /// A clock whose boot happened at the Unix epoch.
    pub fn epoch() -> Self {
        Self::from_offset(Duration::zero())
    }

    pub fn wall(&self, monotonic_ns: u64) -> DateTime<Utc> {
        let at = self.boot_offset + Duration::nanoseconds(monotonic_ns as i64);
        DateTime::from_timestamp_nanos(at.num_nanoseconds().unwrap_or(i64::MAX))
    }
}
