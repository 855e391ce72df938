use std::{net::SocketAddr, path::PathBuf};

use execsnoop_common::{DEFAULT_MAX_ARGS, EXEC_EVENT_SIZE, HEADER_SIZE, MAX_ARGS};
use thiserror::Error;

use crate::maps::record_len;

pub const DEFAULT_BPF_OBJECT: &str = "/usr/local/lib/execsnoop/execsnoop.bpf.o";
pub const DEFAULT_LISTEN: &str = "0.0.0.0:3000";
pub const DEFAULT_HISTORY: usize = 500;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_args {0} exceeds the static bound of {max}", max = MAX_ARGS)]
    MaxArgs(u32),
    #[error("{name} must be non-zero")]
    Zero { name: &'static str },
    #[error("{name} of {size} bytes cannot hold a single {record}-byte record")]
    RingTooSmall {
        name: &'static str,
        size: usize,
        record: usize,
    },
}

/// Sizing of the in-process maps, mirroring the BPF object's map definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Arguments captured per execve, at most [`MAX_ARGS`].
    pub max_args: u32,
    /// Scratch slots, one per execution unit.
    pub cpus: usize,
    pub exec_table_capacity: usize,
    pub events_ring_bytes: usize,
    pub process_ring_bytes: usize,
    pub stats_capacity: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_args: DEFAULT_MAX_ARGS,
            cpus: std::thread::available_parallelism().map_or(1, |n| n.get()),
            exec_table_capacity: 10240,
            events_ring_bytes: 1 << 24,
            process_ring_bytes: 256 * 1024,
            stats_capacity: 1024,
        }
    }
}

impl ProbeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_max_args(self.max_args)?;
        for (name, value) in [
            ("cpus", self.cpus),
            ("exec_table_capacity", self.exec_table_capacity),
            ("stats_capacity", self.stats_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { name });
            }
        }
        ring_fits("events_ring_bytes", self.events_ring_bytes, EXEC_EVENT_SIZE)?;
        ring_fits("process_ring_bytes", self.process_ring_bytes, HEADER_SIZE)?;
        Ok(())
    }
}

pub fn validate_max_args(max_args: u32) -> Result<(), ConfigError> {
    if max_args as usize > MAX_ARGS {
        return Err(ConfigError::MaxArgs(max_args));
    }
    Ok(())
}

fn ring_fits(name: &'static str, size: usize, record: usize) -> Result<(), ConfigError> {
    if size < record_len(record) {
        return Err(ConfigError::RingTooSmall { name, size, record });
    }
    Ok(())
}

/// Settings for tracing the live kernel.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub bpf_object: PathBuf,
    /// Kernel type information, searched for `task_struct` field offsets.
    pub btf: PathBuf,
    pub max_args: u32,
    pub listen: SocketAddr,
    /// Executions and lifecycle records kept for the HTTP API.
    pub history: usize,
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_max_args(self.max_args)?;
        if self.history == 0 {
            return Err(ConfigError::Zero { name: "history" });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert_eq!(ProbeConfig::default().validate(), Ok(()));
    }

    #[test]
    fn max_args_above_bound_is_rejected() {
        let config = ProbeConfig {
            max_args: MAX_ARGS as u32 + 1,
            ..ProbeConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::MaxArgs(MAX_ARGS as u32 + 1)));
        assert!(validate_max_args(MAX_ARGS as u32).is_ok());
    }

    #[test]
    fn ring_must_hold_one_record() {
        let config = ProbeConfig {
            events_ring_bytes: EXEC_EVENT_SIZE,
            ..ProbeConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RingTooSmall { name: "events_ring_bytes", .. })
        ));
    }

    #[test]
    fn zero_capacities_are_rejected() {
        let config = ProbeConfig {
            cpus: 0,
            ..ProbeConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero { name: "cpus" }));
    }
}
