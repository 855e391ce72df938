//! User-space side of execsnoop: the loader for the BPF object, the record decoder and
//! collector, and an in-process rendition of the BPF maps that runs the same probe
//! pipeline without a kernel.

pub mod btf;
pub mod clock;
pub mod collector;
pub mod config;
pub mod decode;
pub mod loader;
pub mod maps;
pub mod memory;
pub mod probes;
pub mod replay;
pub mod server;
pub mod store;
pub mod task;

pub use clock::BootClock;
pub use config::{ConfigError, ProbeConfig, RunConfig};
pub use decode::{DecodeError, ExecRecord, Lifecycle, ProcessRecord, Record, decode};
pub use memory::SyntheticMemory;
pub use probes::Probes;
pub use store::ExecutionStorage;
pub use task::Task;
