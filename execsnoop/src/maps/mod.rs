//! In-process stand-ins for the BPF maps, driving the same probe pipeline.

mod exec_table;
mod ring_buf;
mod scratch;
mod stats;

pub use exec_table::ExecTable;
pub use ring_buf::{RingBuf, RingBufEntry, RingBufItem, record_len};
pub use scratch::{ScratchPool, ScratchSlot};
pub use stats::{DropCounters, DropSnapshot, ProcessStats};
