//! Diskquota Shmem - process-shared state primitives
//!
//! The original engine keeps its hot state in fixed-capacity hash tables
//! inside a node-wide shared memory region, one reader/writer lock per
//! table. Here every process on a node shares one `Arc` of each structure;
//! each map keeps its own `parking_lot` lock and a hard capacity so
//! overflow behavior stays explicit.

pub mod flags;
pub mod mailbox;
pub mod map;

pub use flags::{MonitoredDbSet, PausedFlags};
pub use mailbox::{DdlEnvelope, DdlMailbox};
pub use map::{CapacityExceeded, SharedMap};
