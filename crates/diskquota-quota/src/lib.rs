//! Diskquota Quota - the quota model engine
//!
//! The worker-local model rolls per-shard relation sizes up into the four
//! per-target totals and decides which targets are over their limit; the
//! shared blocklist carries those decisions to the write-path gate on
//! every node.

pub mod blocklist;
pub mod model;

pub use blocklist::{BlockEntry, BlockKey, Blocklist, LocalBlockEntry};
pub use model::{FlushBatch, QuotaLimit, QuotaModel, TableSizeRow};
