//! Diskquota Segment - shard-local size service
//!
//! Answers "what is the on-disk size of this relation here" by walking the
//! relation's fork and segment files directly, and implements the
//! two-mode `fetch_table_stat` entry point the coordinator fans out to.

pub mod fetch;
pub mod layout;
pub mod sizer;

pub use fetch::SegmentStatService;
pub use layout::{relation_path, Fork, FORKS};
pub use sizer::RelationSizer;
