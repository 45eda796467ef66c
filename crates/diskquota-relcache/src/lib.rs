//! Diskquota Relcache - relation metadata cache
//!
//! One logical table owns several physical storage units: its toast table,
//! indexes, and for append-optimized storage the segment, visimap and
//! block-directory relations. The cache records those linkages plus the
//! relfilenode of relations whose catalog row is not yet visible, so that
//! storage-level events can be folded back onto the owning primary
//! relation.

pub mod cache;

pub use cache::{RelationCache, RelationCacheEntry};
