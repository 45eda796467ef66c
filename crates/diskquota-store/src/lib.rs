//! Diskquota Store - persistent state backed by redb
//!
//! Stores quota configuration, tablespace-qualified targets, per-shard
//! table sizes, per-database extension state and the monitored database
//! list so the coordinator survives restarts.

pub mod store;
pub mod tables;

pub use store::{QuotaStore, StoreError, StoreResult};
