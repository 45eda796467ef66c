//! Diskquota Activetable - write-path change detection
//!
//! Storage probes run on every file create/extend/truncate/unlink and must
//! stay cheap: a role check, a monitored-database check, and one bounded
//! map insert under a short exclusive lock. The coordinator drains the
//! accumulated set once per epoch.

pub mod tracker;

pub use tracker::ActiveTableTracker;
