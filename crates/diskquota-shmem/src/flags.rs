//! Per-database control flags shared by probes, workers and the gate.

use diskquota_common::{Error, Oid, Result};
use parking_lot::RwLock;
use std::collections::HashSet;

/// Databases whose enforcement is paused. While a database is paused the
/// worker keeps refreshing the blocklist but the write gate allows
/// everything.
#[derive(Default)]
pub struct PausedFlags {
    paused: RwLock<HashSet<Oid>>,
}

impl PausedFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_paused(&self, db: Oid, paused: bool) {
        let mut set = self.paused.write();
        if paused {
            set.insert(db);
        } else {
            set.remove(&db);
        }
    }

    pub fn is_paused(&self, db: Oid) -> bool {
        self.paused.read().contains(&db)
    }
}

/// Bounded set of databases under monitoring. Probes short-circuit for any
/// database not present here, so membership checks sit on the write path.
pub struct MonitoredDbSet {
    dbs: RwLock<HashSet<Oid>>,
    capacity: usize,
}

impl MonitoredDbSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            dbs: RwLock::new(HashSet::new()),
            capacity,
        }
    }

    pub fn add(&self, db: Oid) -> Result<()> {
        let mut dbs = self.dbs.write();
        if dbs.contains(&db) {
            return Ok(());
        }
        if dbs.len() >= self.capacity {
            return Err(Error::TooManyDatabases);
        }
        dbs.insert(db);
        Ok(())
    }

    pub fn remove(&self, db: Oid) -> bool {
        self.dbs.write().remove(&db)
    }

    pub fn contains(&self, db: Oid) -> bool {
        self.dbs.read().contains(&db)
    }

    pub fn len(&self) -> usize {
        self.dbs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.dbs.read().is_empty()
    }

    pub fn list(&self) -> Vec<Oid> {
        let mut dbs: Vec<Oid> = self.dbs.read().iter().copied().collect();
        dbs.sort_unstable();
        dbs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paused_is_per_database() {
        let flags = PausedFlags::new();
        flags.set_paused(5, true);
        assert!(flags.is_paused(5));
        assert!(!flags.is_paused(6));
        flags.set_paused(5, false);
        assert!(!flags.is_paused(5));
    }

    #[test]
    fn monitored_set_enforces_capacity() {
        let set = MonitoredDbSet::new(2);
        set.add(1).unwrap();
        set.add(2).unwrap();
        // re-adding an existing member never fails
        set.add(1).unwrap();
        assert!(matches!(set.add(3), Err(Error::TooManyDatabases)));
        assert!(set.remove(1));
        set.add(3).unwrap();
        assert_eq!(set.list(), vec![2, 3]);
    }
}
