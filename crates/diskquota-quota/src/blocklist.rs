//! Shared blocklist and the write-path enforcement gate.

use diskquota_catalog::Catalog;
use diskquota_common::{
    Error, ExceededQuota, Oid, QuotaType, Result, INVALID_OID, QUOTA_TYPES,
};
use diskquota_shmem::{PausedFlags, SharedMap};
use std::collections::HashMap;
use tracing::warn;

/// Cluster-wide ceiling on blocklist entries.
pub const MAX_BLOCK_ENTRIES: usize = 1024 * 1024;

/// Identity of one blocked quota target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub target_oid: Oid,
    pub db: Oid,
    /// `INVALID_OID` for the plain schema/role quota types.
    pub tablespace: Oid,
    pub quota_type: QuotaType,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockEntry {
    pub seg_exceeded: bool,
}

/// Worker-local staging entry. The evaluator raises `exceeded` each epoch a
/// target is over; the flush pass copies raised entries into the shared map
/// and retires the rest.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalBlockEntry {
    pub exceeded: bool,
    pub seg_exceeded: bool,
}

/// The shared map consulted by every write attempt.
pub struct Blocklist {
    map: SharedMap<BlockKey, BlockEntry>,
}

impl Default for Blocklist {
    fn default() -> Self {
        Self::new()
    }
}

impl Blocklist {
    pub fn new() -> Self {
        Self {
            map: SharedMap::new("blocklist", MAX_BLOCK_ENTRIES),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, key: &BlockKey) -> bool {
        self.map.contains(key)
    }

    /// Fold the worker's local decisions into the shared map: raised
    /// entries are published, quiet entries are retired from both maps.
    pub fn flush_local(&self, local: &mut HashMap<BlockKey, LocalBlockEntry>) {
        let mut retired = Vec::new();
        for (key, entry) in local.iter_mut() {
            if entry.exceeded {
                let published = BlockEntry {
                    seg_exceeded: entry.seg_exceeded,
                };
                if self.map.insert(*key, published).is_err() {
                    warn!(
                        target_oid = key.target_oid,
                        "shared blocklist is full, an out-of-quota target will not be enforced"
                    );
                }
                entry.exceeded = false;
                entry.seg_exceeded = false;
            } else {
                self.map.remove(key);
                retired.push(*key);
            }
        }
        for key in retired {
            local.remove(&key);
        }
    }

    /// Current entries of one database, for propagation to segments.
    pub fn rows_for_db(&self, db: Oid) -> Vec<(BlockKey, BlockEntry)> {
        self.map
            .snapshot()
            .into_iter()
            .filter(|(key, _)| key.db == db)
            .collect()
    }

    /// Replace one database's entries wholesale (segment side of the
    /// per-epoch propagation).
    pub fn replace_db(&self, db: Oid, rows: Vec<(BlockKey, BlockEntry)>) {
        let stale: Vec<BlockKey> = self
            .map
            .snapshot()
            .into_iter()
            .filter(|(key, _)| key.db == db)
            .map(|(key, _)| key)
            .collect();
        self.map.apply(rows, stale);
    }

    /// Drop every entry of one database (drop-extension path).
    pub fn invalidate_db(&self, db: Oid) {
        self.map.take_matching(|key, _| key.db == db);
    }

    /// The enforcement gate: decide whether a write to `relid` may proceed.
    ///
    /// Internal lookup failures allow the write; the only error this
    /// returns is a quota violation.
    pub fn check_relation(
        &self,
        relid: Oid,
        db: Oid,
        catalog: &dyn Catalog,
        paused: &PausedFlags,
    ) -> Result<()> {
        let Some(meta) = catalog.relation(relid) else {
            return Ok(());
        };
        if paused.is_paused(db) {
            return Ok(());
        }

        for quota_type in QUOTA_TYPES {
            let target_oid = if quota_type.targets_role() {
                meta.owner
            } else {
                meta.namespace
            };
            let tablespace = if quota_type.is_tablespace_qualified() {
                meta.tablespace
            } else {
                INVALID_OID
            };
            let key = BlockKey {
                target_oid,
                db,
                tablespace,
                quota_type,
            };
            if let Some(entry) = self.map.get(&key) {
                return Err(Error::QuotaExceeded(self.describe(
                    &key,
                    entry.seg_exceeded,
                    catalog,
                )));
            }
        }
        Ok(())
    }

    fn describe(&self, key: &BlockKey, seg_exceeded: bool, catalog: &dyn Catalog) -> ExceededQuota {
        let target_name = if key.quota_type.targets_role() {
            catalog.role_name(key.target_oid)
        } else {
            catalog.namespace_name(key.target_oid)
        }
        .unwrap_or_else(|| key.target_oid.to_string());
        let tablespace_name = if key.quota_type.is_tablespace_qualified() {
            Some(
                catalog
                    .tablespace_name(key.tablespace)
                    .unwrap_or_else(|| key.tablespace.to_string()),
            )
        } else {
            None
        };
        ExceededQuota {
            quota_type: key.quota_type,
            target_name,
            tablespace_name,
            seg_exceeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskquota_catalog::{MemoryCatalog, StorageEventHub, TableSpec};
    use std::sync::Arc;

    fn fixture() -> (Arc<MemoryCatalog>, Blocklist, PausedFlags, Oid, Oid, Oid, Oid, Oid) {
        let cat = Arc::new(MemoryCatalog::new(Arc::new(StorageEventHub::new())));
        let db = cat.define_database("db");
        let ns = cat.define_namespace("s");
        let role = cat.define_role("r");
        let spc = cat.define_tablespace("fast");
        let t = cat.create_table(TableSpec::heap(db, "t", ns, role, spc));
        (cat, Blocklist::new(), PausedFlags::new(), db, ns, role, spc, t)
    }

    fn raise(local: &mut HashMap<BlockKey, LocalBlockEntry>, key: BlockKey, seg: bool) {
        local.insert(
            key,
            LocalBlockEntry {
                exceeded: true,
                seg_exceeded: seg,
            },
        );
    }

    #[test]
    fn schema_block_rejects_writes() {
        let (cat, blocklist, paused, db, ns, _role, _spc, t) = fixture();
        let key = BlockKey {
            target_oid: ns,
            db,
            tablespace: INVALID_OID,
            quota_type: QuotaType::Schema,
        };
        let mut local = HashMap::new();
        raise(&mut local, key, false);
        blocklist.flush_local(&mut local);

        let err = blocklist
            .check_relation(t, db, cat.as_ref(), &paused)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "schema's disk space quota exceeded with name: s"
        );
    }

    #[test]
    fn pause_short_circuits_enforcement() {
        let (cat, blocklist, paused, db, ns, _role, _spc, t) = fixture();
        let key = BlockKey {
            target_oid: ns,
            db,
            tablespace: INVALID_OID,
            quota_type: QuotaType::Schema,
        };
        let mut local = HashMap::new();
        raise(&mut local, key, false);
        blocklist.flush_local(&mut local);

        paused.set_paused(db, true);
        assert!(blocklist.check_relation(t, db, cat.as_ref(), &paused).is_ok());
        paused.set_paused(db, false);
        assert!(blocklist
            .check_relation(t, db, cat.as_ref(), &paused)
            .is_err());
    }

    #[test]
    fn tablespace_block_carries_the_per_segment_flag() {
        let (cat, blocklist, paused, db, _ns, role, spc, t) = fixture();
        let key = BlockKey {
            target_oid: role,
            db,
            tablespace: spc,
            quota_type: QuotaType::RoleTablespace,
        };
        let mut local = HashMap::new();
        raise(&mut local, key, true);
        blocklist.flush_local(&mut local);

        let err = blocklist
            .check_relation(t, db, cat.as_ref(), &paused)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "tablespace: fast role: r diskquota exceeded per segment quota"
        );
    }

    #[test]
    fn quiet_entries_retire_from_both_maps() {
        let (_cat, blocklist, _paused, db, ns, _role, _spc, _t) = fixture();
        let key = BlockKey {
            target_oid: ns,
            db,
            tablespace: INVALID_OID,
            quota_type: QuotaType::Schema,
        };
        let mut local = HashMap::new();
        raise(&mut local, key, false);
        blocklist.flush_local(&mut local);
        assert!(blocklist.contains(&key));
        // staged entry survives the flush with its flag lowered
        assert!(local.contains_key(&key));

        // next epoch the target is back under quota: flag stays low
        blocklist.flush_local(&mut local);
        assert!(!blocklist.contains(&key));
        assert!(local.is_empty());
    }

    #[test]
    fn unknown_relation_fails_open() {
        let (cat, blocklist, paused, db, _ns, _role, _spc, _t) = fixture();
        assert!(blocklist
            .check_relation(999_999, db, cat.as_ref(), &paused)
            .is_ok());
    }

    #[test]
    fn invalidate_clears_only_one_database() {
        let (_cat, blocklist, _paused, db, ns, _role, _spc, _t) = fixture();
        let other_db = db + 1;
        for d in [db, other_db] {
            let mut local = HashMap::new();
            raise(
                &mut local,
                BlockKey {
                    target_oid: ns,
                    db: d,
                    tablespace: INVALID_OID,
                    quota_type: QuotaType::Schema,
                },
                false,
            );
            blocklist.flush_local(&mut local);
        }
        assert_eq!(blocklist.len(), 2);
        blocklist.invalidate_db(db);
        assert_eq!(blocklist.len(), 1);
        assert_eq!(blocklist.rows_for_db(other_db).len(), 1);
    }

    #[test]
    fn replace_db_swaps_the_full_set() {
        let (_cat, blocklist, _paused, db, ns, role, _spc, _t) = fixture();
        let k1 = BlockKey {
            target_oid: ns,
            db,
            tablespace: INVALID_OID,
            quota_type: QuotaType::Schema,
        };
        let k2 = BlockKey {
            target_oid: role,
            db,
            tablespace: INVALID_OID,
            quota_type: QuotaType::Role,
        };
        blocklist.replace_db(db, vec![(k1, BlockEntry::default())]);
        assert!(blocklist.contains(&k1));

        blocklist.replace_db(db, vec![(k2, BlockEntry::default())]);
        assert!(!blocklist.contains(&k1));
        assert!(blocklist.contains(&k2));
    }
}
