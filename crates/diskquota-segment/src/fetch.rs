//! The two-mode stat entry point served to the coordinator.

use crate::sizer::RelationSizer;
use diskquota_activetable::ActiveTableTracker;
use diskquota_catalog::Catalog;
use diskquota_common::{
    FetchMode, NodeRole, Oid, SegId, TableStat, CLUSTER_SEG_ID,
};
use diskquota_relcache::RelationCache;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

/// Shard-local stat service. One per segment process; the gRPC layer is a
/// thin shim over this.
pub struct SegmentStatService {
    seg_id: SegId,
    role: NodeRole,
    tracker: Arc<ActiveTableTracker>,
    relcache: Arc<RelationCache>,
    catalog: Arc<dyn Catalog>,
    sizer: RelationSizer,
}

impl SegmentStatService {
    pub fn new(
        seg_id: SegId,
        role: NodeRole,
        tracker: Arc<ActiveTableTracker>,
        relcache: Arc<RelationCache>,
        catalog: Arc<dyn Catalog>,
        sizer: RelationSizer,
    ) -> Self {
        Self {
            seg_id,
            role,
            tracker,
            relcache,
            catalog,
            sizer,
        }
    }

    pub fn seg_id(&self) -> SegId {
        self.seg_id
    }

    pub fn sizer(&self) -> &RelationSizer {
        &self.sizer
    }

    /// Entry point mirroring the original's set-returning function: mode
    /// selects between draining active oids and sizing a relation set.
    /// Coordinators and mirrors always answer with an empty set.
    pub fn fetch_table_stat(&self, mode: FetchMode, db: Oid, oids: &[Oid]) -> Vec<TableStat> {
        if !self.role.collects_active_tables() {
            return Vec::new();
        }
        match mode {
            FetchMode::ActiveOids => self.fetch_active_oids(db),
            FetchMode::ActiveSize => self.fetch_active_sizes(oids),
        }
    }

    /// Drain this shard's active files for one database and resolve them to
    /// primary relation oids. Files that cannot be resolved yet (their
    /// catalog row is invisible and the cache has no record) go back into
    /// the shared map for a later epoch.
    fn fetch_active_oids(&self, db: Oid) -> Vec<TableStat> {
        // entries for relations that have become visible are redundant now
        self.relcache.sweep(self.catalog.as_ref());

        let drained = self.tracker.drain_for_db(db);
        let mut primaries: HashSet<Oid> = HashSet::new();
        let mut unresolved = Vec::new();
        for node in drained {
            match self
                .relcache
                .resolve_relfilenode(&node, self.catalog.as_ref())
            {
                Some(relid) => {
                    primaries.insert(self.relcache.primary_of(relid, self.catalog.as_ref()));
                }
                None => unresolved.push(node),
            }
        }
        self.tracker.put_back(unresolved);

        let mut rows: Vec<TableStat> = primaries
            .into_iter()
            .map(|oid| TableStat {
                oid,
                size_bytes: 0,
                seg_id: CLUSTER_SEG_ID,
            })
            .collect();
        rows.sort_unstable_by_key(|r| r.oid);
        rows
    }

    /// Size each requested relation. A relation that errors (typically
    /// dropped concurrently) contributes size zero for this epoch rather
    /// than failing the batch.
    fn fetch_active_sizes(&self, oids: &[Oid]) -> Vec<TableStat> {
        oids.iter()
            .map(|&oid| {
                let size_bytes = match self.sizer.table_size(oid) {
                    Ok(size) => size,
                    Err(e) => {
                        warn!(oid, error = %e, "sizing relation failed, reporting 0");
                        0
                    }
                };
                TableStat {
                    oid,
                    size_bytes,
                    seg_id: self.seg_id,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{segment_file_path, Fork};
    use diskquota_catalog::{MemoryCatalog, StorageEventHub, TableSpec};
    use diskquota_common::MAX_NUM_MONITORED_DB;
    use diskquota_shmem::MonitoredDbSet;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        catalog: Arc<MemoryCatalog>,
        tracker: Arc<ActiveTableTracker>,
        relcache: Arc<RelationCache>,
        service: SegmentStatService,
        db: Oid,
        ns: Oid,
        owner: Oid,
        spc: Oid,
    }

    fn fixture(role: NodeRole) -> Fixture {
        let dir = TempDir::new().unwrap();
        let hub = Arc::new(StorageEventHub::new());
        let catalog = Arc::new(MemoryCatalog::new(hub.clone()));
        let db = catalog.define_database("db");
        let ns = catalog.define_namespace("public");
        let owner = catalog.define_role("owner");
        let spc = catalog.define_tablespace("pg_default");

        let monitored = Arc::new(MonitoredDbSet::new(MAX_NUM_MONITORED_DB));
        monitored.add(db).unwrap();
        let relcache = Arc::new(RelationCache::new(1024));
        let tracker = Arc::new(ActiveTableTracker::new(
            role,
            1024,
            monitored,
            relcache.clone(),
            catalog.clone(),
        ));
        hub.register(tracker.clone());

        let sizer = RelationSizer::new(dir.path(), catalog.clone());
        let service = SegmentStatService::new(
            0,
            role,
            tracker.clone(),
            relcache.clone(),
            catalog.clone(),
            sizer,
        );
        Fixture {
            _dir: dir,
            catalog,
            tracker,
            relcache,
            service,
            db,
            ns,
            owner,
            spc,
        }
    }

    fn write_main_file(f: &Fixture, oid: Oid, len: usize) {
        let rnode = f.catalog.relation(oid).unwrap().rnode();
        let path = segment_file_path(f.service.sizer().base_dir(), &rnode, Fork::Main, 0);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, vec![0u8; len]).unwrap();
    }

    #[test]
    fn active_oids_resolve_to_primaries() {
        let f = fixture(NodeRole::Segment);
        let t = f
            .catalog
            .create_table(TableSpec::heap(f.db, "t", f.ns, f.owner, f.spc));
        // toast growth must be charged to the owning table
        let toast = f
            .catalog
            .relation_by_name(f.db, &format!("pg_toast_{t}"))
            .unwrap();
        f.catalog.extend(toast);

        let rows = f.service.fetch_table_stat(FetchMode::ActiveOids, f.db, &[]);
        let oids: Vec<Oid> = rows.iter().map(|r| r.oid).collect();
        assert!(oids.contains(&t));
        assert!(!oids.contains(&toast));
    }

    #[test]
    fn unresolved_files_are_requeued() {
        let f = fixture(NodeRole::Segment);
        let t = f
            .catalog
            .create_table_pending(TableSpec::heap(f.db, "t", f.ns, f.owner, f.spc));
        // consume the creation events, then wipe the cache entries the
        // post-create probe added so only the raw file event remains
        f.service.fetch_table_stat(FetchMode::ActiveOids, f.db, &[]);
        f.relcache.evict(Some(t), None);
        for aux in f.catalog.auxiliaries_of(t) {
            f.relcache.evict(Some(aux), None);
        }
        f.catalog.extend(t);
        let rows = f.service.fetch_table_stat(FetchMode::ActiveOids, f.db, &[]);
        assert!(rows.is_empty());
        // the entry went back to the shared map
        assert_eq!(f.tracker.len(), 1);

        // once committed, the next epoch resolves it
        f.catalog.commit_relation(t);
        let rows = f.service.fetch_table_stat(FetchMode::ActiveOids, f.db, &[]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].oid, t);
    }

    #[test]
    fn sizes_report_per_shard_rows() {
        let f = fixture(NodeRole::Segment);
        let t = f
            .catalog
            .create_table(TableSpec::heap(f.db, "t", f.ns, f.owner, f.spc));
        write_main_file(&f, t, 4096);

        let rows = f
            .service
            .fetch_table_stat(FetchMode::ActiveSize, f.db, &[t]);
        assert_eq!(rows, vec![TableStat { oid: t, size_bytes: 4096, seg_id: 0 }]);
    }

    #[test]
    fn dropped_relation_sizes_to_zero() {
        let f = fixture(NodeRole::Segment);
        let t = f
            .catalog
            .create_table(TableSpec::heap(f.db, "t", f.ns, f.owner, f.spc));
        f.catalog.drop_relation(t);
        let rows = f
            .service
            .fetch_table_stat(FetchMode::ActiveSize, f.db, &[t]);
        assert_eq!(rows[0].size_bytes, 0);
    }

    #[test]
    fn coordinator_returns_nothing() {
        let f = fixture(NodeRole::Coordinator);
        let rows = f.service.fetch_table_stat(FetchMode::ActiveOids, f.db, &[]);
        assert!(rows.is_empty());
    }
}
