//! The probe listener and the active-file map it feeds.

use diskquota_catalog::{AccessPhase, Catalog, ObjectClass, StorageEventListener};
use diskquota_common::{
    NodeRole, Oid, RelFileNode, RelFileNodeBackend, FIRST_NORMAL_OBJECT_ID,
};
use diskquota_relcache::RelationCache;
use diskquota_shmem::{MonitoredDbSet, SharedMap};
use std::sync::Arc;
use tracing::warn;

/// Collects the set of storage files modified since the last drain.
///
/// Registered once per node with the host's storage-event hub. Probes
/// never fail: anything that cannot be recorded is dropped and the next
/// modification of the same relation re-registers it.
pub struct ActiveTableTracker {
    role: NodeRole,
    active: SharedMap<RelFileNode, ()>,
    monitored: Arc<MonitoredDbSet>,
    relcache: Arc<RelationCache>,
    catalog: Arc<dyn Catalog>,
}

impl ActiveTableTracker {
    pub fn new(
        role: NodeRole,
        max_active_tables: usize,
        monitored: Arc<MonitoredDbSet>,
        relcache: Arc<RelationCache>,
        catalog: Arc<dyn Catalog>,
    ) -> Self {
        Self {
            role,
            active: SharedMap::new("active_tables", max_active_tables),
            monitored,
            relcache,
            catalog,
        }
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.active.dropped()
    }

    fn report(&self, rnode: &RelFileNodeBackend) {
        if !self.role.collects_active_tables() {
            return;
        }
        // membership is read without coordination with the launcher; a
        // stale miss only delays detection by one epoch
        if !self.monitored.contains(rnode.node.db) {
            return;
        }
        if self.active.insert(rnode.node, ()).is_err() {
            warn!(
                db = rnode.node.db,
                relfilenode = rnode.node.relfilenode,
                "active table map is full, dropping file event"
            );
        }
    }

    /// Drain every entry of one database into a local buffer. The shared
    /// map shrinks under a single exclusive section, so a cancelled caller
    /// never leaves it half-drained.
    pub fn drain_for_db(&self, db: Oid) -> Vec<RelFileNode> {
        self.active
            .take_matching(|node, _| node.db == db)
            .into_iter()
            .map(|(node, _)| node)
            .collect()
    }

    /// Return entries that could not be resolved this epoch.
    pub fn put_back(&self, entries: Vec<RelFileNode>) {
        for node in entries {
            if self.active.insert(node, ()).is_err() {
                warn!(
                    db = node.db,
                    relfilenode = node.relfilenode,
                    "active table map is full, dropping requeued entry"
                );
            }
        }
    }
}

impl StorageEventListener for ActiveTableTracker {
    fn on_create(&self, rnode: &RelFileNodeBackend) {
        self.report(rnode);
    }

    fn on_extend(&self, rnode: &RelFileNodeBackend) {
        self.report(rnode);
    }

    fn on_truncate(&self, rnode: &RelFileNodeBackend) {
        self.report(rnode);
    }

    fn on_unlink(&self, rnode: &RelFileNodeBackend) {
        self.relcache.evict(None, Some(rnode.node.relfilenode));
    }

    fn on_object_access(&self, phase: AccessPhase, class: ObjectClass, oid: Oid, sub_id: u32) {
        if class != ObjectClass::Relation || sub_id != 0 {
            return;
        }
        if oid < FIRST_NORMAL_OBJECT_ID {
            return;
        }
        if phase != AccessPhase::PostCreate {
            return;
        }
        if !self.role.collects_active_tables() {
            return;
        }
        if !self.monitored.contains(self.current_db_of(oid)) {
            return;
        }
        self.relcache.update(oid, self.catalog.as_ref());
    }
}

impl ActiveTableTracker {
    fn current_db_of(&self, oid: Oid) -> Oid {
        self.catalog
            .relation(oid)
            .map(|meta| meta.db)
            .unwrap_or_default()
    }
}
