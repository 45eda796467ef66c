//! The cache proper: relid map plus a relfilenode reverse index, both
//! behind one lock, mirroring the original pair of shared hash tables.

use diskquota_catalog::Catalog;
use diskquota_common::{Oid, RelFileNode, RelFileNodeBackend};
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Clone, Debug)]
pub struct RelationCacheEntry {
    pub relid: Oid,
    /// Self for primary relations.
    pub primary_relid: Oid,
    pub auxiliaries: Vec<Oid>,
    pub owner: Oid,
    pub namespace: Oid,
    pub tablespace: Oid,
    pub rnode: RelFileNodeBackend,
}

struct CacheSlot {
    entry: RelationCacheEntry,
    last_access: u64,
}

#[derive(Default)]
struct CacheInner {
    relations: HashMap<Oid, CacheSlot>,
    /// relfilenode → relid, for files whose catalog row is invisible.
    by_relfilenode: HashMap<Oid, Oid>,
}

/// Bounded relation cache. Entries live until their relation is dropped or
/// its catalog row becomes visible; overflow evicts the least recently
/// touched entry.
pub struct RelationCache {
    inner: RwLock<CacheInner>,
    capacity: usize,
    clock: AtomicU64,
}

impl RelationCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            capacity,
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn len(&self) -> usize {
        self.inner.read().relations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().relations.is_empty()
    }

    /// Refresh the cache from the catalog for one relation, wiring the
    /// primary/auxiliary linkage in both directions.
    pub fn update(&self, relid: Oid, catalog: &dyn Catalog) {
        let Some(meta) = catalog.relation(relid) else {
            return;
        };
        let primary = meta.parent.unwrap_or(relid);

        let clock = self.tick();
        let mut inner = self.inner.write();

        if !inner.relations.contains_key(&relid) && inner.relations.len() >= self.capacity {
            Self::evict_lru(&mut inner);
        }

        let entry = RelationCacheEntry {
            relid,
            primary_relid: primary,
            auxiliaries: Vec::new(),
            owner: meta.owner,
            namespace: meta.namespace,
            tablespace: meta.tablespace,
            rnode: meta.rnode(),
        };
        inner.by_relfilenode.insert(meta.relfilenode, relid);
        match inner.relations.entry(relid) {
            Entry::Occupied(mut slot) => {
                let slot = slot.get_mut();
                let auxiliaries = std::mem::take(&mut slot.entry.auxiliaries);
                slot.entry = RelationCacheEntry {
                    auxiliaries,
                    ..entry
                };
                slot.last_access = clock;
            }
            Entry::Vacant(v) => {
                v.insert(CacheSlot {
                    entry,
                    last_access: clock,
                });
            }
        }

        if primary != relid {
            if let Some(parent) = inner.relations.get_mut(&primary) {
                if !parent.entry.auxiliaries.contains(&relid) {
                    parent.entry.auxiliaries.push(relid);
                }
            }
        }
    }

    fn evict_lru(inner: &mut CacheInner) {
        let victim = inner
            .relations
            .iter()
            .min_by_key(|(_, slot)| slot.last_access)
            .map(|(relid, slot)| (*relid, slot.entry.rnode.node.relfilenode));
        if let Some((relid, relfilenode)) = victim {
            debug!(relid, "evicting relation cache entry at capacity");
            inner.relations.remove(&relid);
            inner.by_relfilenode.remove(&relfilenode);
        }
    }

    pub fn get(&self, relid: Oid) -> Option<RelationCacheEntry> {
        let inner = self.inner.read();
        inner.relations.get(&relid).map(|slot| slot.entry.clone())
    }

    /// Remove an entry by relid, by relfilenode, or both.
    pub fn evict(&self, relid: Option<Oid>, relfilenode: Option<Oid>) {
        let mut inner = self.inner.write();
        if let Some(relid) = relid {
            if let Some(slot) = inner.relations.remove(&relid) {
                inner
                    .by_relfilenode
                    .remove(&slot.entry.rnode.node.relfilenode);
            }
        }
        if let Some(relfilenode) = relfilenode {
            if let Some(relid) = inner.by_relfilenode.remove(&relfilenode) {
                inner.relations.remove(&relid);
            }
        }
    }

    /// Primary relation owning `relid`'s storage: the catalog's parentage
    /// wins; a cached linkage covers relations the catalog cannot see yet.
    pub fn primary_of(&self, relid: Oid, catalog: &dyn Catalog) -> Oid {
        if let Some(meta) = catalog.relation(relid) {
            return meta.parent.unwrap_or(relid);
        }
        let inner = self.inner.read();
        inner
            .relations
            .get(&relid)
            .map(|slot| slot.entry.primary_relid)
            .unwrap_or(relid)
    }

    /// Resolve an on-disk file to its relation. Committed relations resolve
    /// through the catalog (and their cache entry, now redundant, is
    /// dropped); uncommitted ones resolve through the cache. `None` means
    /// the caller should requeue the file for a later epoch.
    pub fn resolve_relfilenode(&self, node: &RelFileNode, catalog: &dyn Catalog) -> Option<Oid> {
        if let Some(relid) = catalog.relid_by_relfilenode(node) {
            self.evict(None, Some(node.relfilenode));
            return Some(relid);
        }
        let inner = self.inner.read();
        inner.by_relfilenode.get(&node.relfilenode).copied()
    }

    /// Epoch-start sweep: drop entries whose relation is gone, and entries
    /// whose catalog row has become visible (the reverse map serves those
    /// now).
    pub fn sweep(&self, catalog: &dyn Catalog) {
        let stale: Vec<Oid> = {
            let inner = self.inner.read();
            inner
                .relations
                .values()
                .filter(|slot| {
                    let e = &slot.entry;
                    !catalog.relation_exists(e.relid)
                        || catalog.relid_by_relfilenode(&e.rnode.node).is_some()
                })
                .map(|slot| slot.entry.relid)
                .collect()
        };
        if stale.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        for relid in stale {
            if let Some(slot) = inner.relations.remove(&relid) {
                inner
                    .by_relfilenode
                    .remove(&slot.entry.rnode.node.relfilenode);
            }
        }
    }

    /// Auxiliary-containment invariant: every non-primary entry's primary
    /// is cached and lists it as an auxiliary.
    pub fn check_consistency(&self) -> bool {
        let inner = self.inner.read();
        inner.relations.values().all(|slot| {
            let e = &slot.entry;
            if e.primary_relid == e.relid {
                return true;
            }
            match inner.relations.get(&e.primary_relid) {
                Some(parent) => parent.entry.auxiliaries.contains(&e.relid),
                None => false,
            }
        })
    }
}
