//! In-memory catalog, standing in for the host database's system catalog.
//!
//! The daemons load one from a manifest at startup; tests drive it
//! directly. Mutations fire the same storage/object events the host's
//! storage manager would, so the probe path is exercised end to end.

use crate::catalog::Catalog;
use crate::events::{AccessPhase, ObjectClass, StorageEventHub};
use diskquota_common::{
    Oid, RelFileNode, RelationMeta, StorageKind, FIRST_NORMAL_OBJECT_ID, INVALID_BACKEND_ID,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

struct RelationRecord {
    meta: RelationMeta,
    committed: bool,
    auxiliaries: Vec<Oid>,
}

#[derive(Default)]
struct Inner {
    databases: HashMap<Oid, String>,
    db_by_name: HashMap<String, Oid>,
    namespaces: HashMap<Oid, String>,
    ns_by_name: HashMap<String, Oid>,
    roles: HashMap<Oid, String>,
    role_by_name: HashMap<String, Oid>,
    tablespaces: HashMap<Oid, String>,
    spc_by_name: HashMap<String, Oid>,
    relations: HashMap<Oid, RelationRecord>,
    by_relfilenode: HashMap<RelFileNode, Oid>,
    next_oid: Oid,
}

impl Inner {
    fn alloc_oid(&mut self) -> Oid {
        let oid = self.next_oid;
        self.next_oid += 1;
        oid
    }
}

/// Parameters for creating a table in the stand-in catalog.
#[derive(Clone, Debug)]
pub struct TableSpec {
    pub db: Oid,
    pub name: String,
    pub namespace: Oid,
    pub owner: Oid,
    pub tablespace: Oid,
    pub kind: StorageKind,
    pub with_toast: bool,
}

impl TableSpec {
    pub fn heap(db: Oid, name: &str, namespace: Oid, owner: Oid, tablespace: Oid) -> Self {
        Self {
            db,
            name: name.to_string(),
            namespace,
            owner,
            tablespace,
            kind: StorageKind::Heap,
            with_toast: true,
        }
    }

    pub fn append_optimized(
        db: Oid,
        name: &str,
        namespace: Oid,
        owner: Oid,
        tablespace: Oid,
    ) -> Self {
        Self {
            db,
            name: name.to_string(),
            namespace,
            owner,
            tablespace,
            kind: StorageKind::AppendOptimized,
            with_toast: false,
        }
    }
}

pub struct MemoryCatalog {
    inner: RwLock<Inner>,
    hub: Arc<StorageEventHub>,
}

impl MemoryCatalog {
    pub fn new(hub: Arc<StorageEventHub>) -> Self {
        let inner = Inner {
            next_oid: FIRST_NORMAL_OBJECT_ID,
            ..Inner::default()
        };
        Self {
            inner: RwLock::new(inner),
            hub,
        }
    }

    pub fn hub(&self) -> &Arc<StorageEventHub> {
        &self.hub
    }

    // ── Cluster object definition ─────────────────────────────────────────

    pub fn insert_database(&self, oid: Oid, name: &str) {
        let mut inner = self.inner.write();
        inner.databases.insert(oid, name.to_string());
        inner.db_by_name.insert(name.to_string(), oid);
    }

    pub fn define_database(&self, name: &str) -> Oid {
        let oid = self.inner.write().alloc_oid();
        self.insert_database(oid, name);
        oid
    }

    pub fn insert_namespace(&self, oid: Oid, name: &str) {
        let mut inner = self.inner.write();
        inner.namespaces.insert(oid, name.to_string());
        inner.ns_by_name.insert(name.to_string(), oid);
    }

    pub fn define_namespace(&self, name: &str) -> Oid {
        let oid = self.inner.write().alloc_oid();
        self.insert_namespace(oid, name);
        oid
    }

    pub fn drop_namespace(&self, oid: Oid) {
        let mut inner = self.inner.write();
        if let Some(name) = inner.namespaces.remove(&oid) {
            inner.ns_by_name.remove(&name);
        }
    }

    pub fn insert_role(&self, oid: Oid, name: &str) {
        let mut inner = self.inner.write();
        inner.roles.insert(oid, name.to_string());
        inner.role_by_name.insert(name.to_string(), oid);
    }

    pub fn define_role(&self, name: &str) -> Oid {
        let oid = self.inner.write().alloc_oid();
        self.insert_role(oid, name);
        oid
    }

    pub fn drop_role(&self, oid: Oid) {
        let mut inner = self.inner.write();
        if let Some(name) = inner.roles.remove(&oid) {
            inner.role_by_name.remove(&name);
        }
    }

    pub fn insert_tablespace(&self, oid: Oid, name: &str) {
        let mut inner = self.inner.write();
        inner.tablespaces.insert(oid, name.to_string());
        inner.spc_by_name.insert(name.to_string(), oid);
    }

    pub fn define_tablespace(&self, name: &str) -> Oid {
        let oid = self.inner.write().alloc_oid();
        self.insert_tablespace(oid, name);
        oid
    }

    /// Register a pre-existing relation during catalog bootstrap. No
    /// events fire; the relation is committed and reverse-mapped at once.
    pub fn insert_relation(&self, meta: RelationMeta) {
        let mut inner = self.inner.write();
        if meta.oid >= inner.next_oid {
            inner.next_oid = meta.oid + 1;
        }
        inner.by_relfilenode.insert(meta.rnode().node, meta.oid);
        if let Some(parent) = meta.parent {
            if let Some(parent_rec) = inner.relations.get_mut(&parent) {
                if !parent_rec.auxiliaries.contains(&meta.oid) {
                    parent_rec.auxiliaries.push(meta.oid);
                }
            }
        }
        inner.relations.insert(
            meta.oid,
            RelationRecord {
                meta,
                committed: true,
                auxiliaries: Vec::new(),
            },
        );
    }

    // ── Relation lifecycle ────────────────────────────────────────────────

    /// Create a table plus its auxiliary relations, commit it, and fire the
    /// create events the host would.
    pub fn create_table(&self, spec: TableSpec) -> Oid {
        self.create_table_inner(spec, true)
    }

    /// Create a table whose catalog row is not yet visible to other
    /// sessions: the reverse relfilenode map misses until
    /// [`Self::commit_relation`] runs.
    pub fn create_table_pending(&self, spec: TableSpec) -> Oid {
        self.create_table_inner(spec, false)
    }

    fn create_table_inner(&self, spec: TableSpec, committed: bool) -> Oid {
        let mut created: Vec<RelationMeta> = Vec::new();
        let primary_oid;
        {
            let mut inner = self.inner.write();
            primary_oid = inner.alloc_oid();
            let primary = RelationMeta {
                oid: primary_oid,
                name: spec.name.clone(),
                db: spec.db,
                namespace: spec.namespace,
                owner: spec.owner,
                tablespace: spec.tablespace,
                relfilenode: primary_oid,
                kind: spec.kind,
                backend: INVALID_BACKEND_ID,
                parent: None,
            };

            let mut aux_specs: Vec<(String, StorageKind)> = Vec::new();
            match spec.kind {
                StorageKind::Heap if spec.with_toast => {
                    aux_specs.push((format!("pg_toast_{primary_oid}"), StorageKind::Toast));
                }
                StorageKind::AppendOptimized => {
                    aux_specs.push((format!("pg_aoseg_{primary_oid}"), StorageKind::AoSegment));
                    aux_specs.push((format!("pg_aovisimap_{primary_oid}"), StorageKind::AoVisimap));
                    aux_specs.push((
                        format!("pg_aoblkdir_{primary_oid}"),
                        StorageKind::AoBlockDirectory,
                    ));
                }
                _ => {}
            }

            let mut auxiliaries = Vec::new();
            for (name, kind) in aux_specs {
                let oid = inner.alloc_oid();
                let meta = RelationMeta {
                    oid,
                    name,
                    db: spec.db,
                    namespace: spec.namespace,
                    owner: spec.owner,
                    tablespace: spec.tablespace,
                    relfilenode: oid,
                    kind,
                    backend: INVALID_BACKEND_ID,
                    parent: Some(primary_oid),
                };
                auxiliaries.push(oid);
                created.push(meta.clone());
                inner.relations.insert(
                    oid,
                    RelationRecord {
                        meta,
                        committed,
                        auxiliaries: Vec::new(),
                    },
                );
            }

            created.insert(0, primary.clone());
            inner.relations.insert(
                primary_oid,
                RelationRecord {
                    meta: primary,
                    committed,
                    auxiliaries,
                },
            );

            if committed {
                for meta in &created {
                    inner
                        .by_relfilenode
                        .insert(meta.rnode().node, meta.oid);
                }
            }
        }

        for meta in &created {
            self.hub.fire_object_access(
                AccessPhase::PostCreate,
                ObjectClass::Relation,
                meta.oid,
                0,
            );
            self.hub.fire_create(&meta.rnode());
        }
        primary_oid
    }

    /// Make a pending relation (and its auxiliaries) visible in the reverse
    /// relfilenode map.
    pub fn commit_relation(&self, oid: Oid) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        let mut to_commit = vec![oid];
        if let Some(rec) = inner.relations.get(&oid) {
            to_commit.extend(rec.auxiliaries.iter().copied());
        }
        for oid in to_commit {
            if let Some(rec) = inner.relations.get_mut(&oid) {
                rec.committed = true;
                inner.by_relfilenode.insert(rec.meta.rnode().node, oid);
            }
        }
    }

    pub fn create_index(&self, table: Oid, name: &str) -> Option<Oid> {
        let meta;
        {
            let mut inner = self.inner.write();
            let parent = inner.relations.get(&table)?.meta.clone();
            let oid = inner.alloc_oid();
            meta = RelationMeta {
                oid,
                name: name.to_string(),
                db: parent.db,
                namespace: parent.namespace,
                owner: parent.owner,
                tablespace: parent.tablespace,
                relfilenode: oid,
                kind: StorageKind::Index,
                backend: INVALID_BACKEND_ID,
                parent: Some(table),
            };
            inner.relations.insert(
                oid,
                RelationRecord {
                    meta: meta.clone(),
                    committed: true,
                    auxiliaries: Vec::new(),
                },
            );
            inner.by_relfilenode.insert(meta.rnode().node, oid);
            if let Some(rec) = inner.relations.get_mut(&table) {
                rec.auxiliaries.push(oid);
            }
        }
        self.hub
            .fire_object_access(AccessPhase::PostCreate, ObjectClass::Relation, meta.oid, 0);
        self.hub.fire_create(&meta.rnode());
        Some(meta.oid)
    }

    /// Drop a relation. Dropping a primary takes its auxiliaries with it;
    /// every removed file fires an unlink event.
    pub fn drop_relation(&self, oid: Oid) {
        let mut removed: Vec<RelationMeta> = Vec::new();
        {
            let mut inner = self.inner.write();
            let Some(rec) = inner.relations.remove(&oid) else {
                return;
            };
            if let Some(parent) = rec.meta.parent {
                if let Some(parent_rec) = inner.relations.get_mut(&parent) {
                    parent_rec.auxiliaries.retain(|a| *a != oid);
                }
            }
            for aux in &rec.auxiliaries {
                if let Some(aux_rec) = inner.relations.remove(aux) {
                    inner.by_relfilenode.remove(&aux_rec.meta.rnode().node);
                    removed.push(aux_rec.meta);
                }
            }
            inner.by_relfilenode.remove(&rec.meta.rnode().node);
            removed.push(rec.meta);
        }
        for meta in &removed {
            self.hub.fire_unlink(&meta.rnode());
        }
    }

    pub fn set_owner(&self, oid: Oid, owner: Oid) {
        if let Some(rec) = self.inner.write().relations.get_mut(&oid) {
            rec.meta.owner = owner;
        }
    }

    pub fn set_namespace(&self, oid: Oid, namespace: Oid) {
        if let Some(rec) = self.inner.write().relations.get_mut(&oid) {
            rec.meta.namespace = namespace;
        }
    }

    pub fn set_tablespace(&self, oid: Oid, tablespace: Oid) {
        if let Some(rec) = self.inner.write().relations.get_mut(&oid) {
            rec.meta.tablespace = tablespace;
        }
    }

    /// Announce a file-extend on a relation's storage, as the host write
    /// path would after appending a page.
    pub fn extend(&self, oid: Oid) {
        let rnode = {
            let inner = self.inner.read();
            inner.relations.get(&oid).map(|rec| rec.meta.rnode())
        };
        if let Some(rnode) = rnode {
            self.hub.fire_extend(&rnode);
        }
    }
}

impl Catalog for MemoryCatalog {
    fn relation(&self, oid: Oid) -> Option<RelationMeta> {
        self.inner.read().relations.get(&oid).map(|r| r.meta.clone())
    }

    fn relid_by_relfilenode(&self, node: &RelFileNode) -> Option<Oid> {
        self.inner.read().by_relfilenode.get(node).copied()
    }

    fn auxiliaries_of(&self, oid: Oid) -> Vec<Oid> {
        self.inner
            .read()
            .relations
            .get(&oid)
            .map(|r| r.auxiliaries.clone())
            .unwrap_or_default()
    }

    fn list_relations(&self, db: Oid) -> Vec<Oid> {
        let inner = self.inner.read();
        let mut oids: Vec<Oid> = inner
            .relations
            .values()
            .filter(|r| r.committed && r.meta.db == db && r.meta.parent.is_none())
            .map(|r| r.meta.oid)
            .collect();
        oids.sort_unstable();
        oids
    }

    fn relation_by_name(&self, db: Oid, name: &str) -> Option<Oid> {
        let inner = self.inner.read();
        let (ns, rel) = match name.split_once('.') {
            Some((ns, rel)) => (Some(ns), rel),
            None => (None, name),
        };
        let ns_oid = ns.and_then(|n| inner.ns_by_name.get(n).copied());
        inner
            .relations
            .values()
            .find(|r| {
                r.meta.db == db
                    && r.meta.name == rel
                    && ns_oid.map(|o| r.meta.namespace == o).unwrap_or(true)
            })
            .map(|r| r.meta.oid)
    }

    fn database_oid(&self, name: &str) -> Option<Oid> {
        self.inner.read().db_by_name.get(name).copied()
    }

    fn database_name(&self, oid: Oid) -> Option<String> {
        self.inner.read().databases.get(&oid).cloned()
    }

    fn namespace_oid(&self, name: &str) -> Option<Oid> {
        self.inner.read().ns_by_name.get(name).copied()
    }

    fn namespace_name(&self, oid: Oid) -> Option<String> {
        self.inner.read().namespaces.get(&oid).cloned()
    }

    fn role_oid(&self, name: &str) -> Option<Oid> {
        self.inner.read().role_by_name.get(name).copied()
    }

    fn role_name(&self, oid: Oid) -> Option<String> {
        self.inner.read().roles.get(&oid).cloned()
    }

    fn tablespace_oid(&self, name: &str) -> Option<Oid> {
        self.inner.read().spc_by_name.get(name).copied()
    }

    fn tablespace_name(&self, oid: Oid) -> Option<String> {
        self.inner.read().tablespaces.get(&oid).cloned()
    }
}
