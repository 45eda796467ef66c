//! TOML catalog manifest.
//!
//! The daemons are catalog consumers, not owners; at startup they load a
//! snapshot of the relevant host catalog from a manifest file.

use crate::events::StorageEventHub;
use crate::memory::MemoryCatalog;
use diskquota_common::{Oid, RelationMeta, StorageKind, INVALID_BACKEND_ID};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

#[derive(Clone, Debug, Deserialize)]
pub struct NamedOid {
    pub oid: Oid,
    pub name: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ManifestRelation {
    pub oid: Oid,
    pub name: String,
    pub db: Oid,
    pub namespace: Oid,
    pub owner: Oid,
    pub tablespace: Oid,
    /// Defaults to the relation oid, as freshly created relations do.
    pub relfilenode: Option<Oid>,
    pub kind: StorageKind,
    pub parent: Option<Oid>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CatalogManifest {
    #[serde(default)]
    pub databases: Vec<NamedOid>,
    #[serde(default)]
    pub namespaces: Vec<NamedOid>,
    #[serde(default)]
    pub roles: Vec<NamedOid>,
    #[serde(default)]
    pub tablespaces: Vec<NamedOid>,
    #[serde(default)]
    pub relations: Vec<ManifestRelation>,
}

impl CatalogManifest {
    pub fn from_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, String> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| format!("read manifest {}: {e}", path.as_ref().display()))?;
        Self::from_str(&text).map_err(|e| format!("parse manifest: {e}"))
    }

    /// Materialize the manifest into a fresh in-memory catalog.
    pub fn build(&self, hub: Arc<StorageEventHub>) -> MemoryCatalog {
        let cat = MemoryCatalog::new(hub);
        for db in &self.databases {
            cat.insert_database(db.oid, &db.name);
        }
        for ns in &self.namespaces {
            cat.insert_namespace(ns.oid, &ns.name);
        }
        for role in &self.roles {
            cat.insert_role(role.oid, &role.name);
        }
        for spc in &self.tablespaces {
            cat.insert_tablespace(spc.oid, &spc.name);
        }
        // parents first so auxiliary back-links land
        let mut rels: Vec<&ManifestRelation> = self.relations.iter().collect();
        rels.sort_by_key(|r| r.parent.is_some());
        for rel in rels {
            cat.insert_relation(RelationMeta {
                oid: rel.oid,
                name: rel.name.clone(),
                db: rel.db,
                namespace: rel.namespace,
                owner: rel.owner,
                tablespace: rel.tablespace,
                relfilenode: rel.relfilenode.unwrap_or(rel.oid),
                kind: rel.kind,
                backend: INVALID_BACKEND_ID,
                parent: rel.parent,
            });
        }
        cat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;

    const SAMPLE: &str = r#"
        [[databases]]
        oid = 16385
        name = "sales"

        [[namespaces]]
        oid = 2200
        name = "public"

        [[roles]]
        oid = 10
        name = "admin"

        [[tablespaces]]
        oid = 1663
        name = "pg_default"

        [[relations]]
        oid = 16400
        name = "orders"
        db = 16385
        namespace = 2200
        owner = 10
        tablespace = 1663
        kind = "heap"

        [[relations]]
        oid = 16401
        name = "pg_toast_16400"
        db = 16385
        namespace = 2200
        owner = 10
        tablespace = 1663
        kind = "toast"
        parent = 16400
    "#;

    #[test]
    fn manifest_builds_a_catalog() {
        let manifest = CatalogManifest::from_str(SAMPLE).unwrap();
        let cat = manifest.build(Arc::new(StorageEventHub::new()));

        assert_eq!(cat.database_oid("sales"), Some(16385));
        assert_eq!(cat.namespace_name(2200).as_deref(), Some("public"));
        assert_eq!(cat.list_relations(16385), vec![16400]);

        let toast = cat.relation(16401).unwrap();
        assert_eq!(toast.parent, Some(16400));
        assert_eq!(toast.relfilenode, 16401);
    }
}
