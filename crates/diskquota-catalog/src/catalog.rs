//! The read-only catalog interface the engine depends on.

use diskquota_common::{Oid, RelFileNode, RelationMeta};

/// Host catalog lookups. Implementations must be cheap and non-blocking;
/// the write-path gate calls into this on every checked write.
pub trait Catalog: Send + Sync {
    /// Full attributes of one relation, auxiliary or primary.
    fn relation(&self, oid: Oid) -> Option<RelationMeta>;

    fn relation_exists(&self, oid: Oid) -> bool {
        self.relation(oid).is_some()
    }

    /// Reverse map from an on-disk file to its committed relation. Returns
    /// `None` for files whose catalog row is not yet visible; callers fall
    /// back to the uncommitted-relation cache.
    fn relid_by_relfilenode(&self, node: &RelFileNode) -> Option<Oid>;

    /// User-visible primary relations of one database (tables and
    /// materialized views; auxiliary storage rolls up into these).
    fn list_relations(&self, db: Oid) -> Vec<Oid>;

    /// Auxiliary relations charged to a primary: its toast table, indexes
    /// and append-optimized bookkeeping relations.
    fn auxiliaries_of(&self, oid: Oid) -> Vec<Oid>;

    /// Resolve a possibly schema-qualified relation name.
    fn relation_by_name(&self, db: Oid, name: &str) -> Option<Oid>;

    fn database_oid(&self, name: &str) -> Option<Oid>;
    fn database_name(&self, oid: Oid) -> Option<String>;

    fn namespace_oid(&self, name: &str) -> Option<Oid>;
    fn namespace_name(&self, oid: Oid) -> Option<String>;
    fn namespace_exists(&self, oid: Oid) -> bool {
        self.namespace_name(oid).is_some()
    }

    fn role_oid(&self, name: &str) -> Option<Oid>;
    fn role_name(&self, oid: Oid) -> Option<String>;
    fn role_exists(&self, oid: Oid) -> bool {
        self.role_name(oid).is_some()
    }

    fn tablespace_oid(&self, name: &str) -> Option<Oid>;
    fn tablespace_name(&self, oid: Oid) -> Option<String>;
    fn tablespace_exists(&self, oid: Oid) -> bool {
        self.tablespace_name(oid).is_some()
    }
}
