//! Direct-stat relation sizing.

use crate::layout::{segment_file_path, Fork, FORKS};
use diskquota_catalog::Catalog;
use diskquota_common::{
    Error, Oid, RelFileNode, RelFileNodeBackend, Result, INVALID_BACKEND_ID, TEMP_UTILITY_BACKEND,
};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Walks relation files on this node's data directory. A file unlinked
/// between resolution and stat simply contributes zero; concurrent drops
/// must never surface as errors here.
pub struct RelationSizer {
    base_dir: PathBuf,
    catalog: Arc<dyn Catalog>,
}

impl RelationSizer {
    pub fn new(base_dir: impl Into<PathBuf>, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            base_dir: base_dir.into(),
            catalog,
        }
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Size of every fork and segment file of one storage unit.
    pub fn relation_file_size(&self, rnode: &RelFileNodeBackend) -> u64 {
        let mut total = 0u64;
        for fork in FORKS {
            for segno in 0u32.. {
                let path = segment_file_path(&self.base_dir, rnode, fork, segno);
                match std::fs::metadata(&path) {
                    Ok(meta) => total += meta.len(),
                    Err(e) if e.kind() == ErrorKind::NotFound => break,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "could not stat relation file");
                        break;
                    }
                }
            }
        }
        total
    }

    /// The primitive behind the user-facing relation_size function, keyed
    /// by file identity rather than catalog identity so it works for
    /// dropped and uncommitted relations alike.
    pub fn relation_size_local(
        &self,
        db: Oid,
        tablespace: Oid,
        relfilenode: Oid,
        is_temp: bool,
    ) -> u64 {
        let rnode = RelFileNodeBackend {
            node: RelFileNode::new(db, tablespace, relfilenode),
            backend: if is_temp {
                TEMP_UTILITY_BACKEND
            } else {
                INVALID_BACKEND_ID
            },
        };
        self.relation_file_size(&rnode)
    }

    /// Full logical size of a relation: all forks of the primary plus
    /// every auxiliary relation (toast, indexes, AO segment files).
    /// Fails only when the relation is gone from the catalog.
    pub fn table_size(&self, relid: Oid) -> Result<u64> {
        let meta = self
            .catalog
            .relation(relid)
            .ok_or(Error::UnknownRelation(relid))?;

        let mut total = self.relation_file_size(&meta.rnode());
        for aux in self.catalog.auxiliaries_of(relid) {
            if let Some(aux_meta) = self.catalog.relation(aux) {
                total += self.relation_file_size(&aux_meta.rnode());
            }
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{segment_file_path, Fork};
    use diskquota_catalog::{MemoryCatalog, StorageEventHub, TableSpec};
    use tempfile::TempDir;

    fn write_file(sizer: &RelationSizer, rnode: &RelFileNodeBackend, fork: Fork, segno: u32, len: usize) {
        let path = segment_file_path(sizer.base_dir(), rnode, fork, segno);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, vec![0u8; len]).unwrap();
    }

    fn fixture() -> (TempDir, Arc<MemoryCatalog>, RelationSizer, Oid, Oid) {
        let dir = TempDir::new().unwrap();
        let catalog = Arc::new(MemoryCatalog::new(Arc::new(StorageEventHub::new())));
        let db = catalog.define_database("db");
        let ns = catalog.define_namespace("public");
        let role = catalog.define_role("owner");
        let spc = catalog.define_tablespace("pg_default");
        let t = catalog.create_table(TableSpec::heap(db, "t", ns, role, spc));
        let sizer = RelationSizer::new(dir.path(), catalog.clone());
        (dir, catalog, sizer, db, t)
    }

    #[test]
    fn missing_files_size_to_zero() {
        let (_dir, catalog, sizer, _db, t) = fixture();
        let meta = catalog.relation(t).unwrap();
        assert_eq!(sizer.relation_file_size(&meta.rnode()), 0);
        assert_eq!(sizer.table_size(t).unwrap(), 0);
    }

    #[test]
    fn sums_forks_and_segment_files() {
        let (_dir, catalog, sizer, _db, t) = fixture();
        let rnode = catalog.relation(t).unwrap().rnode();
        write_file(&sizer, &rnode, Fork::Main, 0, 8192);
        write_file(&sizer, &rnode, Fork::Main, 1, 4096);
        write_file(&sizer, &rnode, Fork::FreeSpaceMap, 0, 512);
        write_file(&sizer, &rnode, Fork::VisibilityMap, 0, 256);
        assert_eq!(sizer.relation_file_size(&rnode), 8192 + 4096 + 512 + 256);
    }

    #[test]
    fn table_size_includes_auxiliaries() {
        let (_dir, catalog, sizer, db, t) = fixture();
        let rnode = catalog.relation(t).unwrap().rnode();
        write_file(&sizer, &rnode, Fork::Main, 0, 1000);

        let toast = catalog.relation_by_name(db, &format!("pg_toast_{t}")).unwrap();
        let toast_rnode = catalog.relation(toast).unwrap().rnode();
        write_file(&sizer, &toast_rnode, Fork::Main, 0, 300);

        let idx = catalog.create_index(t, "t_idx").unwrap();
        let idx_rnode = catalog.relation(idx).unwrap().rnode();
        write_file(&sizer, &idx_rnode, Fork::Main, 0, 200);

        assert_eq!(sizer.table_size(t).unwrap(), 1500);
    }

    #[test]
    fn concurrent_unlink_yields_zero_not_an_error() {
        let (_dir, catalog, sizer, _db, t) = fixture();
        let rnode = catalog.relation(t).unwrap().rnode();
        write_file(&sizer, &rnode, Fork::Main, 0, 4096);

        let path = segment_file_path(sizer.base_dir(), &rnode, Fork::Main, 0);
        std::fs::remove_file(path).unwrap();
        assert_eq!(sizer.relation_file_size(&rnode), 0);
    }

    #[test]
    fn dropped_relation_is_an_error_for_table_size() {
        let (_dir, catalog, sizer, _db, t) = fixture();
        catalog.drop_relation(t);
        assert!(matches!(
            sizer.table_size(t),
            Err(Error::UnknownRelation(_))
        ));
    }

    #[test]
    fn temp_relation_paths_are_probed() {
        let (_dir, catalog, sizer, db, t) = fixture();
        let meta = catalog.relation(t).unwrap();
        let temp_rnode = RelFileNodeBackend {
            node: RelFileNode::new(db, meta.tablespace, 55555),
            backend: TEMP_UTILITY_BACKEND,
        };
        write_file(&sizer, &temp_rnode, Fork::Main, 0, 777);
        assert_eq!(
            sizer.relation_size_local(db, meta.tablespace, 55555, true),
            777
        );
        assert_eq!(
            sizer.relation_size_local(db, meta.tablespace, 55555, false),
            0
        );
    }
}
