//! The coordinator's persistent store.
//!
//! Records are small JSON strings keyed by oid tuples; every mutating call
//! is one write transaction so state on disk is always a consistent
//! epoch boundary.

use crate::tables::{DATABASE_LIST, QUOTA_CONFIG, STATE, TABLE_SIZE, TARGET};
use diskquota_common::{Oid, QuotaState, QuotaType, SchemaVersion, INVALID_OID};
use diskquota_quota::{FlushBatch, QuotaLimit, TableSizeRow};
use redb::{Database, ReadableTable};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("record error: {0}")]
    Record(#[from] serde_json::Error),
    #[error("no tablespace-qualified quota is configured for tablespace {0}")]
    NoTargetsForTablespace(Oid),
}

impl From<StoreError> for diskquota_common::Error {
    fn from(e: StoreError) -> Self {
        diskquota_common::Error::Storage(e.to_string())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct QuotaConfigRecord {
    limit_mb: i64,
    seg_ratio: f32,
}

/// Persistent quota store. Clone-cheap via `Arc` at the call sites.
pub struct QuotaStore {
    db: Arc<Database>,
}

impl QuotaStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db = Database::create(path)?;

        // Ensure all tables exist
        let wtx = db.begin_write()?;
        wtx.open_table(QUOTA_CONFIG)?;
        wtx.open_table(TARGET)?;
        wtx.open_table(TABLE_SIZE)?;
        wtx.open_table(STATE)?;
        wtx.open_table(DATABASE_LIST)?;
        wtx.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    // ── Quota configuration ───────────────────────────────────────────────

    /// Upsert or delete one quota row. A negative limit clears the quota;
    /// zero and positive limits persist (zero is deny-all). An upsert
    /// keeps any previously configured per-segment ratio.
    pub fn set_quota_config(
        &self,
        db: Oid,
        target: Oid,
        quota_type: QuotaType,
        limit_mb: i64,
    ) -> StoreResult<()> {
        let key = (db, target, quota_type as u32);
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(QUOTA_CONFIG)?;
            if limit_mb < 0 {
                table.remove(key)?;
            } else {
                let seg_ratio = match table.get(key)? {
                    Some(v) => serde_json::from_str::<QuotaConfigRecord>(v.value())?.seg_ratio,
                    None => -1.0,
                };
                let json = serde_json::to_string(&QuotaConfigRecord { limit_mb, seg_ratio })?;
                table.insert(key, json.as_str())?;
            }
        }
        wtx.commit()?;
        Ok(())
    }

    /// Record (or clear) the tablespace binding of a qualified quota.
    pub fn set_target(
        &self,
        db: Oid,
        quota_type: QuotaType,
        primary: Oid,
        tablespace: Oid,
        limit_mb: i64,
    ) -> StoreResult<()> {
        let key = (db, primary, tablespace, quota_type as u32);
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(TARGET)?;
            if limit_mb < 0 {
                table.remove(key)?;
            } else {
                table.insert(key, ())?;
            }
        }
        wtx.commit()?;
        Ok(())
    }

    /// Set the per-segment ratio on every qualified quota bound to one
    /// tablespace. Errors when nothing is bound to it.
    pub fn set_seg_ratio(&self, db: Oid, tablespace: Oid, ratio: f32) -> StoreResult<usize> {
        let wtx = self.db.begin_write()?;
        let mut updated = 0;
        {
            let targets = wtx.open_table(TARGET)?;
            let mut configs = wtx.open_table(QUOTA_CONFIG)?;

            let mut bound: Vec<(Oid, u32)> = Vec::new();
            for entry in targets.iter()? {
                let (key, _) = entry?;
                let (row_db, primary, spc, ty) = key.value();
                if row_db == db && spc == tablespace {
                    bound.push((primary, ty));
                }
            }
            for (primary, ty) in bound {
                let key = (db, primary, ty);
                let existing = configs.get(key)?.map(|v| v.value().to_string());
                if let Some(v) = existing {
                    let mut record: QuotaConfigRecord = serde_json::from_str(&v)?;
                    record.seg_ratio = ratio;
                    let json = serde_json::to_string(&record)?;
                    configs.insert(key, json.as_str())?;
                    updated += 1;
                }
            }
        }
        if updated == 0 {
            wtx.abort()?;
            return Err(StoreError::NoTargetsForTablespace(tablespace));
        }
        wtx.commit()?;
        Ok(updated)
    }

    /// Load the effective limits of one database: quota rows joined with
    /// their tablespace bindings.
    pub fn load_quota_limits(&self, db: Oid) -> StoreResult<Vec<QuotaLimit>> {
        let rtx = self.db.begin_read()?;
        let configs = rtx.open_table(QUOTA_CONFIG)?;
        let targets = rtx.open_table(TARGET)?;

        let mut bindings: Vec<(Oid, u32, Oid)> = Vec::new();
        for entry in targets.iter()? {
            let (key, _) = entry?;
            let (row_db, primary, spc, ty) = key.value();
            if row_db == db {
                bindings.push((primary, ty, spc));
            }
        }

        let mut limits = Vec::new();
        for entry in configs.iter()? {
            let (key, value) = entry?;
            let (row_db, target, ty) = key.value();
            if row_db != db {
                continue;
            }
            let Some(quota_type) = QuotaType::from_u32(ty) else {
                continue;
            };
            let record: QuotaConfigRecord = serde_json::from_str(value.value())?;
            if quota_type.is_tablespace_qualified() {
                for &(primary, bty, spc) in &bindings {
                    if primary == target && bty == ty {
                        limits.push(QuotaLimit {
                            quota_type,
                            target_oid: target,
                            tablespace: spc,
                            limit_mb: record.limit_mb,
                            seg_ratio: record.seg_ratio,
                        });
                    }
                }
            } else {
                limits.push(QuotaLimit {
                    quota_type,
                    target_oid: target,
                    tablespace: INVALID_OID,
                    limit_mb: record.limit_mb,
                    seg_ratio: record.seg_ratio,
                });
            }
        }
        Ok(limits)
    }

    /// All quota rows of one database, for the diagnostic views.
    pub fn list_quota_configs(&self, db: Oid) -> StoreResult<Vec<QuotaLimit>> {
        self.load_quota_limits(db)
    }

    // ── Table sizes ───────────────────────────────────────────────────────

    /// Apply one epoch's upserts and deletes in a single transaction.
    pub fn apply_flush(&self, db: Oid, batch: &FlushBatch) -> StoreResult<()> {
        if batch.upserts.is_empty() && batch.deletes.is_empty() {
            return Ok(());
        }
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(TABLE_SIZE)?;
            for (oid, seg_id) in &batch.deletes {
                table.remove((db, *oid, *seg_id as i32))?;
            }
            for row in &batch.upserts {
                table.insert((db, row.oid, row.seg_id as i32), row.size_bytes)?;
            }
        }
        wtx.commit()?;
        Ok(())
    }

    /// Replace the full size set of one database (init_table_size_table).
    pub fn replace_table_sizes(&self, db: Oid, rows: &[TableSizeRow]) -> StoreResult<()> {
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(TABLE_SIZE)?;
            let stale: Vec<(u32, u32, i32)> = table
                .iter()?
                .filter_map(|e| e.ok())
                .map(|(k, _)| k.value())
                .filter(|(row_db, _, _)| *row_db == db)
                .collect();
            for key in stale {
                table.remove(key)?;
            }
            for row in rows {
                table.insert((db, row.oid, row.seg_id as i32), row.size_bytes)?;
            }
        }
        wtx.commit()?;
        Ok(())
    }

    /// Load last-known sizes for the cold-start epoch. Under the v1 schema
    /// only cluster-total rows exist, mirroring the old two-column layout.
    pub fn load_table_sizes(&self, db: Oid, version: SchemaVersion) -> StoreResult<Vec<TableSizeRow>> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(TABLE_SIZE)?;
        let mut rows = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            let (row_db, oid, seg_id) = key.value();
            if row_db != db {
                continue;
            }
            if version == SchemaVersion::V1 && seg_id != -1 {
                continue;
            }
            rows.push(TableSizeRow {
                oid,
                seg_id: seg_id as i16,
                size_bytes: value.value(),
            });
        }
        Ok(rows)
    }

    // ── Extension state ───────────────────────────────────────────────────

    pub fn set_state(&self, db: Oid, state: QuotaState) -> StoreResult<()> {
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(STATE)?;
            table.insert(db, state as u32)?;
        }
        wtx.commit()?;
        Ok(())
    }

    pub fn state(&self, db: Oid) -> StoreResult<QuotaState> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(STATE)?;
        let state = match table.get(db)? {
            Some(v) if v.value() == QuotaState::Ready as u32 => QuotaState::Ready,
            _ => QuotaState::Unknown,
        };
        Ok(state)
    }

    // ── Monitored database list ───────────────────────────────────────────

    pub fn add_database(&self, db: Oid) -> StoreResult<()> {
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(DATABASE_LIST)?;
            table.insert(db, ())?;
        }
        wtx.commit()?;
        Ok(())
    }

    /// Remove a database and all of its persisted state.
    pub fn remove_database(&self, db: Oid) -> StoreResult<()> {
        let wtx = self.db.begin_write()?;
        {
            let mut table = wtx.open_table(DATABASE_LIST)?;
            table.remove(db)?;
            let mut state = wtx.open_table(STATE)?;
            state.remove(db)?;

            let mut sizes = wtx.open_table(TABLE_SIZE)?;
            let stale: Vec<(u32, u32, i32)> = sizes
                .iter()?
                .filter_map(|e| e.ok())
                .map(|(k, _)| k.value())
                .filter(|(row_db, _, _)| *row_db == db)
                .collect();
            for key in stale {
                sizes.remove(key)?;
            }

            let mut configs = wtx.open_table(QUOTA_CONFIG)?;
            let stale: Vec<(u32, u32, u32)> = configs
                .iter()?
                .filter_map(|e| e.ok())
                .map(|(k, _)| k.value())
                .filter(|(row_db, _, _)| *row_db == db)
                .collect();
            for key in stale {
                configs.remove(key)?;
            }

            let mut targets = wtx.open_table(TARGET)?;
            let stale: Vec<(u32, u32, u32, u32)> = targets
                .iter()?
                .filter_map(|e| e.ok())
                .map(|(k, _)| k.value())
                .filter(|(row_db, _, _, _)| *row_db == db)
                .collect();
            for key in stale {
                targets.remove(key)?;
            }
        }
        wtx.commit()?;
        Ok(())
    }

    pub fn list_databases(&self) -> StoreResult<Vec<Oid>> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(DATABASE_LIST)?;
        let mut dbs = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            dbs.push(key.value());
        }
        dbs.sort_unstable();
        Ok(dbs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskquota_common::CLUSTER_SEG_ID;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, QuotaStore) {
        let dir = TempDir::new().unwrap();
        let store = QuotaStore::open(dir.path().join("quota.redb")).unwrap();
        (dir, store)
    }

    #[test]
    fn quota_config_upsert_and_clear() {
        let (_dir, store) = open_store();
        store.set_quota_config(1, 100, QuotaType::Schema, 250).unwrap();
        let limits = store.load_quota_limits(1).unwrap();
        assert_eq!(limits.len(), 1);
        assert_eq!(limits[0].limit_mb, 250);
        assert_eq!(limits[0].seg_ratio, -1.0);

        store.set_quota_config(1, 100, QuotaType::Schema, 500).unwrap();
        assert_eq!(store.load_quota_limits(1).unwrap()[0].limit_mb, 500);

        store.set_quota_config(1, 100, QuotaType::Schema, -1).unwrap();
        assert!(store.load_quota_limits(1).unwrap().is_empty());
    }

    #[test]
    fn zero_limit_rows_persist() {
        let (_dir, store) = open_store();
        store.set_quota_config(1, 100, QuotaType::Role, 0).unwrap();
        assert_eq!(store.load_quota_limits(1).unwrap()[0].limit_mb, 0);
    }

    #[test]
    fn tablespace_quota_joins_its_target() {
        let (_dir, store) = open_store();
        store
            .set_quota_config(1, 100, QuotaType::SchemaTablespace, 128)
            .unwrap();
        // no binding yet: the limit is invisible
        assert!(store.load_quota_limits(1).unwrap().is_empty());

        store
            .set_target(1, QuotaType::SchemaTablespace, 100, 777, 128)
            .unwrap();
        let limits = store.load_quota_limits(1).unwrap();
        assert_eq!(limits.len(), 1);
        assert_eq!(limits[0].tablespace, 777);
    }

    #[test]
    fn seg_ratio_requires_existing_targets() {
        let (_dir, store) = open_store();
        assert!(matches!(
            store.set_seg_ratio(1, 777, 0.5),
            Err(StoreError::NoTargetsForTablespace(777))
        ));

        store
            .set_quota_config(1, 100, QuotaType::RoleTablespace, 64)
            .unwrap();
        store
            .set_target(1, QuotaType::RoleTablespace, 100, 777, 64)
            .unwrap();
        assert_eq!(store.set_seg_ratio(1, 777, 0.5).unwrap(), 1);
        let limits = store.load_quota_limits(1).unwrap();
        assert_eq!(limits[0].seg_ratio, 0.5);

        // a later limit change keeps the configured ratio
        store
            .set_quota_config(1, 100, QuotaType::RoleTablespace, 96)
            .unwrap();
        let limits = store.load_quota_limits(1).unwrap();
        assert_eq!(limits[0].limit_mb, 96);
        assert_eq!(limits[0].seg_ratio, 0.5);
    }

    #[test]
    fn flush_roundtrip_and_versioned_load() {
        let (_dir, store) = open_store();
        let batch = FlushBatch {
            upserts: vec![
                TableSizeRow {
                    oid: 50,
                    seg_id: CLUSTER_SEG_ID,
                    size_bytes: 300,
                },
                TableSizeRow {
                    oid: 50,
                    seg_id: 0,
                    size_bytes: 100,
                },
                TableSizeRow {
                    oid: 50,
                    seg_id: 1,
                    size_bytes: 200,
                },
            ],
            deletes: vec![],
        };
        store.apply_flush(7, &batch).unwrap();

        let v2 = store.load_table_sizes(7, SchemaVersion::V2).unwrap();
        assert_eq!(v2.len(), 3);
        let v1 = store.load_table_sizes(7, SchemaVersion::V1).unwrap();
        assert_eq!(v1.len(), 1);
        assert_eq!(v1[0].seg_id, CLUSTER_SEG_ID);

        let batch = FlushBatch {
            upserts: vec![],
            deletes: vec![(50, CLUSTER_SEG_ID), (50, 0), (50, 1)],
        };
        store.apply_flush(7, &batch).unwrap();
        assert!(store.load_table_sizes(7, SchemaVersion::V2).unwrap().is_empty());
    }

    #[test]
    fn state_defaults_to_unknown() {
        let (_dir, store) = open_store();
        assert_eq!(store.state(9).unwrap(), QuotaState::Unknown);
        store.set_state(9, QuotaState::Ready).unwrap();
        assert_eq!(store.state(9).unwrap(), QuotaState::Ready);
    }

    #[test]
    fn database_list_roundtrip() {
        let (_dir, store) = open_store();
        store.add_database(5).unwrap();
        store.add_database(3).unwrap();
        assert_eq!(store.list_databases().unwrap(), vec![3, 5]);

        store.remove_database(5).unwrap();
        assert_eq!(store.list_databases().unwrap(), vec![3]);
    }

    #[test]
    fn remove_database_clears_all_its_state() {
        let (_dir, store) = open_store();
        store.add_database(5).unwrap();
        store.set_state(5, QuotaState::Ready).unwrap();
        store.set_quota_config(5, 100, QuotaType::Schema, 10).unwrap();
        store
            .replace_table_sizes(
                5,
                &[TableSizeRow {
                    oid: 50,
                    seg_id: CLUSTER_SEG_ID,
                    size_bytes: 1,
                }],
            )
            .unwrap();

        store.remove_database(5).unwrap();
        assert_eq!(store.state(5).unwrap(), QuotaState::Unknown);
        assert!(store.load_quota_limits(5).unwrap().is_empty());
        assert!(store.load_table_sizes(5, SchemaVersion::V2).unwrap().is_empty());
    }

    #[test]
    fn store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("quota.redb");
        {
            let store = QuotaStore::open(&path).unwrap();
            store.add_database(5).unwrap();
            store.set_quota_config(5, 100, QuotaType::Schema, 10).unwrap();
        }
        let store = QuotaStore::open(&path).unwrap();
        assert_eq!(store.list_databases().unwrap(), vec![5]);
        assert_eq!(store.load_quota_limits(5).unwrap().len(), 1);
    }
}
