//! Worker-local quota model.
//!
//! Holds the incremental (relation, shard) → size map and the four
//! per-target usage maps. Only deltas flow into the usage maps, so a
//! relation whose schema or owner changes transfers its full size between
//! keys instead of being recounted.

use crate::blocklist::{BlockKey, LocalBlockEntry};
use diskquota_catalog::Catalog;
use diskquota_common::{
    Oid, QuotaType, SchemaVersion, SegId, CLUSTER_SEG_ID, INVALID_OID, QUOTA_TYPES,
};
use std::collections::HashMap;
use tracing::warn;

const BYTES_PER_MB: i64 = 1 << 20;

/// One persisted size row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableSizeRow {
    pub oid: Oid,
    pub seg_id: SegId,
    pub size_bytes: u64,
}

/// One quota_config row as the model consumes it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuotaLimit {
    pub quota_type: QuotaType,
    pub target_oid: Oid,
    /// `INVALID_OID` unless the quota type is tablespace-qualified.
    pub tablespace: Oid,
    pub limit_mb: i64,
    pub seg_ratio: f32,
}

#[derive(Clone, Copy, Debug)]
struct TableSizeEntry {
    total_size: i64,
    namespace: Oid,
    owner: Oid,
    tablespace: Oid,
    exists: bool,
    need_flush: bool,
}

impl TableSizeEntry {
    fn fresh() -> Self {
        Self {
            total_size: 0,
            namespace: INVALID_OID,
            owner: INVALID_OID,
            tablespace: INVALID_OID,
            exists: false,
            need_flush: true,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct QuotaUsage {
    size: i64,
    limit: i64,
}

type QuotaKeys = [Oid; 2];

/// Upserts and deletes to apply to the persisted table_size table after an
/// epoch.
#[derive(Debug, Default)]
pub struct FlushBatch {
    pub upserts: Vec<TableSizeRow>,
    pub deletes: Vec<(Oid, SegId)>,
}

pub struct QuotaModel {
    db: Oid,
    seg_count: usize,
    table_sizes: HashMap<(Oid, SegId), TableSizeEntry>,
    quota_maps: [HashMap<(QuotaKeys, SegId), QuotaUsage>; 4],
    local_blocklist: HashMap<BlockKey, LocalBlockEntry>,
}

impl QuotaModel {
    pub fn new(db: Oid, seg_count: usize) -> Self {
        Self {
            db,
            seg_count,
            table_sizes: HashMap::new(),
            quota_maps: Default::default(),
            local_blocklist: HashMap::new(),
        }
    }

    pub fn db(&self) -> Oid {
        self.db
    }

    pub fn seg_count(&self) -> usize {
        self.seg_count
    }

    pub fn set_seg_count(&mut self, seg_count: usize) {
        self.seg_count = seg_count;
    }

    pub fn local_blocklist_mut(&mut self) -> &mut HashMap<BlockKey, LocalBlockEntry> {
        &mut self.local_blocklist
    }

    fn seg_ids(&self) -> std::ops::Range<SegId> {
        -1..self.seg_count as SegId
    }

    // ── Limits ────────────────────────────────────────────────────────────

    /// Reload the configured limits. Existing usage survives; every limit
    /// is reset first so deleted quota rows fall back to "no limit".
    pub fn load_limits(&mut self, rows: &[QuotaLimit]) {
        for map in &mut self.quota_maps {
            for usage in map.values_mut() {
                usage.limit = -1;
            }
        }
        for row in rows {
            if row.tablespace == INVALID_OID && row.quota_type.is_tablespace_qualified() {
                warn!(
                    target_oid = row.target_oid,
                    "tablespace-qualified quota row without a tablespace, skipping"
                );
                continue;
            }
            let keys = if row.quota_type.is_tablespace_qualified() {
                [row.target_oid, row.tablespace]
            } else {
                [row.target_oid, INVALID_OID]
            };
            self.set_limit(row.quota_type, keys, row.limit_mb, row.seg_ratio);
        }
    }

    fn set_limit(&mut self, quota_type: QuotaType, keys: QuotaKeys, limit_mb: i64, seg_ratio: f32) {
        let limit_bytes = limit_mb.saturating_mul(BYTES_PER_MB);
        let seg_count = self.seg_count.max(1);
        for seg_id in self.seg_ids() {
            let usage = self.quota_maps[quota_type as usize]
                .entry((keys, seg_id))
                .or_insert(QuotaUsage { size: 0, limit: -1 });
            usage.limit = if seg_id == CLUSTER_SEG_ID {
                limit_bytes
            } else if seg_ratio > 0.0 {
                ((limit_bytes as f64 / seg_count as f64) * seg_ratio as f64).round() as i64
            } else {
                -1
            };
        }
    }

    // ── Usage ─────────────────────────────────────────────────────────────

    fn update_size(&mut self, quota_type: QuotaType, keys: QuotaKeys, delta: i64, seg_id: SegId) {
        let usage = self.quota_maps[quota_type as usize]
            .entry((keys, seg_id))
            .or_insert(QuotaUsage { size: 0, limit: -1 });
        usage.size += delta;
    }

    fn transfer(
        &mut self,
        quota_type: QuotaType,
        old_keys: QuotaKeys,
        new_keys: QuotaKeys,
        size: i64,
        seg_id: SegId,
    ) {
        self.update_size(quota_type, old_keys, -size, seg_id);
        self.update_size(quota_type, new_keys, size, seg_id);
    }

    fn add_usage(&mut self, delta: i64, ns: Oid, owner: Oid, spc: Oid, seg_id: SegId) {
        self.update_size(QuotaType::Schema, [ns, INVALID_OID], delta, seg_id);
        self.update_size(QuotaType::Role, [owner, INVALID_OID], delta, seg_id);
        self.update_size(QuotaType::SchemaTablespace, [ns, spc], delta, seg_id);
        self.update_size(QuotaType::RoleTablespace, [owner, spc], delta, seg_id);
    }

    /// Fold one epoch's active sizes into the model.
    ///
    /// `active` holds the aggregated (relation, shard) sizes for relations
    /// seen this epoch, including the shard `-1` cluster totals. Relations
    /// absent from it keep their previous size. Drop, schema-change and
    /// owner-change events are detected against the catalog. With
    /// `is_init` the sizes came from the persisted table rather than the
    /// segments, so nothing is marked for re-persistence.
    pub fn update_usage(
        &mut self,
        active: &HashMap<(Oid, SegId), u64>,
        catalog: &dyn Catalog,
        is_init: bool,
    ) {
        for entry in self.table_sizes.values_mut() {
            entry.exists = false;
        }

        for relid in catalog.list_relations(self.db) {
            let Some(meta) = catalog.relation(relid) else {
                warn!(relid, "catalog lookup failed for relation");
                continue;
            };

            for seg_id in self.seg_ids() {
                let key = (relid, seg_id);
                let mut entry = *self.table_sizes.entry(key).or_insert_with(TableSizeEntry::fresh);
                entry.exists = true;

                if let Some(&size) = active.get(&key) {
                    let updated = size as i64;
                    let delta = updated - entry.total_size;
                    entry.total_size = updated;
                    entry.need_flush = true;
                    self.add_usage(delta, entry.namespace, entry.owner, entry.tablespace, seg_id);
                }

                if is_init {
                    entry.need_flush = false;
                }

                if entry.namespace != meta.namespace {
                    self.transfer(
                        QuotaType::Schema,
                        [entry.namespace, INVALID_OID],
                        [meta.namespace, INVALID_OID],
                        entry.total_size,
                        seg_id,
                    );
                    self.transfer(
                        QuotaType::SchemaTablespace,
                        [entry.namespace, entry.tablespace],
                        [meta.namespace, entry.tablespace],
                        entry.total_size,
                        seg_id,
                    );
                    entry.namespace = meta.namespace;
                }
                if entry.owner != meta.owner {
                    self.transfer(
                        QuotaType::Role,
                        [entry.owner, INVALID_OID],
                        [meta.owner, INVALID_OID],
                        entry.total_size,
                        seg_id,
                    );
                    self.transfer(
                        QuotaType::RoleTablespace,
                        [entry.owner, entry.tablespace],
                        [meta.owner, entry.tablespace],
                        entry.total_size,
                        seg_id,
                    );
                    entry.owner = meta.owner;
                }
                if entry.tablespace != meta.tablespace {
                    self.transfer(
                        QuotaType::SchemaTablespace,
                        [entry.namespace, entry.tablespace],
                        [entry.namespace, meta.tablespace],
                        entry.total_size,
                        seg_id,
                    );
                    self.transfer(
                        QuotaType::RoleTablespace,
                        [entry.owner, entry.tablespace],
                        [entry.owner, meta.tablespace],
                        entry.total_size,
                        seg_id,
                    );
                    entry.tablespace = meta.tablespace;
                }

                self.table_sizes.insert(key, entry);
            }
        }

        // dropped relations give their size back before their rows are
        // deleted in the flush pass
        let dropped: Vec<((Oid, SegId), TableSizeEntry)> = self
            .table_sizes
            .iter()
            .filter(|(_, e)| !e.exists)
            .map(|(k, e)| (*k, *e))
            .collect();
        for ((_, seg_id), entry) in dropped {
            self.add_usage(
                -entry.total_size,
                entry.namespace,
                entry.owner,
                entry.tablespace,
                seg_id,
            );
        }
    }

    // ── Evaluation ────────────────────────────────────────────────────────

    /// Walk the quota maps: retire targets that no longer exist, and stage
    /// a blocklist entry for every target at or over its limit. A limit of
    /// zero denies all writes for its target.
    pub fn evaluate(&mut self, catalog: &dyn Catalog) {
        for quota_type in QUOTA_TYPES {
            let idx = quota_type as usize;
            let mut stale = Vec::new();
            let mut exceeded = Vec::new();

            for (&(keys, seg_id), usage) in &self.quota_maps[idx] {
                let target_alive = if quota_type.targets_role() {
                    catalog.role_exists(keys[0])
                } else {
                    catalog.namespace_exists(keys[0])
                };
                let spc_alive = !quota_type.is_tablespace_qualified()
                    || catalog.tablespace_exists(keys[1]);
                if !target_alive || !spc_alive {
                    stale.push((keys, seg_id));
                    continue;
                }

                let deny_all = usage.limit == 0;
                if deny_all || (usage.limit > 0 && usage.size >= usage.limit) {
                    exceeded.push((keys, seg_id));
                }
            }

            for key in stale {
                self.quota_maps[idx].remove(&key);
            }
            for (keys, seg_id) in exceeded {
                let key = BlockKey {
                    target_oid: keys[0],
                    db: self.db,
                    tablespace: if quota_type.is_tablespace_qualified() {
                        keys[1]
                    } else {
                        INVALID_OID
                    },
                    quota_type,
                };
                let entry = self.local_blocklist.entry(key).or_default();
                entry.exceeded = true;
                if seg_id != CLUSTER_SEG_ID {
                    entry.seg_exceeded = true;
                }
            }
        }
    }

    // ── Persistence handoff ───────────────────────────────────────────────

    /// Collect the rows to persist after an epoch. Dropped relations leave
    /// the model here; refreshed relations are re-persisted once.
    pub fn take_flush_batch(&mut self, version: SchemaVersion) -> FlushBatch {
        let mut batch = FlushBatch::default();
        self.table_sizes.retain(|&(oid, seg_id), entry| {
            if !entry.exists {
                if version == SchemaVersion::V2 || seg_id == CLUSTER_SEG_ID {
                    batch.deletes.push((oid, seg_id));
                }
                return false;
            }
            if entry.need_flush {
                entry.need_flush = false;
                if version == SchemaVersion::V2 || seg_id == CLUSTER_SEG_ID {
                    batch.upserts.push(TableSizeRow {
                        oid,
                        seg_id,
                        size_bytes: entry.total_size.max(0) as u64,
                    });
                }
            }
            true
        });
        batch.upserts.sort_unstable_by_key(|r| (r.oid, r.seg_id));
        batch.deletes.sort_unstable();
        batch
    }

    /// Current usage of one target at one shard, for tests and views.
    pub fn usage_of(&self, quota_type: QuotaType, keys: QuotaKeys, seg_id: SegId) -> Option<i64> {
        self.quota_maps[quota_type as usize]
            .get(&(keys, seg_id))
            .map(|u| u.size)
    }
}
