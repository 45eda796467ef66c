//! Per-epoch fan-out to all segments and result aggregation.
//!
//! Segment failures are transient by design: a failed shard is logged and
//! skipped, its relations keep their last-known sizes until the next
//! epoch. No shared lock is ever held across these calls.

use crate::dispatch::SegmentDispatch;
use diskquota_common::{FetchMode, Oid, SchemaVersion, SegId, CLUSTER_SEG_ID};
use diskquota_quota::{BlockEntry, BlockKey, TableSizeRow};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// Maximum number of concurrent segment calls.
const MAX_CONCURRENT_CALLS: usize = 32;

pub struct Fanout {
    dispatch: Arc<dyn SegmentDispatch>,
    version: SchemaVersion,
}

impl Fanout {
    pub fn new(dispatch: Arc<dyn SegmentDispatch>, version: SchemaVersion) -> Self {
        Self { dispatch, version }
    }

    pub fn seg_count(&self) -> usize {
        self.dispatch.seg_count()
    }

    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    fn stat_columns(&self) -> u32 {
        self.version.stat_columns() as u32
    }

    /// Drain phase: ask every segment for its active relation oids and
    /// union the answers.
    pub async fn pull_active_oids(&self, db: Oid) -> HashSet<Oid> {
        let calls = (0..self.seg_count()).map(|seg| {
            let dispatch = self.dispatch.clone();
            let cols = self.stat_columns();
            async move {
                (
                    seg,
                    dispatch
                        .fetch_table_stat(seg, FetchMode::ActiveOids, db, &[], cols)
                        .await,
                )
            }
        });

        let mut oids = HashSet::new();
        let mut results = stream::iter(calls).buffer_unordered(MAX_CONCURRENT_CALLS);
        while let Some((seg, result)) = results.next().await {
            match result {
                Ok(rows) => oids.extend(rows.into_iter().map(|r| r.oid)),
                Err(e) => warn!(seg, db, error = %e, "drain phase failed for segment"),
            }
        }
        oids
    }

    /// Size phase: fetch per-shard sizes for the active set and aggregate
    /// the shard `-1` cluster totals.
    pub async fn pull_active_sizes(&self, db: Oid, oids: &[Oid]) -> HashMap<(Oid, SegId), u64> {
        let mut sizes: HashMap<(Oid, SegId), u64> = HashMap::new();
        if oids.is_empty() {
            return sizes;
        }

        let calls = (0..self.seg_count()).map(|seg| {
            let dispatch = self.dispatch.clone();
            let cols = self.stat_columns();
            let oids = oids.to_vec();
            async move {
                (
                    seg,
                    dispatch
                        .fetch_table_stat(seg, FetchMode::ActiveSize, db, &oids, cols)
                        .await,
                )
            }
        });

        let mut results = stream::iter(calls).buffer_unordered(MAX_CONCURRENT_CALLS);
        while let Some((seg, result)) = results.next().await {
            let rows = match result {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(seg, db, error = %e, "size phase failed for segment");
                    continue;
                }
            };
            for row in rows {
                if self.version == SchemaVersion::V2 {
                    sizes.insert((row.oid, row.seg_id), row.size_bytes);
                }
                *sizes.entry((row.oid, CLUSTER_SEG_ID)).or_insert(0) += row.size_bytes;
            }
        }
        sizes
    }

    /// Full-cluster recompute used by init_table_size_table: size every
    /// given relation on every segment and return persistable rows.
    pub async fn recompute_all(&self, db: Oid, oids: &[Oid]) -> Vec<TableSizeRow> {
        let sizes = self.pull_active_sizes(db, oids).await;
        let mut rows: Vec<TableSizeRow> = sizes
            .into_iter()
            .map(|((oid, seg_id), size_bytes)| TableSizeRow {
                oid,
                seg_id,
                size_bytes,
            })
            .collect();
        rows.sort_unstable_by_key(|r| (r.oid, r.seg_id));
        rows
    }

    /// Sum one relation's file size across every segment.
    pub async fn relation_size(
        &self,
        db: Oid,
        tablespace: Oid,
        relfilenode: Oid,
        is_temp: bool,
    ) -> u64 {
        let calls = (0..self.seg_count()).map(|seg| {
            let dispatch = self.dispatch.clone();
            async move {
                (
                    seg,
                    dispatch
                        .relation_size(seg, db, tablespace, relfilenode, is_temp)
                        .await,
                )
            }
        });

        let mut total = 0u64;
        let mut results = stream::iter(calls).buffer_unordered(MAX_CONCURRENT_CALLS);
        while let Some((seg, result)) = results.next().await {
            match result {
                Ok(size) => total += size,
                Err(e) => warn!(seg, db, error = %e, "relation_size failed for segment"),
            }
        }
        total
    }

    /// Propagate the paused flag cluster-wide.
    pub async fn dispatch_paused(&self, db: Oid, paused: bool) {
        for seg in 0..self.seg_count() {
            if let Err(e) = self.dispatch.set_paused(seg, db, paused).await {
                warn!(seg, db, error = %e, "pause dispatch failed for segment");
            }
        }
    }

    /// Add or remove a database in every segment's monitored set.
    pub async fn dispatch_database_list(&self, db: Oid, add: bool) {
        for seg in 0..self.seg_count() {
            if let Err(e) = self.dispatch.update_database_list(seg, db, add).await {
                warn!(seg, db, error = %e, "db-list dispatch failed for segment");
            }
        }
    }

    /// Push the database's current blocklist to every segment.
    pub async fn dispatch_blocklist(&self, db: Oid, rows: Vec<(BlockKey, BlockEntry)>) {
        for seg in 0..self.seg_count() {
            if let Err(e) = self
                .dispatch
                .sync_blocklist(seg, db, rows.clone())
                .await
            {
                warn!(seg, db, error = %e, "blocklist dispatch failed for segment");
            }
        }
    }
}

/// Aggregation identity over a size map: the cluster row equals the sum
/// of the shard rows.
#[cfg(test)]
pub fn aggregation_identity_holds(sizes: &HashMap<(Oid, SegId), u64>) -> bool {
    let mut totals: HashMap<Oid, u64> = HashMap::new();
    for (&(oid, seg_id), &size) in sizes {
        if seg_id != CLUSTER_SEG_ID {
            *totals.entry(oid).or_insert(0) += size;
        }
    }
    totals
        .into_iter()
        .all(|(oid, sum)| sizes.get(&(oid, CLUSTER_SEG_ID)) == Some(&sum))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::LocalDispatch;

    fn seg_table(entries: &[(Oid, u64)]) -> HashMap<Oid, u64> {
        entries.iter().copied().collect()
    }

    #[tokio::test]
    async fn drain_unions_active_sets() {
        let dispatch = Arc::new(LocalDispatch::new(vec![
            seg_table(&[(100, 10)]),
            seg_table(&[(100, 20), (200, 5)]),
        ]));
        let fanout = Fanout::new(dispatch, SchemaVersion::V2);
        let oids = fanout.pull_active_oids(1).await;
        assert_eq!(oids, HashSet::from([100, 200]));
    }

    #[tokio::test]
    async fn sizes_aggregate_with_cluster_totals() {
        let dispatch = Arc::new(LocalDispatch::new(vec![
            seg_table(&[(100, 10), (200, 1)]),
            seg_table(&[(100, 20)]),
            seg_table(&[(100, 30)]),
        ]));
        let fanout = Fanout::new(dispatch, SchemaVersion::V2);
        let sizes = fanout.pull_active_sizes(1, &[100, 200]).await;

        assert_eq!(sizes[&(100, CLUSTER_SEG_ID)], 60);
        assert_eq!(sizes[&(100, 0)], 10);
        assert_eq!(sizes[&(100, 2)], 30);
        assert_eq!(sizes[&(200, CLUSTER_SEG_ID)], 1);
        assert!(aggregation_identity_holds(&sizes));
    }

    #[tokio::test]
    async fn v1_keeps_only_cluster_rows() {
        let dispatch = Arc::new(LocalDispatch::new(vec![
            seg_table(&[(100, 10)]),
            seg_table(&[(100, 20)]),
        ]));
        let fanout = Fanout::new(dispatch, SchemaVersion::V1);
        let sizes = fanout.pull_active_sizes(1, &[100]).await;

        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[&(100, CLUSTER_SEG_ID)], 30);
    }

    #[tokio::test]
    async fn failed_segment_degrades_to_partial_data() {
        let mut dispatch = LocalDispatch::new(vec![
            seg_table(&[(100, 10)]),
            seg_table(&[(100, 20)]),
        ]);
        dispatch.failing.push(1);
        let fanout = Fanout::new(Arc::new(dispatch), SchemaVersion::V2);

        let sizes = fanout.pull_active_sizes(1, &[100]).await;
        assert_eq!(sizes[&(100, CLUSTER_SEG_ID)], 10);
        assert_eq!(sizes.get(&(100, 1)), None);
    }

    #[tokio::test]
    async fn relation_size_sums_across_segments() {
        let dispatch = Arc::new(LocalDispatch::new(vec![
            seg_table(&[(500, 4096)]),
            seg_table(&[(500, 8192)]),
        ]));
        let fanout = Fanout::new(dispatch, SchemaVersion::V2);
        assert_eq!(fanout.relation_size(1, 1663, 500, false).await, 12288);
    }

    #[tokio::test]
    async fn blocklist_reaches_every_segment() {
        let dispatch = Arc::new(LocalDispatch::new(vec![
            seg_table(&[]),
            seg_table(&[]),
            seg_table(&[]),
        ]));
        let fanout = Fanout::new(dispatch.clone(), SchemaVersion::V2);
        fanout.dispatch_blocklist(1, Vec::new()).await;
        assert_eq!(dispatch.blocklist_pushes.lock().len(), 3);
    }
}
