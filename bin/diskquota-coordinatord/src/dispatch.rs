//! The opaque-RPC seam between the coordinator and its segments.
//!
//! The worker and management paths talk to segments only through
//! `SegmentDispatch`; the gRPC implementation keeps one lazily-connected
//! channel per segment. Tests substitute an in-process implementation.

use async_trait::async_trait;
use diskquota_common::{Error, FetchMode, Oid, Result, TableStat};
use diskquota_proto::segment::{
    segment_service_client::SegmentServiceClient, BlocklistRow, DbListOp, FetchTableStatRequest,
    RelationSizeRequest, SetPausedRequest, SyncBlocklistRequest, UpdateDatabaseListRequest,
};
use diskquota_quota::{BlockEntry, BlockKey};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tonic::transport::Channel;

/// Timeout for individual segment calls.
const SEGMENT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait SegmentDispatch: Send + Sync {
    fn seg_count(&self) -> usize;

    async fn fetch_table_stat(
        &self,
        seg_index: usize,
        mode: FetchMode,
        db: Oid,
        oids: &[Oid],
        stat_columns: u32,
    ) -> Result<Vec<TableStat>>;

    async fn relation_size(
        &self,
        seg_index: usize,
        db: Oid,
        tablespace: Oid,
        relfilenode: Oid,
        is_temp: bool,
    ) -> Result<u64>;

    async fn update_database_list(&self, seg_index: usize, db: Oid, add: bool) -> Result<()>;

    async fn set_paused(&self, seg_index: usize, db: Oid, paused: bool) -> Result<()>;

    async fn sync_blocklist(
        &self,
        seg_index: usize,
        db: Oid,
        rows: Vec<(BlockKey, BlockEntry)>,
    ) -> Result<()>;
}

/// gRPC-backed dispatcher with a per-segment connection pool.
pub struct GrpcDispatcher {
    endpoints: Vec<String>,
    clients: Mutex<HashMap<usize, SegmentServiceClient<Channel>>>,
}

impl GrpcDispatcher {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, seg_index: usize) -> Result<SegmentServiceClient<Channel>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&seg_index) {
            return Ok(client.clone());
        }
        let endpoint = self
            .endpoints
            .get(seg_index)
            .ok_or_else(|| Error::Rpc(format!("no endpoint for segment {seg_index}")))?
            .clone();
        let client = SegmentServiceClient::connect(endpoint.clone())
            .await
            .map_err(|e| Error::Rpc(format!("connect {endpoint}: {e}")))?;
        clients.insert(seg_index, client.clone());
        Ok(client)
    }

    fn drop_client(&self, seg_index: usize) {
        if let Ok(mut clients) = self.clients.try_lock() {
            clients.remove(&seg_index);
        }
    }

    async fn with_timeout<T>(
        &self,
        seg_index: usize,
        fut: impl std::future::Future<Output = std::result::Result<T, tonic::Status>>,
    ) -> Result<T> {
        match tokio::time::timeout(SEGMENT_RPC_TIMEOUT, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(status)) => {
                self.drop_client(seg_index);
                Err(Error::Rpc(format!("segment {seg_index}: {status}")))
            }
            Err(_) => {
                self.drop_client(seg_index);
                Err(Error::Rpc(format!("segment {seg_index}: timeout")))
            }
        }
    }
}

#[async_trait]
impl SegmentDispatch for GrpcDispatcher {
    fn seg_count(&self) -> usize {
        self.endpoints.len()
    }

    async fn fetch_table_stat(
        &self,
        seg_index: usize,
        mode: FetchMode,
        db: Oid,
        oids: &[Oid],
        stat_columns: u32,
    ) -> Result<Vec<TableStat>> {
        let mut client = self.client(seg_index).await?;
        let request = FetchTableStatRequest {
            mode: mode as i32,
            db,
            oids: oids.to_vec(),
            stat_columns,
        };
        let response = self
            .with_timeout(seg_index, client.fetch_table_stat(request))
            .await?;
        Ok(response
            .into_inner()
            .rows
            .into_iter()
            .map(|r| TableStat {
                oid: r.oid,
                size_bytes: r.size_bytes,
                seg_id: r.seg_id as i16,
            })
            .collect())
    }

    async fn relation_size(
        &self,
        seg_index: usize,
        db: Oid,
        tablespace: Oid,
        relfilenode: Oid,
        is_temp: bool,
    ) -> Result<u64> {
        let mut client = self.client(seg_index).await?;
        let request = RelationSizeRequest {
            db,
            tablespace,
            relfilenode,
            is_temp,
        };
        let response = self
            .with_timeout(seg_index, client.relation_size(request))
            .await?;
        Ok(response.into_inner().size_bytes)
    }

    async fn update_database_list(&self, seg_index: usize, db: Oid, add: bool) -> Result<()> {
        let mut client = self.client(seg_index).await?;
        let op = if add {
            DbListOp::DbListAdd
        } else {
            DbListOp::DbListRemove
        };
        let request = UpdateDatabaseListRequest { db, op: op as i32 };
        self.with_timeout(seg_index, client.update_database_list(request))
            .await?;
        Ok(())
    }

    async fn set_paused(&self, seg_index: usize, db: Oid, paused: bool) -> Result<()> {
        let mut client = self.client(seg_index).await?;
        let request = SetPausedRequest { db, paused };
        self.with_timeout(seg_index, client.set_paused(request))
            .await?;
        Ok(())
    }

    async fn sync_blocklist(
        &self,
        seg_index: usize,
        db: Oid,
        rows: Vec<(BlockKey, BlockEntry)>,
    ) -> Result<()> {
        let mut client = self.client(seg_index).await?;
        let rows = rows
            .into_iter()
            .map(|(key, entry)| BlocklistRow {
                target_oid: key.target_oid,
                db: key.db,
                tablespace: key.tablespace,
                quota_type: key.quota_type as u32,
                seg_exceeded: entry.seg_exceeded,
            })
            .collect();
        let request = SyncBlocklistRequest { db, rows };
        self.with_timeout(seg_index, client.sync_blocklist(request))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-process dispatcher for worker and fanout tests: fixed per-segment
    //! stat tables, optional failing segments.

    use super::SegmentDispatch;
    use async_trait::async_trait;
    use diskquota_common::{
        Error, FetchMode, Oid, Result, SegId, TableStat, CLUSTER_SEG_ID,
    };
    use diskquota_quota::{BlockEntry, BlockKey};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    pub struct LocalDispatch {
        pub per_seg: Mutex<Vec<HashMap<Oid, u64>>>,
        pub failing: Vec<usize>,
        pub blocklist_pushes: Mutex<Vec<(usize, Oid, usize)>>,
    }

    impl LocalDispatch {
        pub fn new(per_seg: Vec<HashMap<Oid, u64>>) -> Self {
            Self {
                per_seg: Mutex::new(per_seg),
                failing: Vec::new(),
                blocklist_pushes: Mutex::new(Vec::new()),
            }
        }

        pub fn set_size(&self, seg: usize, oid: Oid, size: u64) {
            self.per_seg.lock()[seg].insert(oid, size);
        }
    }

    #[async_trait]
    impl SegmentDispatch for LocalDispatch {
        fn seg_count(&self) -> usize {
            self.per_seg.lock().len()
        }

        async fn fetch_table_stat(
            &self,
            seg_index: usize,
            mode: FetchMode,
            _db: Oid,
            oids: &[Oid],
            stat_columns: u32,
        ) -> Result<Vec<TableStat>> {
            if self.failing.contains(&seg_index) {
                return Err(Error::Rpc(format!("segment {seg_index} down")));
            }
            let per_seg = self.per_seg.lock();
            let table = &per_seg[seg_index];
            let rows = match mode {
                FetchMode::ActiveOids => table
                    .keys()
                    .map(|&oid| TableStat {
                        oid,
                        size_bytes: 0,
                        seg_id: CLUSTER_SEG_ID,
                    })
                    .collect(),
                FetchMode::ActiveSize => oids
                    .iter()
                    .map(|&oid| TableStat {
                        oid,
                        size_bytes: table.get(&oid).copied().unwrap_or(0),
                        seg_id: if stat_columns == 2 {
                            CLUSTER_SEG_ID
                        } else {
                            seg_index as SegId
                        },
                    })
                    .collect(),
            };
            Ok(rows)
        }

        async fn relation_size(
            &self,
            seg_index: usize,
            _db: Oid,
            _tablespace: Oid,
            relfilenode: Oid,
            _is_temp: bool,
        ) -> Result<u64> {
            if self.failing.contains(&seg_index) {
                return Err(Error::Rpc(format!("segment {seg_index} down")));
            }
            Ok(self.per_seg.lock()[seg_index]
                .get(&relfilenode)
                .copied()
                .unwrap_or(0))
        }

        async fn update_database_list(&self, _seg: usize, _db: Oid, _add: bool) -> Result<()> {
            Ok(())
        }

        async fn set_paused(&self, _seg: usize, _db: Oid, _paused: bool) -> Result<()> {
            Ok(())
        }

        async fn sync_blocklist(
            &self,
            seg_index: usize,
            db: Oid,
            rows: Vec<(BlockKey, BlockEntry)>,
        ) -> Result<()> {
            self.blocklist_pushes
                .lock()
                .push((seg_index, db, rows.len()));
            Ok(())
        }
    }
}
