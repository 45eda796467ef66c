//! Segment gRPC service implementation

use diskquota_common::{FetchMode, NodeRole, QuotaType, CLUSTER_SEG_ID};
use diskquota_proto::segment::{
    segment_service_server::SegmentService, DbListOp, FetchTableStatRequest,
    FetchTableStatResponse, RelationSizeRequest, RelationSizeResponse, SetPausedRequest,
    SetPausedResponse, SyncBlocklistRequest, SyncBlocklistResponse, TableStatRow,
    UpdateDatabaseListRequest, UpdateDatabaseListResponse,
};
use diskquota_quota::{BlockEntry, BlockKey, Blocklist};
use diskquota_segment::SegmentStatService;
use diskquota_shmem::{MonitoredDbSet, PausedFlags};
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

/// gRPC shim over the shard-local quota state.
pub struct SegmentRpcService {
    stat: Arc<SegmentStatService>,
    monitored: Arc<MonitoredDbSet>,
    paused: Arc<PausedFlags>,
    blocklist: Arc<Blocklist>,
}

impl SegmentRpcService {
    pub fn new(
        stat: Arc<SegmentStatService>,
        monitored: Arc<MonitoredDbSet>,
        paused: Arc<PausedFlags>,
        blocklist: Arc<Blocklist>,
    ) -> Self {
        Self {
            stat,
            monitored,
            paused,
            blocklist,
        }
    }
}

#[tonic::async_trait]
impl SegmentService for SegmentRpcService {
    async fn fetch_table_stat(
        &self,
        request: Request<FetchTableStatRequest>,
    ) -> Result<Response<FetchTableStatResponse>, Status> {
        let req = request.into_inner();
        let mode = FetchMode::from_i32(req.mode)
            .ok_or_else(|| Status::invalid_argument(format!("unknown fetch mode {}", req.mode)))?;

        debug!(db = req.db, ?mode, oids = req.oids.len(), "FetchTableStat");
        let rows = self.stat.fetch_table_stat(mode, req.db, &req.oids);

        // v1 callers understand two columns: everything collapses onto the
        // implicit cluster row
        let legacy = req.stat_columns == 2;
        let rows = rows
            .into_iter()
            .map(|r| TableStatRow {
                oid: r.oid,
                size_bytes: r.size_bytes,
                seg_id: if legacy {
                    CLUSTER_SEG_ID as i32
                } else {
                    r.seg_id as i32
                },
            })
            .collect();
        Ok(Response::new(FetchTableStatResponse { rows }))
    }

    async fn relation_size(
        &self,
        request: Request<RelationSizeRequest>,
    ) -> Result<Response<RelationSizeResponse>, Status> {
        let req = request.into_inner();
        let size_bytes =
            self.stat
                .sizer()
                .relation_size_local(req.db, req.tablespace, req.relfilenode, req.is_temp);
        Ok(Response::new(RelationSizeResponse { size_bytes }))
    }

    async fn update_database_list(
        &self,
        request: Request<UpdateDatabaseListRequest>,
    ) -> Result<Response<UpdateDatabaseListResponse>, Status> {
        let req = request.into_inner();
        match req.op() {
            DbListOp::DbListAdd => {
                self.monitored
                    .add(req.db)
                    .map_err(|e| Status::resource_exhausted(e.to_string()))?;
                info!(db = req.db, "database added to monitored set");
            }
            DbListOp::DbListRemove => {
                if !self.monitored.remove(req.db) {
                    warn!(db = req.db, "database was not in the monitored set");
                }
                self.blocklist.invalidate_db(req.db);
            }
        }
        Ok(Response::new(UpdateDatabaseListResponse {}))
    }

    async fn set_paused(
        &self,
        request: Request<SetPausedRequest>,
    ) -> Result<Response<SetPausedResponse>, Status> {
        let req = request.into_inner();
        info!(db = req.db, paused = req.paused, "pause flag updated");
        self.paused.set_paused(req.db, req.paused);
        Ok(Response::new(SetPausedResponse {}))
    }

    async fn sync_blocklist(
        &self,
        request: Request<SyncBlocklistRequest>,
    ) -> Result<Response<SyncBlocklistResponse>, Status> {
        let req = request.into_inner();
        let mut rows = Vec::with_capacity(req.rows.len());
        for row in req.rows {
            let Some(quota_type) = QuotaType::from_u32(row.quota_type) else {
                warn!(quota_type = row.quota_type, "dropping blocklist row with unknown type");
                continue;
            };
            rows.push((
                BlockKey {
                    target_oid: row.target_oid,
                    db: row.db,
                    tablespace: row.tablespace,
                    quota_type,
                },
                BlockEntry {
                    seg_exceeded: row.seg_exceeded,
                },
            ));
        }
        debug!(db = req.db, rows = rows.len(), "blocklist synced");
        self.blocklist.replace_db(req.db, rows);
        Ok(Response::new(SyncBlocklistResponse {}))
    }
}

/// True when this node's role takes part in stat collection; used by main
/// to warn about misconfigured coordinators serving the segment port.
pub fn warn_if_not_segment(role: NodeRole) {
    if !matches!(role, NodeRole::Segment) {
        warn!(
            ?role,
            "node role does not collect active tables; stat calls will return empty sets"
        );
    }
}
