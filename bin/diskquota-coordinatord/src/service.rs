//! Management gRPC service implementation

use crate::fanout::Fanout;
use crate::launcher::Launcher;
use crate::worker::wait_for_new_epoch;
use diskquota_catalog::Catalog;
use diskquota_common::{
    parse_size_mb, DdlCommand, DdlResult, Error, Oid, QuotaState, QuotaType, CLUSTER_SEG_ID,
};
use diskquota_proto::manage::{
    management_service_server::ManagementService, DatabaseRequest, DdlResponse,
    InitTableSizeTableResponse, ManageRelationSizeRequest, ManageRelationSizeResponse,
    PauseResponse, QuotaView, SetPerSegmentQuotaRequest, SetQuotaRequest, SetQuotaResponse,
    SetTablespaceQuotaRequest, ShowQuotaRequest, ShowQuotaResponse, StatusResponse,
    WaitForWorkerNewEpochResponse,
};
use diskquota_quota::Blocklist;
use diskquota_segment::RelationSizer;
use diskquota_shmem::{DdlMailbox, PausedFlags};
use diskquota_store::QuotaStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tonic::{Request, Response, Status};
use tracing::info;

/// How long a requester waits for the launcher's verdict.
const DDL_WAIT_TIMEOUT: Duration = Duration::from_secs(120);

pub struct ManagementRpcService {
    mailbox: Arc<DdlMailbox>,
    launcher: Arc<Launcher>,
    store: Arc<QuotaStore>,
    catalog: Arc<dyn Catalog>,
    fanout: Arc<Fanout>,
    paused: Arc<PausedFlags>,
    blocklist: Arc<Blocklist>,
    local_sizer: RelationSizer,
}

impl ManagementRpcService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mailbox: Arc<DdlMailbox>,
        launcher: Arc<Launcher>,
        store: Arc<QuotaStore>,
        catalog: Arc<dyn Catalog>,
        fanout: Arc<Fanout>,
        paused: Arc<PausedFlags>,
        blocklist: Arc<Blocklist>,
        local_sizer: RelationSizer,
    ) -> Self {
        Self {
            mailbox,
            launcher,
            store,
            catalog,
            fanout,
            paused,
            blocklist,
            local_sizer,
        }
    }

    fn database_oid(&self, name: &str) -> Result<Oid, Status> {
        self.catalog
            .database_oid(name)
            .ok_or_else(|| Status::not_found(format!("database \"{name}\" does not exist")))
    }

    fn namespace_oid(&self, name: &str) -> Result<Oid, Status> {
        self.catalog
            .namespace_oid(&name.to_lowercase())
            .ok_or_else(|| Status::not_found(format!("schema \"{name}\" does not exist")))
    }

    fn role_oid(&self, name: &str) -> Result<Oid, Status> {
        self.catalog
            .role_oid(&name.to_lowercase())
            .ok_or_else(|| Status::not_found(format!("role \"{name}\" does not exist")))
    }

    fn tablespace_oid(&self, name: &str) -> Result<Oid, Status> {
        self.catalog
            .tablespace_oid(&name.to_lowercase())
            .ok_or_else(|| Status::not_found(format!("tablespace \"{name}\" does not exist")))
    }

    fn parse_size(&self, size: &str) -> Result<i64, Status> {
        parse_size_mb(size).map_err(|e| Status::invalid_argument(e.to_string()))
    }

    /// Set a plain (schema or role) quota.
    async fn set_plain_quota(
        &self,
        req: SetQuotaRequest,
        quota_type: QuotaType,
    ) -> Result<Response<SetQuotaResponse>, Status> {
        let db = self.database_oid(&req.database)?;
        let target = if quota_type.targets_role() {
            self.role_oid(&req.target)?
        } else {
            self.namespace_oid(&req.target)?
        };
        let limit_mb = self.parse_size(&req.size)?;

        self.store
            .set_quota_config(db, target, quota_type, limit_mb)
            .map_err(storage_status)?;
        info!(db, target, ?quota_type, limit_mb, "quota configured");
        Ok(Response::new(SetQuotaResponse {}))
    }

    /// Set a tablespace-qualified quota: the binding row first, then the
    /// limit row, as the original does.
    async fn set_tablespace_quota(
        &self,
        req: SetTablespaceQuotaRequest,
        quota_type: QuotaType,
    ) -> Result<Response<SetQuotaResponse>, Status> {
        let db = self.database_oid(&req.database)?;
        let target = if quota_type.targets_role() {
            self.role_oid(&req.target)?
        } else {
            self.namespace_oid(&req.target)?
        };
        let tablespace = self.tablespace_oid(&req.tablespace)?;
        let limit_mb = self.parse_size(&req.size)?;

        self.store
            .set_target(db, quota_type, target, tablespace, limit_mb)
            .map_err(storage_status)?;
        self.store
            .set_quota_config(db, target, quota_type, limit_mb)
            .map_err(storage_status)?;
        info!(db, target, tablespace, ?quota_type, limit_mb, "tablespace quota configured");
        Ok(Response::new(SetQuotaResponse {}))
    }

    async fn set_paused_everywhere(&self, db: Oid, paused: bool) {
        self.paused.set_paused(db, paused);
        self.fanout.dispatch_paused(db, paused).await;
    }
}

fn storage_status(e: impl Into<Error>) -> Status {
    Status::internal(e.into().to_string())
}

fn ddl_response(result: DdlResult, hint: Option<String>) -> DdlResponse {
    let message = match (&result, hint) {
        (DdlResult::Ok, Some(hint)) => hint,
        _ => result.describe().to_string(),
    };
    DdlResponse {
        result: result as u32,
        message,
    }
}

#[tonic::async_trait]
impl ManagementService for ManagementRpcService {
    async fn enable_database(
        &self,
        request: Request<DatabaseRequest>,
    ) -> Result<Response<DdlResponse>, Status> {
        let req = request.into_inner();
        let db = self.database_oid(&req.database)?;

        let result = self
            .mailbox
            .request(DdlCommand::CreateExtension, db, DDL_WAIT_TIMEOUT)
            .await;

        let mut hint = None;
        if result == DdlResult::Ok {
            if self.catalog.list_relations(db).is_empty() {
                self.store
                    .set_state(db, QuotaState::Ready)
                    .map_err(storage_status)?;
            } else {
                hint = Some(
                    "database is not empty, please run init_table_size_table to initialize \
                     size information; for a large database this may take a while"
                        .to_string(),
                );
            }
        }
        Ok(Response::new(ddl_response(result, hint)))
    }

    async fn disable_database(
        &self,
        request: Request<DatabaseRequest>,
    ) -> Result<Response<DdlResponse>, Status> {
        let req = request.into_inner();
        let db = self.database_oid(&req.database)?;
        let result = self
            .mailbox
            .request(DdlCommand::DropExtension, db, DDL_WAIT_TIMEOUT)
            .await;
        Ok(Response::new(ddl_response(result, None)))
    }

    async fn set_schema_quota(
        &self,
        request: Request<SetQuotaRequest>,
    ) -> Result<Response<SetQuotaResponse>, Status> {
        self.set_plain_quota(request.into_inner(), QuotaType::Schema)
            .await
    }

    async fn set_role_quota(
        &self,
        request: Request<SetQuotaRequest>,
    ) -> Result<Response<SetQuotaResponse>, Status> {
        self.set_plain_quota(request.into_inner(), QuotaType::Role)
            .await
    }

    async fn set_schema_tablespace_quota(
        &self,
        request: Request<SetTablespaceQuotaRequest>,
    ) -> Result<Response<SetQuotaResponse>, Status> {
        self.set_tablespace_quota(request.into_inner(), QuotaType::SchemaTablespace)
            .await
    }

    async fn set_role_tablespace_quota(
        &self,
        request: Request<SetTablespaceQuotaRequest>,
    ) -> Result<Response<SetQuotaResponse>, Status> {
        self.set_tablespace_quota(request.into_inner(), QuotaType::RoleTablespace)
            .await
    }

    async fn set_per_segment_quota(
        &self,
        request: Request<SetPerSegmentQuotaRequest>,
    ) -> Result<Response<SetQuotaResponse>, Status> {
        let req = request.into_inner();
        let db = self.database_oid(&req.database)?;
        let tablespace = self.tablespace_oid(&req.tablespace)?;
        if req.ratio <= 0.0 {
            return Err(Status::invalid_argument(
                Error::InvalidSegRatio(req.ratio).to_string(),
            ));
        }
        let updated = self
            .store
            .set_seg_ratio(db, tablespace, req.ratio)
            .map_err(|e| Status::failed_precondition(e.to_string()))?;
        info!(db, tablespace, ratio = req.ratio, updated, "per-segment ratio configured");
        Ok(Response::new(SetQuotaResponse {}))
    }

    async fn pause(
        &self,
        request: Request<DatabaseRequest>,
    ) -> Result<Response<PauseResponse>, Status> {
        let req = request.into_inner();
        let db = self.database_oid(&req.database)?;
        info!(db, "pausing quota enforcement");
        self.set_paused_everywhere(db, true).await;
        Ok(Response::new(PauseResponse {}))
    }

    async fn resume(
        &self,
        request: Request<DatabaseRequest>,
    ) -> Result<Response<PauseResponse>, Status> {
        let req = request.into_inner();
        let db = self.database_oid(&req.database)?;
        info!(db, "resuming quota enforcement");
        self.set_paused_everywhere(db, false).await;
        Ok(Response::new(PauseResponse {}))
    }

    async fn init_table_size_table(
        &self,
        request: Request<DatabaseRequest>,
    ) -> Result<Response<InitTableSizeTableResponse>, Status> {
        let req = request.into_inner();
        let db = self.database_oid(&req.database)?;

        let oids = self.catalog.list_relations(db);
        let rows = self.fanout.recompute_all(db, &oids).await;
        self.store
            .replace_table_sizes(db, &rows)
            .map_err(storage_status)?;
        self.store
            .set_state(db, QuotaState::Ready)
            .map_err(storage_status)?;

        info!(db, relations = oids.len(), "table size table initialized");
        Ok(Response::new(InitTableSizeTableResponse {
            relations: oids.len() as u64,
        }))
    }

    async fn wait_for_worker_new_epoch(
        &self,
        request: Request<DatabaseRequest>,
    ) -> Result<Response<WaitForWorkerNewEpochResponse>, Status> {
        let req = request.into_inner();
        let db = self.database_oid(&req.database)?;
        let epoch_rx = self.launcher.epoch_rx(db).ok_or_else(|| {
            Status::failed_precondition(Error::DatabaseNotMonitored(db).to_string())
        })?;
        let epoch = wait_for_new_epoch(epoch_rx).await;
        Ok(Response::new(WaitForWorkerNewEpochResponse { epoch }))
    }

    async fn relation_size(
        &self,
        request: Request<ManageRelationSizeRequest>,
    ) -> Result<Response<ManageRelationSizeResponse>, Status> {
        let req = request.into_inner();
        let db = self.database_oid(&req.database)?;
        let relid = self
            .catalog
            .relation_by_name(db, &req.relation)
            .ok_or_else(|| {
                Status::not_found(format!("relation \"{}\" does not exist", req.relation))
            })?;
        let meta = self
            .catalog
            .relation(relid)
            .ok_or_else(|| Status::not_found(Error::UnknownRelation(relid).to_string()))?;

        let mut size_bytes = self
            .fanout
            .relation_size(db, meta.tablespace, meta.relfilenode, meta.is_temp())
            .await;
        size_bytes += self.local_sizer.relation_size_local(
            db,
            meta.tablespace,
            meta.relfilenode,
            meta.is_temp(),
        );
        Ok(Response::new(ManageRelationSizeResponse { size_bytes }))
    }

    async fn show_quota(
        &self,
        request: Request<ShowQuotaRequest>,
    ) -> Result<Response<ShowQuotaResponse>, Status> {
        let req = request.into_inner();
        let db = self.database_oid(&req.database)?;
        let quota_type = QuotaType::from_u32(req.quota_type)
            .ok_or_else(|| Status::invalid_argument("unknown quota type"))?;

        // cluster-total usage per target, from the persisted sizes
        let mut used: HashMap<(Oid, Oid), u64> = HashMap::new();
        let sizes = self
            .store
            .load_table_sizes(db, self.fanout.version())
            .map_err(storage_status)?;
        for row in sizes {
            if row.seg_id != CLUSTER_SEG_ID {
                continue;
            }
            let Some(meta) = self.catalog.relation(row.oid) else {
                continue;
            };
            let target = if quota_type.targets_role() {
                meta.owner
            } else {
                meta.namespace
            };
            let spc = if quota_type.is_tablespace_qualified() {
                meta.tablespace
            } else {
                0
            };
            *used.entry((target, spc)).or_insert(0) += row.size_bytes;
        }

        let limits = self.store.list_quota_configs(db).map_err(storage_status)?;
        let mut rows = Vec::new();
        for limit in limits {
            if limit.quota_type != quota_type {
                continue;
            }
            let target_name = if quota_type.targets_role() {
                self.catalog.role_name(limit.target_oid)
            } else {
                self.catalog.namespace_name(limit.target_oid)
            }
            .unwrap_or_else(|| limit.target_oid.to_string());
            let tablespace_name = if quota_type.is_tablespace_qualified() {
                self.catalog
                    .tablespace_name(limit.tablespace)
                    .unwrap_or_else(|| limit.tablespace.to_string())
            } else {
                String::new()
            };
            let spc_key = if quota_type.is_tablespace_qualified() {
                limit.tablespace
            } else {
                0
            };
            rows.push(QuotaView {
                target_name,
                tablespace_name,
                quota_mb: limit.limit_mb,
                used_bytes: used.get(&(limit.target_oid, spc_key)).copied().unwrap_or(0),
            });
        }
        rows.sort_by(|a, b| a.target_name.cmp(&b.target_name));
        Ok(Response::new(ShowQuotaResponse { rows }))
    }

    async fn status(
        &self,
        request: Request<DatabaseRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let req = request.into_inner();
        let db = self.database_oid(&req.database)?;
        let ready = self
            .store
            .state(db)
            .map(|s| s == QuotaState::Ready)
            .unwrap_or(false);
        Ok(Response::new(StatusResponse {
            epoch: self.launcher.current_epoch(db).unwrap_or(0),
            paused: self.paused.is_paused(db),
            ready,
            blocklist_len: self.blocklist.len() as u32,
            monitored_dbs: self.launcher.monitored().list(),
        }))
    }
}
