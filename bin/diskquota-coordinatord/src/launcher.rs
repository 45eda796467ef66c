//! The launcher: one singleton task owning the per-database workers.
//!
//! At startup it revives a worker for every persisted monitored database;
//! afterwards it serves the DDL mailbox, one command at a time. Workers
//! that die unexpectedly are restarted after a backoff; a restarted worker
//! cold-starts from the persisted table sizes.

use crate::fanout::Fanout;
use crate::worker::Worker;
use diskquota_catalog::Catalog;
use diskquota_common::{DdlCommand, DdlResult, Oid, MAX_NUM_MONITORED_DB};
use diskquota_quota::Blocklist;
use diskquota_shmem::{DdlEnvelope, MonitoredDbSet, PausedFlags};
use diskquota_store::QuotaStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Delay before restarting a crashed worker.
const RESTART_BACKOFF: Duration = Duration::from_secs(5);

struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    epoch_rx: watch::Receiver<u64>,
}

/// Shared dependencies every worker is built from.
#[derive(Clone)]
pub struct WorkerDeps {
    pub naptime: Duration,
    pub store: Arc<QuotaStore>,
    pub fanout: Arc<Fanout>,
    pub catalog: Arc<dyn Catalog>,
    pub blocklist: Arc<Blocklist>,
    pub paused: Arc<PausedFlags>,
}

pub struct Launcher {
    deps: WorkerDeps,
    monitored: Arc<MonitoredDbSet>,
    workers: Mutex<HashMap<Oid, WorkerHandle>>,
}

impl Launcher {
    /// Build the launcher, revive persisted workers, and start serving the
    /// mailbox.
    pub async fn spawn(
        deps: WorkerDeps,
        mut mailbox_rx: mpsc::Receiver<DdlEnvelope>,
    ) -> Arc<Launcher> {
        let launcher = Arc::new(Launcher {
            deps,
            monitored: Arc::new(MonitoredDbSet::new(MAX_NUM_MONITORED_DB)),
            workers: Mutex::new(HashMap::new()),
        });

        match launcher.deps.store.list_databases() {
            Ok(dbs) => {
                for db in dbs {
                    if let Err(e) = launcher.monitored.add(db) {
                        error!(db, error = %e, "persisted database exceeds monitor capacity");
                        continue;
                    }
                    launcher.deps.fanout.dispatch_database_list(db, true).await;
                    launcher.start_worker(db);
                    info!(db, "revived worker for persisted database");
                }
            }
            Err(e) => error!(error = %e, "could not load the persisted database list"),
        }

        let serving = launcher.clone();
        tokio::spawn(async move {
            while let Some(envelope) = mailbox_rx.recv().await {
                let result = match envelope.cmd {
                    DdlCommand::CreateExtension => serving.handle_create(envelope.db).await,
                    DdlCommand::DropExtension => serving.handle_drop(envelope.db).await,
                };
                // a requester that timed out dropped its receiver; fine
                let _ = envelope.reply.send(result);
            }
            info!("launcher mailbox closed");
        });

        launcher
    }

    pub fn monitored(&self) -> &Arc<MonitoredDbSet> {
        &self.monitored
    }

    /// Epoch channel of one database's worker, if it is running.
    pub fn epoch_rx(&self, db: Oid) -> Option<watch::Receiver<u64>> {
        self.workers.lock().get(&db).map(|h| h.epoch_rx.clone())
    }

    pub fn current_epoch(&self, db: Oid) -> Option<u64> {
        self.workers.lock().get(&db).map(|h| *h.epoch_rx.borrow())
    }

    async fn handle_create(&self, db: Oid) -> DdlResult {
        if self.workers.lock().contains_key(&db) {
            return DdlResult::Ok;
        }
        if self.monitored.add(db).is_err() {
            return DdlResult::Exceed;
        }
        if let Err(e) = self.deps.store.add_database(db) {
            error!(db, error = %e, "persisting the monitored database failed");
            self.monitored.remove(db);
            return DdlResult::AddToDbFailed;
        }
        self.deps.fanout.dispatch_database_list(db, true).await;
        self.start_worker(db);
        info!(db, "database enabled for quota monitoring");
        DdlResult::Ok
    }

    async fn handle_drop(&self, db: Oid) -> DdlResult {
        self.stop_worker(db);
        self.monitored.remove(db);
        self.deps.paused.set_paused(db, false);
        self.deps.blocklist.invalidate_db(db);
        self.deps.fanout.dispatch_database_list(db, false).await;
        self.deps.fanout.dispatch_blocklist(db, Vec::new()).await;
        if let Err(e) = self.deps.store.remove_database(db) {
            error!(db, error = %e, "unpersisting the monitored database failed");
            return DdlResult::DelFromDbFailed;
        }
        info!(db, "database disabled for quota monitoring");
        DdlResult::Ok
    }

    fn start_worker(&self, db: Oid) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let deps = self.deps.clone();

        tokio::spawn(async move {
            loop {
                let worker = Worker::new(
                    db,
                    deps.naptime,
                    deps.store.clone(),
                    deps.fanout.clone(),
                    deps.catalog.clone(),
                    deps.blocklist.clone(),
                    deps.paused.clone(),
                    epoch_tx.clone(),
                );
                let run = tokio::spawn(worker.run(shutdown_rx.clone()));
                match run.await {
                    Ok(()) => break,
                    Err(e) => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        warn!(db, error = %e, "quota worker died, restarting after backoff");
                        tokio::time::sleep(RESTART_BACKOFF).await;
                    }
                }
            }
        });

        self.workers.lock().insert(
            db,
            WorkerHandle {
                shutdown_tx,
                epoch_rx,
            },
        );
    }

    fn stop_worker(&self, db: Oid) {
        if let Some(handle) = self.workers.lock().remove(&db) {
            let _ = handle.shutdown_tx.send(true);
        }
    }
}
