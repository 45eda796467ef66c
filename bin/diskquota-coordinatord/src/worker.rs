//! Per-database refresh worker.
//!
//! One worker task per monitored database. Each epoch it reloads the
//! configured limits, pulls active-table sizes from the segments, rolls
//! them into the quota model, persists the refreshed sizes and publishes
//! the blocklist. Transient failures log and retry on the next tick; the
//! epoch counter advances every loop so waiters never hang on errors.

use crate::fanout::Fanout;
use diskquota_catalog::Catalog;
use diskquota_common::{Oid, QuotaState, Result, SegId};
use diskquota_quota::{Blocklist, QuotaModel};
use diskquota_shmem::PausedFlags;
use diskquota_store::QuotaStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct Worker {
    db: Oid,
    naptime: Duration,
    store: Arc<QuotaStore>,
    fanout: Arc<Fanout>,
    catalog: Arc<dyn Catalog>,
    blocklist: Arc<Blocklist>,
    paused: Arc<PausedFlags>,
    epoch_tx: watch::Sender<u64>,
    model: QuotaModel,
    initialized: bool,
    ready_warned: bool,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Oid,
        naptime: Duration,
        store: Arc<QuotaStore>,
        fanout: Arc<Fanout>,
        catalog: Arc<dyn Catalog>,
        blocklist: Arc<Blocklist>,
        paused: Arc<PausedFlags>,
        epoch_tx: watch::Sender<u64>,
    ) -> Self {
        let seg_count = fanout.seg_count();
        Self {
            db,
            naptime,
            store,
            fanout,
            catalog,
            blocklist,
            paused,
            epoch_tx,
            model: QuotaModel::new(db, seg_count),
            initialized: false,
            ready_warned: false,
        }
    }

    /// The worker loop. Returns when `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(db = self.db, "quota worker started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.naptime) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            if !self.paused.is_paused(self.db) {
                if let Err(e) = self.refresh().await {
                    warn!(db = self.db, error = %e, "epoch refresh failed, will retry");
                }
            }

            self.epoch_tx.send_modify(|epoch| *epoch += 1);
        }
        info!(db = self.db, "quota worker stopped");
    }

    /// One refresh epoch.
    async fn refresh(&mut self) -> Result<()> {
        if self.store.state(self.db)? != QuotaState::Ready {
            if !self.ready_warned {
                warn!(
                    db = self.db,
                    "diskquota is not in ready state, please run init_table_size_table"
                );
                self.ready_warned = true;
            }
            return Ok(());
        }
        self.ready_warned = false;

        self.model.set_seg_count(self.fanout.seg_count());

        let limits = self.store.load_quota_limits(self.db)?;
        self.model.load_limits(&limits);

        let is_init = !self.initialized;
        let active: HashMap<(Oid, SegId), u64> = if is_init {
            // cold start: evaluate against last-known sizes until the
            // first true fan-out completes
            self.store
                .load_table_sizes(self.db, self.fanout.version())?
                .into_iter()
                .map(|row| ((row.oid, row.seg_id), row.size_bytes))
                .collect()
        } else {
            let oids: Vec<Oid> = {
                let mut oids: Vec<Oid> =
                    self.fanout.pull_active_oids(self.db).await.into_iter().collect();
                oids.sort_unstable();
                oids
            };
            debug!(db = self.db, active = oids.len(), "drain phase complete");
            self.fanout.pull_active_sizes(self.db, &oids).await
        };

        self.model
            .update_usage(&active, self.catalog.as_ref(), is_init);
        self.model.evaluate(self.catalog.as_ref());

        let batch = self.model.take_flush_batch(self.fanout.version());
        self.store.apply_flush(self.db, &batch)?;

        self.blocklist.flush_local(self.model.local_blocklist_mut());
        let rows = self.blocklist.rows_for_db(self.db);
        self.fanout.dispatch_blocklist(self.db, rows).await;

        self.initialized = true;
        Ok(())
    }
}

/// Wait until the worker's epoch advances past its value at call time.
pub async fn wait_for_new_epoch(mut epoch_rx: watch::Receiver<u64>) -> u64 {
    let start = *epoch_rx.borrow();
    loop {
        if *epoch_rx.borrow() > start {
            return *epoch_rx.borrow();
        }
        if epoch_rx.changed().await.is_err() {
            // worker is gone; report the last epoch we saw
            return start;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::testing::LocalDispatch;
    use diskquota_catalog::{MemoryCatalog, StorageEventHub, TableSpec};
    use diskquota_common::{QuotaType, SchemaVersion, CLUSTER_SEG_ID, INVALID_OID};
    use diskquota_quota::BlockKey;
    use tempfile::TempDir;

    const MB: u64 = 1 << 20;

    struct Fixture {
        _dir: TempDir,
        store: Arc<QuotaStore>,
        catalog: Arc<MemoryCatalog>,
        dispatch: Arc<LocalDispatch>,
        blocklist: Arc<Blocklist>,
        paused: Arc<PausedFlags>,
        db: Oid,
        ns: Oid,
        table: Oid,
    }

    fn fixture(seg_count: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(QuotaStore::open(dir.path().join("quota.redb")).unwrap());
        let catalog = Arc::new(MemoryCatalog::new(Arc::new(StorageEventHub::new())));
        let db = catalog.define_database("db");
        let ns = catalog.define_namespace("s");
        let role = catalog.define_role("r");
        let spc = catalog.define_tablespace("pg_default");
        let table = catalog.create_table(TableSpec::heap(db, "t", ns, role, spc));

        store.add_database(db).unwrap();
        store.set_state(db, diskquota_common::QuotaState::Ready).unwrap();

        let dispatch = Arc::new(LocalDispatch::new(vec![HashMap::new(); seg_count]));
        Fixture {
            _dir: dir,
            store,
            catalog,
            dispatch,
            blocklist: Arc::new(Blocklist::new()),
            paused: Arc::new(PausedFlags::new()),
            db,
            ns,
            table,
        }
    }

    fn spawn_worker(
        f: &Fixture,
    ) -> (
        watch::Sender<bool>,
        watch::Receiver<u64>,
        tokio::task::JoinHandle<()>,
    ) {
        let fanout = Arc::new(crate::fanout::Fanout::new(
            f.dispatch.clone(),
            SchemaVersion::V2,
        ));
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let worker = Worker::new(
            f.db,
            Duration::from_millis(10),
            f.store.clone(),
            fanout,
            f.catalog.clone(),
            f.blocklist.clone(),
            f.paused.clone(),
            epoch_tx,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.run(shutdown_rx));
        (shutdown_tx, epoch_rx, handle)
    }

    #[tokio::test]
    async fn two_epochs_put_an_over_quota_schema_on_the_blocklist() {
        let f = fixture(2);
        f.store
            .set_quota_config(f.db, f.ns, QuotaType::Schema, 1)
            .unwrap();
        f.dispatch.set_size(0, f.table, MB);
        f.dispatch.set_size(1, f.table, MB);

        let (shutdown_tx, epoch_rx, handle) = spawn_worker(&f);
        // one epoch to drain, one to aggregate and evaluate
        wait_for_new_epoch(epoch_rx.clone()).await;
        wait_for_new_epoch(epoch_rx.clone()).await;
        wait_for_new_epoch(epoch_rx.clone()).await;

        let key = BlockKey {
            target_oid: f.ns,
            db: f.db,
            tablespace: INVALID_OID,
            quota_type: QuotaType::Schema,
        };
        assert!(f.blocklist.contains(&key));

        // the refreshed sizes were persisted with their cluster total
        let rows = f.store.load_table_sizes(f.db, SchemaVersion::V2).unwrap();
        assert!(rows
            .iter()
            .any(|r| r.oid == f.table && r.seg_id == CLUSTER_SEG_ID && r.size_bytes == 2 * MB));

        // and every segment received a blocklist push
        assert!(!f.dispatch.blocklist_pushes.lock().is_empty());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn paused_worker_keeps_ticking_but_skips_refresh() {
        let f = fixture(1);
        f.store
            .set_quota_config(f.db, f.ns, QuotaType::Schema, 1)
            .unwrap();
        f.dispatch.set_size(0, f.table, 4 * MB);
        f.paused.set_paused(f.db, true);

        let (shutdown_tx, epoch_rx, handle) = spawn_worker(&f);
        wait_for_new_epoch(epoch_rx.clone()).await;
        wait_for_new_epoch(epoch_rx.clone()).await;

        // epochs advanced, but no evaluation ran while paused
        assert!(f.blocklist.is_empty());

        f.paused.set_paused(f.db, false);
        wait_for_new_epoch(epoch_rx.clone()).await;
        wait_for_new_epoch(epoch_rx.clone()).await;
        wait_for_new_epoch(epoch_rx.clone()).await;
        assert!(!f.blocklist.is_empty());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn unready_database_defers_evaluation() {
        let f = fixture(1);
        f.store
            .set_state(f.db, diskquota_common::QuotaState::Unknown)
            .unwrap();
        f.store
            .set_quota_config(f.db, f.ns, QuotaType::Schema, 1)
            .unwrap();
        f.dispatch.set_size(0, f.table, 4 * MB);

        let (shutdown_tx, epoch_rx, handle) = spawn_worker(&f);
        wait_for_new_epoch(epoch_rx.clone()).await;
        wait_for_new_epoch(epoch_rx.clone()).await;
        assert!(f.blocklist.is_empty());

        // init_table_size_table flips the state; the worker picks it up
        f.store
            .set_state(f.db, diskquota_common::QuotaState::Ready)
            .unwrap();
        wait_for_new_epoch(epoch_rx.clone()).await;
        wait_for_new_epoch(epoch_rx.clone()).await;
        wait_for_new_epoch(epoch_rx.clone()).await;
        assert!(!f.blocklist.is_empty());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
