use std::sync::Arc;

use common::{
    catalog::{
        CatalogSnapshot,
        MetadataCatalog,
    },
    kv_store::{
        ConsistencyPolicy,
        StorageEnvironment,
        Transaction,
    },
    runtime::{
        Runtime,
        SpawnHandle,
    },
    shutdown::ShutdownSignal,
    types::IndexDbName,
};
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{
    config::MaintenanceConfig,
    context::MaintenanceContext,
    progress::{
        ProgressRecord,
        ProgressStore,
    },
    reconciler::{
        restart_reconciler,
        stop_reconciler,
        ReconcileOutcome,
        Reconciler,
    },
    registry::IndexHandle,
    role_tracker::run_role_tracker,
    routing::{
        RoutingIndex,
        RoutingTable,
    },
    scheduler::{
        CheckOutcome,
        Scheduler,
    },
    tasks::TaskKind,
};

/// Secondary index lifecycle for one storage node.
///
/// Starting the manager spawns two loops: one follows catalog updates,
/// rebuilding the routing index and then reconciling index handles; the
/// other follows replication role changes, starting maintenance on the
/// leader and stopping it elsewhere.
pub struct IndexManager<RT: Runtime> {
    ctx: Arc<MaintenanceContext<RT>>,
    scheduler: Scheduler<RT>,
    workers: Mutex<Vec<RT::Handle>>,
}

impl<RT: Runtime> IndexManager<RT> {
    pub fn start(
        rt: RT,
        env: Arc<dyn StorageEnvironment>,
        catalog: Arc<dyn MetadataCatalog>,
        config: MaintenanceConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        // Subscribe before reading the current state so no update is missed.
        let snapshots = catalog.subscribe();
        let roles = env.subscribe_role();
        let routing = RoutingTable::new(RoutingIndex::rebuild(&catalog.current_snapshot()));
        let ctx = Arc::new(MaintenanceContext::new(
            rt.clone(),
            env,
            catalog,
            config,
            routing,
            shutdown,
        ));
        let workers = vec![
            rt.spawn("index_role_tracker", run_role_tracker(ctx.clone(), roles)),
            rt.spawn(
                "index_catalog_listener",
                run_catalog_listener(ctx.clone(), snapshots),
            ),
        ];
        Self {
            scheduler: Scheduler::new(ctx.clone()),
            ctx,
            workers: Mutex::new(workers),
        }
    }

    /// The routing index for the latest catalog version seen.
    pub fn routing(&self) -> Arc<RoutingIndex> {
        self.ctx.routing.load()
    }

    pub fn index_handle(&self, index_name: &str, table_name: &str) -> Option<Arc<IndexHandle>> {
        self.ctx
            .registry
            .get(&IndexDbName::new(index_name, table_name))
    }

    /// Keep the secondary indexes of the record at `primary_key` in sync with
    /// a write in `tx`. `old_value` is the record's value before the write
    /// and `new_value` after it; None means absent. Returns the number of
    /// index entries written or removed.
    pub async fn update_secondary_entries(
        &self,
        tx: &mut dyn Transaction,
        primary_key: &[u8],
        old_value: Option<&[u8]>,
        new_value: Option<&[u8]>,
    ) -> anyhow::Result<usize> {
        let routing = self.ctx.routing.load();
        let names = routing.lookup(primary_key);
        if names.is_empty() {
            return Ok(0);
        }
        let handles = self.ctx.registry.handles();
        let mut changed = 0;
        for name in names {
            // Not open yet: population will pick the record up.
            let Some(handle) = handles.get(name) else {
                continue;
            };
            if let Some(old_value) = old_value {
                let (expected, removed) = handle
                    .delete_entries(&mut *tx, primary_key, Some(old_value))
                    .await?;
                if removed < expected && !handle.is_populating() {
                    tracing::warn!(
                        "{} of {expected} entries of {primary_key:?} were missing from {name}",
                        expected - removed
                    );
                }
                changed += removed;
            }
            if let Some(new_value) = new_value {
                changed += handle
                    .insert_entries(&mut *tx, primary_key, Some(new_value))
                    .await?;
            }
        }
        Ok(changed)
    }

    /// True once every hosted partition's records are in the index.
    pub async fn is_index_population_complete(
        &self,
        index_name: &str,
        table_name: &str,
    ) -> anyhow::Result<bool> {
        let record = ProgressStore::read(&*self.ctx.env).await?;
        Ok(record.is_population_complete(&IndexDbName::new(index_name, table_name)))
    }

    /// True once the records of a dropped table are gone from every hosted
    /// partition, or if the table is no longer in the catalog at all.
    pub async fn is_table_data_deletion_complete(&self, table_name: &str) -> anyhow::Result<bool> {
        let Some(table) = self
            .ctx
            .catalog
            .current_snapshot()
            .table_by_name(table_name)
            .map(|t| t.id)
        else {
            return Ok(true);
        };
        let record = ProgressStore::read(&*self.ctx.env).await?;
        Ok(record
            .deleted_tables
            .get(&table)
            .is_some_and(|status| status.done))
    }

    /// Flag every index for removal of entries whose records are no longer
    /// hosted here, eg after a partition moved away, and start cleaning.
    pub async fn mark_for_secondary_cleaning(&self) -> anyhow::Result<usize> {
        let mut tx = self.ctx.env.begin(ConsistencyPolicy::Majority).await?;
        let mut record = ProgressStore::load(&mut *tx).await?;
        let marked = record.mark_all_for_cleaning();
        if marked == 0 {
            tx.abort().await;
            return Ok(0);
        }
        ProgressStore::save(&mut *tx, &record).await?;
        tx.commit().await?;
        tracing::info!("Marked {marked} secondary indexes for cleaning");
        self.scheduler.check_maintenance_with_retry().await?;
        Ok(marked)
    }

    /// Whether a maintenance task is running. Partition relocation waits for
    /// this to be false.
    pub fn is_maintenance_busy(&self) -> bool {
        self.scheduler.is_maintenance_busy()
    }

    #[cfg(test)]
    pub(crate) fn registry(&self) -> &crate::registry::HandleRegistry {
        &self.ctx.registry
    }

    /// Start `kind` regardless of what the progress record says is pending.
    #[cfg(test)]
    pub(crate) fn force_start(&self, kind: TaskKind) -> bool {
        self.scheduler.force_start(kind)
    }

    pub fn active_task(&self) -> Option<TaskKind> {
        self.ctx
            .registry
            .with_state(|state| state.active_task.as_ref().map(|task| task.kind))
    }

    pub async fn check_maintenance(&self) -> anyhow::Result<CheckOutcome> {
        self.scheduler.check_maintenance().await
    }

    /// Run one reconciler pass inline.
    pub async fn reconcile(&self) -> anyhow::Result<ReconcileOutcome> {
        Reconciler::new(self.ctx.clone()).reconcile_once().await
    }

    pub async fn progress_snapshot(&self) -> anyhow::Result<ProgressRecord> {
        ProgressStore::read(&*self.ctx.env).await
    }

    /// Stop every background loop and the running task, waiting for each to
    /// return. Open handles stay valid for reads.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.ctx.cancel.cancel();
        stop_reconciler(&self.ctx).await;
        self.scheduler.stop_active_task().await;
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            worker.into_join_future().await?;
        }
        tracing::info!("Index maintenance shut down");
        Ok(())
    }
}

/// Follow catalog updates: publish a rebuilt routing index first so writes
/// route to new indexes immediately, then reconcile the handles.
async fn run_catalog_listener<RT: Runtime>(
    ctx: Arc<MaintenanceContext<RT>>,
    mut snapshots: watch::Receiver<Arc<CatalogSnapshot>>,
) {
    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        ctx.routing.publish(RoutingIndex::rebuild(&snapshot));
        restart_reconciler(&ctx).await;
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return;
                }
            },
        }
    }
}
