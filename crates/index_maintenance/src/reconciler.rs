//! Brings the set of open index handles in line with the catalog: opens
//! handles for new indexes, closes handles of dropped ones and reopens
//! handles left over from an older storage environment generation. On the
//! leader it also creates and retires the progress entries of dropped
//! tables.

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use common::{
    catalog::{
        CatalogSnapshot,
        IndexMetadata,
        TableMetadata,
    },
    errors::report_error,
    kv_store::{
        ConsistencyPolicy,
        DatabaseConfig,
        DatabaseName,
    },
    runtime::Runtime,
    types::{
        Generation,
        IndexDbName,
    },
};
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use tokio_util::sync::CancellationToken;

use crate::{
    context::{
        BackgroundWorker,
        MaintenanceContext,
    },
    metrics::{
        log_handle_open_error,
        reconcile_timer,
    },
    progress::{
        DeletedTableStatus,
        ProgressStore,
        SecondaryIndexStatus,
    },
    registry::IndexHandle,
    scheduler::Scheduler,
};

/// What one reconciler pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub opened: usize,
    pub reopened: usize,
    pub closed: usize,
    /// Indexes with an invalid definition. They are not retried until the
    /// catalog changes.
    pub skipped: usize,
    /// Indexes that could not be opened or closed this pass.
    pub failed: usize,
}

impl ReconcileOutcome {
    pub fn changed(&self) -> bool {
        self.opened + self.reopened + self.closed > 0
    }
}

type TargetIndexes<'a> = BTreeMap<IndexDbName, (&'a TableMetadata, &'a IndexMetadata)>;

pub(crate) struct Reconciler<RT: Runtime> {
    ctx: Arc<MaintenanceContext<RT>>,
}

impl<RT: Runtime> Reconciler<RT> {
    pub fn new(ctx: Arc<MaintenanceContext<RT>>) -> Self {
        Self { ctx }
    }

    /// Reconcile until every index is in its target state, then check for
    /// maintenance work. Failed indexes are retried after a fixed delay.
    pub async fn go(self, cancel: CancellationToken) {
        let scheduler = Scheduler::new(self.ctx.clone());
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match self.reconcile_once().await {
                Ok(outcome) => {
                    if outcome.changed() {
                        tracing::info!("Reconciled index handles: {outcome:?}");
                    }
                    if let Err(mut e) = scheduler.check_maintenance_with_retry().await {
                        report_error(&mut e).await;
                    }
                    if outcome.failed == 0 {
                        return;
                    }
                    tracing::warn!(
                        "Failed to reconcile {} indexes, retrying in {:?}",
                        outcome.failed,
                        self.ctx.config.reconciler_retry_delay
                    );
                },
                Err(e) if e.is_environment_stop() => {
                    tracing::info!("Reconciler stopping: {e:#}");
                    return;
                },
                Err(e) if e.is_invariant_violation() => {
                    self.ctx.shutdown.signal(e);
                    return;
                },
                Err(mut e) => report_error(&mut e).await,
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = self.ctx.rt.wait(self.ctx.config.reconciler_retry_delay) => {},
            }
        }
    }

    pub async fn reconcile_once(&self) -> anyhow::Result<ReconcileOutcome> {
        let timer = reconcile_timer();
        let env = &*self.ctx.env;
        if !env.is_valid() {
            anyhow::bail!(ErrorMetadata::environment_invalid());
        }
        let snapshot = self.ctx.catalog.current_snapshot();
        let generation = env.generation();
        let is_leader = env.is_leader();
        let mut outcome = ReconcileOutcome::default();

        // Drops win: the indexes of a table being deleted are closed even if
        // the catalog still lists them.
        let target: TargetIndexes<'_> = snapshot
            .tables
            .values()
            .filter(|table| !table.is_deleting())
            .flat_map(|table| {
                table
                    .indexes
                    .iter()
                    .map(move |index| (table.index_db_name(index), (table, index)))
            })
            .collect();

        for name in self.ctx.registry.handles().keys() {
            if target.contains_key(name) {
                continue;
            }
            match self.close_handle(name, is_leader).await {
                Ok(()) => outcome.closed += 1,
                Err(e) => self.note_failure(e, name, &mut outcome).await?,
            }
        }

        for (name, (table, index)) in &target {
            let current = self.ctx.registry.get(name);
            if current.as_ref().is_some_and(|h| h.generation == generation) {
                continue;
            }
            let reopening = current.is_some();
            if reopening {
                self.detach_handle(name).await;
            }
            match self
                .open_handle(&snapshot, table, index, generation, is_leader)
                .await
            {
                Ok(()) if reopening => outcome.reopened += 1,
                Ok(()) => outcome.opened += 1,
                Err(e) => {
                    log_handle_open_error();
                    self.note_failure(e, name, &mut outcome).await?;
                },
            }
        }

        if is_leader {
            if let Err(e) = self.reconcile_progress(&snapshot, &target).await {
                if e.is_environment_stop() || e.is_invariant_violation() {
                    return Err(e);
                }
                tracing::warn!("Failed to update table deletion progress: {e:#}");
                outcome.failed += 1;
            }
        }
        timer.finish();
        Ok(outcome)
    }

    /// Errors that stop the pass are returned; anything else is recorded in
    /// `outcome`.
    async fn note_failure(
        &self,
        mut e: anyhow::Error,
        name: &IndexDbName,
        outcome: &mut ReconcileOutcome,
    ) -> anyhow::Result<()> {
        if e.is_environment_stop() || e.is_invariant_violation() {
            return Err(e);
        }
        if e.is_invalid_definition() {
            e = e.wrap_error_message(|msg| format!("Skipping index {name}: {msg}"));
            report_error(&mut e).await;
            outcome.skipped += 1;
            return Ok(());
        }
        tracing::warn!("Failed to reconcile index {name}: {e:#}");
        outcome.failed += 1;
        Ok(())
    }

    async fn open_handle(
        &self,
        snapshot: &CatalogSnapshot,
        table: &TableMetadata,
        index: &IndexMetadata,
        generation: Generation,
        is_leader: bool,
    ) -> anyhow::Result<()> {
        let key_shape = snapshot.key_shape(table.id).map_err(|e| {
            e.context(ErrorMetadata::invalid_definition(
                "InvalidTableHierarchy",
                format!("Cannot derive the key shape of {}", table.full_name),
            ))
        })?;
        let handle = IndexHandle::new(table, index, key_shape, generation, true)?;
        let name = handle.db_name.clone();

        let mut tx = self.ctx.env.begin(ConsistencyPolicy::LocalOnly).await?;
        tx.open_database(
            handle.database(),
            DatabaseConfig {
                allow_create: is_leader,
                sorted_duplicates: index.multi_key,
                key_only: index.key_only,
            },
        )
        .await?;
        let mut record = ProgressStore::load(&mut *tx).await?;
        let populating = match record.secondaries.get(&name) {
            Some(status) => {
                if status.needs_cleaning {
                    tracing::info!("{name} has entries left to clean");
                }
                status.needs_populating
            },
            None if is_leader => {
                record
                    .secondaries
                    .insert(name.clone(), SecondaryIndexStatus::new_populating());
                ProgressStore::save(&mut *tx, &record).await?;
                true
            },
            // The leader has not recorded this index yet.
            None => true,
        };
        tx.commit().await?;

        handle.set_populating(populating);
        let handle = Arc::new(handle);
        self.ctx
            .registry
            .with_state(|state| state.handles.insert(name.clone(), handle));
        tracing::info!("Opened secondary index {name} (populating: {populating})");
        Ok(())
    }

    /// Remove a handle from the registry, first stopping the maintenance
    /// task if it is working on the index.
    async fn detach_handle(&self, name: &IndexDbName) {
        let task = self.ctx.registry.with_state(|state| {
            state.handles.remove(name);
            state.task_using(name).map(|task| (task.kind, task.control.clone()))
        });
        if let Some((kind, control)) = task {
            tracing::info!("Stopping {kind} task working on {name}");
            control.stop_and_join().await;
        }
    }

    async fn close_handle(&self, name: &IndexDbName, is_leader: bool) -> anyhow::Result<()> {
        self.detach_handle(name).await;
        if is_leader {
            let mut tx = self.ctx.env.begin(ConsistencyPolicy::LocalOnly).await?;
            tx.remove_database(&DatabaseName::Secondary(name.clone()))
                .await?;
            let mut record = ProgressStore::load(&mut *tx).await?;
            if record.secondaries.remove(name).is_some() {
                ProgressStore::save(&mut *tx, &record).await?;
            }
            tx.commit().await?;
        }
        tracing::info!("Closed secondary index {name}");
        Ok(())
    }

    /// Track deletion of tables marked for deletion, retire the entries of
    /// tables whose deletion orchestration acknowledged, and remove indexes
    /// that were dropped while no handle was open for them.
    async fn reconcile_progress(
        &self,
        snapshot: &CatalogSnapshot,
        target: &TargetIndexes<'_>,
    ) -> anyhow::Result<()> {
        let mut tx = self.ctx.env.begin(ConsistencyPolicy::LocalOnly).await?;
        let mut record = ProgressStore::load(&mut *tx).await?;
        let mut changed = false;

        for table in snapshot.tables.values().filter(|t| t.is_deleting()) {
            if record.deleted_tables.contains_key(&table.id) {
                continue;
            }
            if !table.children.is_empty() {
                anyhow::bail!(ErrorMetadata::invariant_violation(
                    "DeletingTableHasChildren",
                    format!(
                        "Table {} is being deleted but still has {} child tables",
                        table.full_name,
                        table.children.len()
                    ),
                ));
            }
            let status = DeletedTableStatus::new(table.id, snapshot.key_shape(table.id)?)?;
            tracing::info!("Scheduling deletion of the records of {}", table.full_name);
            record.deleted_tables.insert(table.id, status);
            changed = true;
        }

        let before = record.deleted_tables.len();
        record
            .deleted_tables
            .retain(|id, status| !status.done || snapshot.table(*id).is_some());
        changed |= record.deleted_tables.len() != before;

        let open = self.ctx.registry.handles();
        let stale: Vec<IndexDbName> = record
            .secondaries
            .keys()
            .filter(|name| !target.contains_key(*name) && !open.contains_key(*name))
            .cloned()
            .collect();
        for name in stale {
            tracing::info!("Removing dropped secondary index {name}");
            tx.remove_database(&DatabaseName::Secondary(name.clone()))
                .await?;
            record.secondaries.remove(&name);
            changed = true;
        }

        if changed {
            ProgressStore::save(&mut *tx, &record).await?;
            tx.commit().await?;
        } else {
            tx.abort().await;
        }
        Ok(())
    }
}

/// Stop the running reconciler, if any, and start a fresh one.
pub(crate) async fn restart_reconciler<RT: Runtime>(ctx: &Arc<MaintenanceContext<RT>>) {
    let mut reconciler = ctx.reconciler.lock().await;
    if let Some(previous) = reconciler.take() {
        previous.stop_and_join().await;
    }
    if ctx.cancel.is_cancelled() {
        return;
    }
    let cancel = ctx.cancel.child_token();
    let go = Reconciler::new(ctx.clone()).go(cancel.clone());
    *reconciler = Some(BackgroundWorker::spawn(
        &ctx.rt,
        "index_reconciler",
        cancel,
        go,
    ));
}

/// Stop the running reconciler without starting another.
pub(crate) async fn stop_reconciler<RT: Runtime>(ctx: &MaintenanceContext<RT>) {
    if let Some(previous) = ctx.reconciler.lock().await.take() {
        previous.stop_and_join().await;
    }
}
