//! Background maintenance tasks. Each task does its work in bounded batches,
//! one transaction per batch, and records its position in the progress
//! record inside the same transaction, so a task interrupted at any point
//! resumes from its last committed batch.

use std::{
    fmt,
    sync::Arc,
};

use async_trait::async_trait;
use common::{
    kv_store::{
        ConsistencyPolicy,
        DatabaseName,
        ScanResult,
        StorageEnvironment,
        Transaction,
    },
    runtime::Runtime,
    types::IndexDbName,
};
use errors::ErrorMetadataAnyhowExt;
use metrics::IntoLabel;
use tokio_util::sync::CancellationToken;

use crate::{
    context::MaintenanceContext,
    metrics::{
        batch_timer,
        log_batch_committed,
        log_task_retry,
    },
    progress::{
        ProgressRecord,
        ProgressStore,
    },
    registry::{
        HandleMap,
        HandleRegistry,
        IndexHandle,
    },
};

mod populate;
mod primary_cleaner;
mod secondary_cleaner;

pub(crate) use self::{
    populate::PopulateTask,
    primary_cleaner::PrimaryCleanerTask,
    secondary_cleaner::SecondaryCleanerTask,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TaskKind {
    /// Build the entries of new secondary indexes from existing records.
    Populate,
    /// Delete the records of dropped tables.
    PrimaryClean,
    /// Remove index entries whose records are no longer hosted here.
    SecondaryClean,
}

impl IntoLabel for TaskKind {
    fn as_label(&self) -> &'static str {
        match self {
            TaskKind::Populate => "populate",
            TaskKind::PrimaryClean => "primary_clean",
            TaskKind::SecondaryClean => "secondary_clean",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

pub(crate) fn new_task(kind: TaskKind) -> Box<dyn MaintenanceTask> {
    match kind {
        TaskKind::Populate => Box::new(PopulateTask::default()),
        TaskKind::PrimaryClean => Box::new(PrimaryCleanerTask),
        TaskKind::SecondaryClean => Box::new(SecondaryCleanerTask),
    }
}

#[derive(Debug)]
pub(crate) enum BatchOutcome {
    /// A batch was done and must be committed. `rows` counts the records or
    /// entries written or removed.
    More { rows: usize },
    /// No work is left.
    Done,
    /// Work is pending but cannot proceed on this node right now.
    Blocked,
    /// Work of a higher priority kind became pending.
    Preempted(TaskKind),
}

#[derive(Debug)]
pub(crate) enum TaskOutcome {
    Completed,
    Blocked,
    /// Gave way to pending work of a higher priority kind.
    Preempted(TaskKind),
    /// Canceled, or the node lost leadership or its storage environment.
    Stopped,
    Failed(anyhow::Error),
}

impl IntoLabel for TaskOutcome {
    fn as_label(&self) -> &'static str {
        match self {
            TaskOutcome::Completed => "completed",
            TaskOutcome::Blocked => "blocked",
            TaskOutcome::Preempted(_) => "preempted",
            TaskOutcome::Stopped => "stopped",
            TaskOutcome::Failed(_) => "failed",
        }
    }
}

/// What a task sees during one batch.
pub(crate) struct BatchContext<'a> {
    pub tx: &'a mut dyn Transaction,
    pub env: &'a dyn StorageEnvironment,
    pub registry: &'a HandleRegistry,
    pub batch_size: usize,
    pub task_id: u64,
}

impl BatchContext<'_> {
    /// Pick an index to work on among the open handles and record it as
    /// this task's current index, atomically with respect to the reconciler.
    pub fn claim_index(
        &self,
        select: impl FnOnce(&HandleMap) -> Option<IndexDbName>,
    ) -> Option<Arc<IndexHandle>> {
        self.registry.with_state(|state| {
            let handle = select(&state.handles).and_then(|name| state.handles.get(&name).cloned());
            state.set_current_index(self.task_id, handle.as_ref().map(|h| h.db_name.clone()));
            handle
        })
    }

    /// Scan a partition's records. A partition that moved away since the
    /// batch started has no records left here.
    pub async fn scan_partition(
        &mut self,
        db: &DatabaseName,
        prefix: &[u8],
        after: Option<&[u8]>,
    ) -> anyhow::Result<ScanResult> {
        match self.tx.scan(db, prefix, after, self.batch_size).await {
            Err(e) if e.is_not_found() => {
                tracing::info!("{db:?} disappeared while it was being scanned");
                Ok(vec![])
            },
            result => result,
        }
    }
}

#[async_trait]
pub(crate) trait MaintenanceTask: Send {
    fn kind(&self) -> TaskKind;

    /// Select or resume the current unit of work and process one batch of
    /// it, updating `record` to reflect what was done.
    async fn run_batch(
        &mut self,
        batch: &mut BatchContext<'_>,
        record: &mut ProgressRecord,
    ) -> anyhow::Result<BatchOutcome>;

    /// Called once the batch's transaction committed.
    fn after_commit(&mut self) {}
}

/// Run `task` batch by batch until it runs out of work, is stopped, or fails.
/// Transient failures are retried up to the configured limit; the count
/// resets after every committed batch.
pub(crate) async fn drive<RT: Runtime>(
    ctx: &MaintenanceContext<RT>,
    task: &mut dyn MaintenanceTask,
    task_id: u64,
    cancel: &CancellationToken,
) -> TaskOutcome {
    let kind = task.kind();
    let mut failures = 0;
    loop {
        if cancel.is_cancelled() {
            return TaskOutcome::Stopped;
        }
        if !ctx.env.is_valid() || !ctx.env.is_leader() {
            tracing::info!("Stopping {kind} task: no longer the leader of a valid environment");
            return TaskOutcome::Stopped;
        }
        let timer = batch_timer(kind);
        match run_batch(ctx, task, task_id).await {
            Ok(BatchOutcome::More { rows }) => {
                timer.finish();
                failures = 0;
                tracing::debug!("{kind} batch committed ({rows} rows)");
                log_batch_committed(kind, rows);
            },
            Ok(BatchOutcome::Done) => {
                timer.finish();
                return TaskOutcome::Completed;
            },
            Ok(BatchOutcome::Blocked) => {
                timer.finish();
                return TaskOutcome::Blocked;
            },
            Ok(BatchOutcome::Preempted(by)) => {
                timer.finish();
                tracing::info!("{kind} task yielding to pending {by} work");
                return TaskOutcome::Preempted(by);
            },
            Err(e) if e.is_environment_stop() => {
                timer.finish_with("canceled");
                tracing::info!("Stopping {kind} task: {e:#}");
                return TaskOutcome::Stopped;
            },
            Err(e) if e.is_transient() && failures < ctx.config.max_retries => {
                failures += 1;
                log_task_retry(kind);
                tracing::warn!(
                    "{kind} batch failed ({failures}/{}), retrying in {:?}: {e:#}",
                    ctx.config.max_retries,
                    ctx.config.retry_delay,
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return TaskOutcome::Stopped,
                    _ = ctx.rt.wait(ctx.config.retry_delay) => {},
                }
                continue;
            },
            Err(e) => {
                return TaskOutcome::Failed(
                    e.context(format!("{kind} task failed after {failures} retries")),
                );
            },
        }
        // Role changes and stop requests get to run between batches.
        tokio::task::yield_now().await;
    }
}

async fn run_batch<RT: Runtime>(
    ctx: &MaintenanceContext<RT>,
    task: &mut dyn MaintenanceTask,
    task_id: u64,
) -> anyhow::Result<BatchOutcome> {
    let mut tx = ctx.env.begin(ConsistencyPolicy::Majority).await?;
    let mut record = ProgressStore::load(&mut *tx).await?;
    let handles = ctx.registry.handles();
    if let Some(pending) = record.pending_task(|name| handles.contains_key(name)) {
        if pending < task.kind() {
            tx.abort().await;
            return Ok(BatchOutcome::Preempted(pending));
        }
    }
    let mut batch = BatchContext {
        tx: &mut *tx,
        env: &*ctx.env,
        registry: &ctx.registry,
        batch_size: ctx.config.batch_size,
        task_id,
    };
    let outcome = task.run_batch(&mut batch, &mut record).await?;
    match outcome {
        BatchOutcome::More { .. } => {
            ProgressStore::save(&mut *tx, &record).await?;
            tx.commit().await?;
            task.after_commit();
        },
        BatchOutcome::Done | BatchOutcome::Blocked | BatchOutcome::Preempted(_) => {
            tx.abort().await
        },
    }
    Ok(outcome)
}
