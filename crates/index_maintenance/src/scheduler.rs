//! Decides which maintenance task runs. At most one task runs per node at a
//! time; the maintenance lock guards both the decision to start one and the
//! handle map, so a task and the reconciler never race on a handle.

use std::sync::Arc;

use common::{
    errors::report_error,
    runtime::Runtime,
    types::IndexDbName,
};
use errors::ErrorMetadataAnyhowExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    context::MaintenanceContext,
    metrics::{
        log_scheduler_busy,
        log_task_finished,
    },
    progress::ProgressStore,
    tasks::{
        drive,
        new_task,
        TaskKind,
        TaskOutcome,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckOutcome {
    Started(TaskKind),
    AlreadyRunning(TaskKind),
    /// Nothing to do.
    Idle,
    /// Someone else holds the maintenance lock; try again later.
    Busy,
    NotLeader,
    /// Maintenance is turned off or the manager is shutting down.
    Disabled,
}

/// Stop request and completion signal of a running task.
#[derive(Clone)]
pub(crate) struct TaskControl {
    cancel: CancellationToken,
    finished: watch::Receiver<bool>,
}

impl TaskControl {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait until the task has returned. Does not stop it.
    pub async fn join(&self) {
        let mut finished = self.finished.clone();
        loop {
            let done = *finished.borrow_and_update();
            if done || finished.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn stop_and_join(&self) {
        self.stop();
        self.join().await;
    }
}

pub(crate) struct ActiveTask {
    pub id: u64,
    pub kind: TaskKind,
    /// The index the task is working on, if any.
    pub current_index: Option<IndexDbName>,
    pub control: TaskControl,
}

/// Clears the active task and signals completion when the task's future
/// ends, however it ends.
struct ActiveTaskGuard<RT: Runtime> {
    ctx: Arc<MaintenanceContext<RT>>,
    id: u64,
    finished: watch::Sender<bool>,
}

impl<RT: Runtime> Drop for ActiveTaskGuard<RT> {
    fn drop(&mut self) {
        self.ctx.registry.with_state(|state| {
            if state.active_task.as_ref().is_some_and(|t| t.id == self.id) {
                state.active_task = None;
            }
        });
        self.finished.send_replace(true);
    }
}

pub(crate) struct Scheduler<RT: Runtime> {
    ctx: Arc<MaintenanceContext<RT>>,
}

impl<RT: Runtime> Clone for Scheduler<RT> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
        }
    }
}

impl<RT: Runtime> Scheduler<RT> {
    pub fn new(ctx: Arc<MaintenanceContext<RT>>) -> Self {
        Self { ctx }
    }

    /// Start the highest priority pending task unless one is running. Never
    /// waits for the maintenance lock.
    pub async fn check_maintenance(&self) -> anyhow::Result<CheckOutcome> {
        let ctx = &self.ctx;
        if !ctx.config.enabled || ctx.cancel.is_cancelled() {
            return Ok(CheckOutcome::Disabled);
        }
        if !ctx.env.is_valid() || !ctx.env.is_leader() {
            return Ok(CheckOutcome::NotLeader);
        }
        let record = match ProgressStore::read(&*ctx.env).await {
            Ok(record) => record,
            Err(e) if e.is_environment_stop() => return Ok(CheckOutcome::NotLeader),
            Err(e) => return Err(e),
        };
        let outcome = ctx.registry.try_with_state(|state| {
            if let Some(task) = &state.active_task {
                return CheckOutcome::AlreadyRunning(task.kind);
            }
            let Some(kind) = record.pending_task(|name| state.handles.contains_key(name)) else {
                return CheckOutcome::Idle;
            };
            state.active_task = Some(self.start_task(kind));
            CheckOutcome::Started(kind)
        });
        match outcome {
            Some(CheckOutcome::Started(kind)) => {
                tracing::info!("Started {kind} maintenance task");
                Ok(CheckOutcome::Started(kind))
            },
            Some(outcome) => Ok(outcome),
            None => {
                log_scheduler_busy();
                Ok(CheckOutcome::Busy)
            },
        }
    }

    /// `check_maintenance`, retried while the maintenance lock is busy.
    pub async fn check_maintenance_with_retry(&self) -> anyhow::Result<CheckOutcome> {
        let mut attempts = 0;
        loop {
            let outcome = self.check_maintenance().await?;
            if outcome != CheckOutcome::Busy || attempts >= self.ctx.config.busy_max_retries {
                return Ok(outcome);
            }
            attempts += 1;
            tokio::select! {
                biased;
                _ = self.ctx.cancel.cancelled() => return Ok(CheckOutcome::Disabled),
                _ = self.ctx.rt.wait(self.ctx.config.busy_retry_delay) => {},
            }
        }
    }

    /// Stop the running task, if any, and wait until it has returned.
    pub async fn stop_active_task(&self) {
        let running = self.ctx.registry.with_state(|state| {
            state
                .active_task
                .as_ref()
                .map(|task| (task.kind, task.control.clone()))
        });
        if let Some((kind, control)) = running {
            tracing::info!("Stopping {kind} maintenance task");
            control.stop_and_join().await;
        }
    }

    pub fn is_maintenance_busy(&self) -> bool {
        self.ctx
            .registry
            .try_with_state(|state| state.active_task.is_some())
            .unwrap_or(true)
    }

    #[cfg(test)]
    pub fn force_start(&self, kind: TaskKind) -> bool {
        self.ctx.registry.with_state(|state| {
            if state.active_task.is_some() {
                return false;
            }
            state.active_task = Some(self.start_task(kind));
            true
        })
    }

    /// Called with the maintenance lock held.
    fn start_task(&self, kind: TaskKind) -> ActiveTask {
        let id = self.ctx.next_task_id();
        let cancel = self.ctx.cancel.child_token();
        let (finished_tx, finished_rx) = watch::channel(false);
        let guard = ActiveTaskGuard {
            ctx: self.ctx.clone(),
            id,
            finished: finished_tx,
        };
        let scheduler = self.clone();
        let task_cancel = cancel.clone();
        // Completion is observed through the control's watch channel.
        drop(self.ctx.rt.spawn("index_maintenance_task", async move {
            scheduler.run_task(kind, id, task_cancel, guard).await
        }));
        ActiveTask {
            id,
            kind,
            current_index: None,
            control: TaskControl {
                cancel,
                finished: finished_rx,
            },
        }
    }

    async fn run_task(
        self,
        kind: TaskKind,
        id: u64,
        cancel: CancellationToken,
        guard: ActiveTaskGuard<RT>,
    ) {
        let mut task = new_task(kind);
        let outcome = drive(&self.ctx, &mut *task, id, &cancel).await;
        log_task_finished(kind, &outcome);
        drop(guard);
        match outcome {
            TaskOutcome::Completed => {
                tracing::info!("{kind} maintenance task completed");
            },
            TaskOutcome::Blocked => {
                tracing::info!("{kind} maintenance task is blocked until an index is opened");
            },
            TaskOutcome::Preempted(by) => {
                tracing::info!("{kind} maintenance task preempted by {by}");
            },
            TaskOutcome::Stopped if cancel.is_cancelled() => {
                tracing::info!("{kind} maintenance task stopped");
                return;
            },
            TaskOutcome::Stopped => {
                // The role may already have flipped back; the check below
                // reports NotLeader if it has not.
                tracing::info!("{kind} maintenance task stopped by its environment");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    _ = self.ctx.rt.wait(self.ctx.config.retry_delay) => {},
                }
            },
            TaskOutcome::Failed(e) => {
                self.ctx.shutdown.signal(e);
                return;
            },
        }
        if let Err(mut e) = self.check_maintenance_with_retry().await {
            report_error(&mut e).await;
        }
    }
}
