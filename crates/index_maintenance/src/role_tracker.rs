use std::sync::Arc;

use common::{
    backoff::Backoff,
    errors::report_error,
    kv_store::ReplicationRole,
    runtime::Runtime,
};
use errors::ErrorMetadataAnyhowExt;
use tokio::sync::watch;

use crate::{
    context::MaintenanceContext,
    metrics::log_role_change,
    progress::ProgressStore,
    reconciler::restart_reconciler,
    scheduler::Scheduler,
};

/// Follows replication role changes. Transitions are queued by the watch
/// channel and handled here, so the replication layer is never blocked on
/// maintenance.
pub(crate) async fn run_role_tracker<RT: Runtime>(
    ctx: Arc<MaintenanceContext<RT>>,
    mut roles: watch::Receiver<ReplicationRole>,
) {
    let scheduler = Scheduler::new(ctx.clone());
    let mut last_role = None;
    loop {
        let role = *roles.borrow_and_update();
        let role_changed = last_role != Some(role);
        if role_changed {
            tracing::info!("Replication role changed from {last_role:?} to {role:?}");
            log_role_change(role);
        }
        // Several transitions may arrive as one notification, so a leader
        // that looks unchanged may still have lost its task in between.
        if role.is_leader() {
            if open_progress_store(&ctx).await {
                restart_reconciler(&ctx).await;
            }
        } else if role_changed {
            scheduler.stop_active_task().await;
            restart_reconciler(&ctx).await;
        }
        last_role = Some(role);
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return,
            changed = roles.changed() => {
                if changed.is_err() {
                    return;
                }
            },
        }
    }
}

/// Retry opening the progress store with backoff. Returns false if the node
/// stopped being a valid leader or is shutting down first.
async fn open_progress_store<RT: Runtime>(ctx: &MaintenanceContext<RT>) -> bool {
    let mut backoff = Backoff::new(ctx.config.initial_backoff, ctx.config.max_backoff);
    loop {
        match ProgressStore::open(&*ctx.env).await {
            Ok(_) => return true,
            Err(e) if e.is_environment_stop() => {
                tracing::info!("Not opening the progress store: {e:#}");
                return false;
            },
            Err(mut e) => {
                let delay = ctx.rt.with_rng(|rng| backoff.fail(rng));
                report_error(&mut e).await;
                tracing::warn!(
                    "Failed to open the progress store ({} failures), retrying in {delay:?}",
                    backoff.failures()
                );
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return false,
                    _ = ctx.rt.wait(delay) => {},
                }
            },
        }
    }
}
