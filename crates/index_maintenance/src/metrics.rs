use common::kv_store::ReplicationRole;
use metrics::{
    log_counter,
    log_counter_with_labels,
    log_gauge,
    register_node_counter,
    register_node_gauge,
    register_node_histogram,
    IntoLabel,
    MetricLabel,
    StatusTimer,
    STATUS_LABEL,
};

use crate::tasks::{
    TaskKind,
    TaskOutcome,
};

register_node_gauge!(
    INDEX_MAINTENANCE_OPEN_INDEXES,
    "Number of secondary index handles currently open"
);
pub fn log_open_handles(count: usize) {
    log_gauge(&INDEX_MAINTENANCE_OPEN_INDEXES, count as f64);
}

register_node_counter!(
    INDEX_HANDLE_OPEN_ERRORS,
    "Number of failed attempts to open a secondary index handle"
);
pub fn log_handle_open_error() {
    log_counter(&INDEX_HANDLE_OPEN_ERRORS, 1);
}

register_node_histogram!(
    INDEX_RECONCILE_SECONDS,
    "Time taken by one reconciler pass",
    &STATUS_LABEL
);
pub fn reconcile_timer() -> StatusTimer {
    StatusTimer::new(&INDEX_RECONCILE_SECONDS)
}

register_node_histogram!(
    INDEX_MAINTENANCE_BATCH_SECONDS,
    "Time taken by one maintenance batch transaction",
    &["task", "status"]
);
pub fn batch_timer(kind: TaskKind) -> StatusTimer {
    StatusTimer::new_with_labels(&INDEX_MAINTENANCE_BATCH_SECONDS, vec![task_label(kind)])
}

register_node_counter!(
    INDEX_MAINTENANCE_COMMITTED_BATCHES,
    "Number of committed maintenance batches",
    &["task"]
);
register_node_counter!(
    INDEX_MAINTENANCE_PROCESSED_ROWS,
    "Number of records or index entries written or removed by maintenance",
    &["task"]
);
pub fn log_batch_committed(kind: TaskKind, rows: usize) {
    log_counter_with_labels(&INDEX_MAINTENANCE_COMMITTED_BATCHES, 1, vec![task_label(kind)]);
    log_counter_with_labels(
        &INDEX_MAINTENANCE_PROCESSED_ROWS,
        rows as u64,
        vec![task_label(kind)],
    );
}

register_node_counter!(
    INDEX_MAINTENANCE_TASK_RETRIES,
    "Number of maintenance batches retried after a transient failure",
    &["task"]
);
pub fn log_task_retry(kind: TaskKind) {
    log_counter_with_labels(&INDEX_MAINTENANCE_TASK_RETRIES, 1, vec![task_label(kind)]);
}

register_node_counter!(
    INDEX_MAINTENANCE_FINISHED_TASKS,
    "Number of maintenance task runs that ended, by outcome",
    &["task", "outcome"]
);
pub fn log_task_finished(kind: TaskKind, outcome: &TaskOutcome) {
    log_counter_with_labels(
        &INDEX_MAINTENANCE_FINISHED_TASKS,
        1,
        vec![
            task_label(kind),
            MetricLabel::new_const("outcome", outcome.as_label()),
        ],
    );
}

register_node_counter!(
    INDEX_SCHEDULER_BUSY_TOTAL,
    "Number of maintenance checks that found the scheduler lock held"
);
pub fn log_scheduler_busy() {
    log_counter(&INDEX_SCHEDULER_BUSY_TOTAL, 1);
}

register_node_counter!(
    INDEX_ROLE_CHANGES_TOTAL,
    "Number of replication role transitions observed by index maintenance",
    &["role"]
);
pub fn log_role_change(role: ReplicationRole) {
    let role = match role {
        ReplicationRole::Leader => "leader",
        ReplicationRole::Replica => "replica",
        ReplicationRole::Detached => "detached",
    };
    log_counter_with_labels(
        &INDEX_ROLE_CHANGES_TOTAL,
        1,
        vec![MetricLabel::new_const("role", role)],
    );
}

fn task_label(kind: TaskKind) -> MetricLabel {
    MetricLabel::new_const("task", kind.as_label())
}
