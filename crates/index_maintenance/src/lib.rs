//! Secondary index lifecycle management for a storage node.
//!
//! The node keeps one handle per secondary index it hosts, routes every
//! primary-record write to the indexes it affects, and runs background
//! maintenance: populating new indexes from existing records, removing index
//! entries whose primary records moved to another node, and deleting the
//! records of dropped tables. All long-running work is resumable from a
//! durable progress record.
//!
//! [`IndexManager`] is the entry point: it owns the routing index, the handle
//! registry and the background loops, and reacts to catalog updates and
//! replication role changes.

mod config;
mod context;
mod manager;
mod metrics;
mod progress;
mod reconciler;
mod registry;
mod role_tracker;
mod routing;
mod scheduler;
mod tasks;

#[cfg(test)]
mod tests;

pub use self::{
    config::MaintenanceConfig,
    manager::IndexManager,
    progress::{
        DeletedTableStatus,
        ProgressRecord,
        SecondaryIndexStatus,
        PROGRESS_RECORD_KEY,
    },
    reconciler::ReconcileOutcome,
    registry::{
        decode_entry,
        encode_entry,
        IndexHandle,
    },
    routing::{
        RoutingIndex,
        RoutingNode,
    },
    scheduler::CheckOutcome,
    tasks::TaskKind,
};
