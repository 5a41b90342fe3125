//! The replicated storage environment contract: transactional access to the
//! named key-value databases hosted by this node plus its replication state.

use std::{
    collections::BTreeSet,
    fmt,
};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::types::{
    Generation,
    IndexDbName,
    PartitionId,
};

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DatabaseName {
    /// Primary records of one partition.
    Partition(PartitionId),
    /// Entries of one secondary index.
    Secondary(IndexDbName),
    /// Internal bookkeeping, including the maintenance progress record.
    Maintenance,
}

impl fmt::Debug for DatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseName::Partition(p) => write!(f, "p{p}"),
            DatabaseName::Secondary(name) => write!(f, "{name}"),
            DatabaseName::Maintenance => write!(f, "maintenance"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Create the database if it does not exist. Only the leader may create.
    pub allow_create: bool,
    /// Several values may share one key.
    pub sorted_duplicates: bool,
    /// Values are always empty.
    pub key_only: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsistencyPolicy {
    /// Commit once a majority of the replication group acknowledged.
    Majority,
    /// Commit locally without waiting on other nodes.
    LocalOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicationRole {
    Leader,
    Replica,
    /// Not (yet) part of a replication group.
    Detached,
}

impl ReplicationRole {
    pub fn is_leader(&self) -> bool {
        matches!(self, ReplicationRole::Leader)
    }
}

pub type ScanResult = Vec<(Vec<u8>, Vec<u8>)>;

#[async_trait]
pub trait StorageEnvironment: Send + Sync + 'static {
    /// Changes whenever the environment is recycled.
    fn generation(&self) -> Generation;

    fn is_valid(&self) -> bool;

    fn role(&self) -> ReplicationRole;

    fn is_leader(&self) -> bool {
        self.role().is_leader()
    }

    /// Role transitions, delivered without blocking the replication layer.
    fn subscribe_role(&self) -> watch::Receiver<ReplicationRole>;

    /// The partition holding the record with primary key `key`.
    fn partition_of(&self, key: &[u8]) -> PartitionId;

    fn hosted_partitions(&self) -> BTreeSet<PartitionId>;

    async fn begin(&self, policy: ConsistencyPolicy) -> anyhow::Result<Box<dyn Transaction>>;
}

/// A storage transaction. Dropping it without calling `commit` aborts it.
///
/// Faults are tagged with `ErrorMetadata`: lock conflicts and missing replica
/// acknowledgements are transient, an invalidated environment or a write on a
/// replica stop the caller, and opening a database that does not exist
/// without `allow_create` is `NotFound`.
#[async_trait]
pub trait Transaction: Send {
    async fn open_database(
        &mut self,
        db: &DatabaseName,
        config: DatabaseConfig,
    ) -> anyhow::Result<()>;

    /// Returns whether the database existed.
    async fn remove_database(&mut self, db: &DatabaseName) -> anyhow::Result<bool>;

    async fn get(&mut self, db: &DatabaseName, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;

    async fn put(&mut self, db: &DatabaseName, key: &[u8], value: &[u8]) -> anyhow::Result<()>;

    /// Returns whether the key existed.
    async fn delete(&mut self, db: &DatabaseName, key: &[u8]) -> anyhow::Result<bool>;

    /// Up to `limit` entries with keys starting with `prefix` and strictly
    /// greater than `after`, in key order.
    async fn scan(
        &mut self,
        db: &DatabaseName,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> anyhow::Result<ScanResult>;

    async fn commit(self: Box<Self>) -> anyhow::Result<()>;

    async fn abort(self: Box<Self>);
}
