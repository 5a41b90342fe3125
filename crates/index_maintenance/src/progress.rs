//! The durable progress record: one serialized document in the maintenance
//! database holding the state of every index population, secondary cleanup
//! and table data deletion, so each of them resumes where it left off after
//! a restart or a change of leader.

use std::collections::{
    BTreeMap,
    BTreeSet,
};

use common::{
    key::KeyShape,
    kv_store::{
        ConsistencyPolicy,
        DatabaseConfig,
        DatabaseName,
        StorageEnvironment,
        Transaction,
    },
    types::{
        IndexDbName,
        PartitionId,
        TableId,
    },
};
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use serde::{
    Deserialize,
    Serialize,
};

use crate::tasks::TaskKind;

pub const PROGRESS_RECORD_KEY: &[u8] = b"index_maintenance_progress";
const PROGRESS_RECORD_VERSION: u32 = 1;

/// Population and cleanup state of one secondary index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryIndexStatus {
    pub needs_populating: bool,
    pub needs_cleaning: bool,
    /// Partition being populated.
    pub current_partition: Option<PartitionId>,
    pub completed_partitions: BTreeSet<PartitionId>,
    /// Last primary key populated in `current_partition`, or the secondary
    /// key of the last entry examined while cleaning.
    #[serde(with = "hex_option")]
    pub resume_key: Option<Vec<u8>>,
    /// Primary key of the last entry examined while cleaning.
    #[serde(with = "hex_option")]
    pub resume_data: Option<Vec<u8>>,
}

impl SecondaryIndexStatus {
    pub fn new_populating() -> Self {
        Self {
            needs_populating: true,
            ..Default::default()
        }
    }

    pub(crate) fn finish_populating(&mut self) {
        self.needs_populating = false;
        self.current_partition = None;
        self.completed_partitions.clear();
        self.resume_key = None;
        self.resume_data = None;
    }

    pub(crate) fn finish_cleaning(&mut self) {
        self.needs_cleaning = false;
        self.resume_key = None;
        self.resume_data = None;
    }
}

/// Deletion state of the records of one dropped table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedTableStatus {
    /// Every key of the dropped table starts with this.
    #[serde(with = "hex_bytes")]
    pub parent_key_prefix: Vec<u8>,
    pub target_table_id: TableId,
    pub key_shape: KeyShape,
    /// Every key under `parent_key_prefix` belongs to the table, so no key
    /// needs to be matched against `key_shape`.
    pub major_key_complete: bool,
    pub current_partition: Option<PartitionId>,
    pub completed_partitions: BTreeSet<PartitionId>,
    #[serde(with = "hex_option")]
    pub resume_key: Option<Vec<u8>>,
    pub done: bool,
}

impl DeletedTableStatus {
    pub fn new(target_table_id: TableId, key_shape: KeyShape) -> anyhow::Result<Self> {
        let parent_key_prefix = key_shape.top_level_prefix()?;
        Ok(Self {
            parent_key_prefix,
            target_table_id,
            major_key_complete: key_shape.is_top_level(),
            key_shape,
            current_partition: None,
            completed_partitions: BTreeSet::new(),
            resume_key: None,
            done: false,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub version: u32,
    pub secondaries: BTreeMap<IndexDbName, SecondaryIndexStatus>,
    pub deleted_tables: BTreeMap<TableId, DeletedTableStatus>,
}

impl Default for ProgressRecord {
    fn default() -> Self {
        Self {
            version: PROGRESS_RECORD_VERSION,
            secondaries: BTreeMap::new(),
            deleted_tables: BTreeMap::new(),
        }
    }
}

impl ProgressRecord {
    /// The highest priority kind of pending work among indexes accepted by
    /// `is_open`: population first, then deletion of dropped tables' records,
    /// then removal of orphaned index entries.
    pub fn pending_task(&self, is_open: impl Fn(&IndexDbName) -> bool) -> Option<TaskKind> {
        if self.next_index_to_populate(&is_open).is_some() {
            return Some(TaskKind::Populate);
        }
        if self.next_table_to_clean().is_some() {
            return Some(TaskKind::PrimaryClean);
        }
        if self.next_index_to_clean(&is_open).is_some() {
            return Some(TaskKind::SecondaryClean);
        }
        None
    }

    pub fn next_index_to_populate(
        &self,
        is_open: impl Fn(&IndexDbName) -> bool,
    ) -> Option<&IndexDbName> {
        self.secondaries
            .iter()
            .find(|(name, status)| status.needs_populating && is_open(name))
            .map(|(name, _)| name)
    }

    /// Cleaning an index only starts once it is fully populated.
    pub fn next_index_to_clean(
        &self,
        is_open: impl Fn(&IndexDbName) -> bool,
    ) -> Option<&IndexDbName> {
        self.secondaries
            .iter()
            .find(|(name, status)| {
                status.needs_cleaning && !status.needs_populating && is_open(name)
            })
            .map(|(name, _)| name)
    }

    pub fn next_table_to_clean(&self) -> Option<TableId> {
        self.deleted_tables
            .iter()
            .find(|(_, status)| !status.done)
            .map(|(id, _)| *id)
    }

    pub fn is_population_complete(&self, name: &IndexDbName) -> bool {
        self.secondaries
            .get(name)
            .is_some_and(|status| !status.needs_populating)
    }

    /// Flag every index for a pass removing entries whose primary records
    /// are no longer hosted here. Returns the number of indexes flagged.
    /// An index still being populated keeps its population cursor; cleaning
    /// starts from the beginning once population finishes.
    pub fn mark_all_for_cleaning(&mut self) -> usize {
        let mut marked = 0;
        for status in self.secondaries.values_mut() {
            if !status.needs_cleaning {
                status.needs_cleaning = true;
                if !status.needs_populating {
                    status.resume_key = None;
                    status.resume_data = None;
                }
                marked += 1;
            }
        }
        marked
    }
}

/// The partition a per-partition pass should work on next: the current one
/// if it is still hosted, else the lowest hosted partition not yet completed.
/// None once every hosted partition is complete.
pub fn next_partition(
    current: Option<PartitionId>,
    completed: &BTreeSet<PartitionId>,
    hosted: &BTreeSet<PartitionId>,
) -> Option<PartitionId> {
    if let Some(current) = current {
        if hosted.contains(&current) && !completed.contains(&current) {
            return Some(current);
        }
    }
    hosted.difference(completed).next().copied()
}

/// Reads and writes the progress record inside the caller's transaction.
pub struct ProgressStore;

impl ProgressStore {
    fn database_config(allow_create: bool) -> DatabaseConfig {
        DatabaseConfig {
            allow_create,
            sorted_duplicates: false,
            key_only: false,
        }
    }

    /// Make sure the maintenance database exists and the stored record is
    /// readable. The leader creates the database; a replica only checks.
    pub async fn open(env: &dyn StorageEnvironment) -> anyhow::Result<ProgressRecord> {
        let mut tx = env.begin(ConsistencyPolicy::LocalOnly).await?;
        if env.is_leader() {
            tx.open_database(&DatabaseName::Maintenance, Self::database_config(true))
                .await?;
        }
        let record = Self::load(&mut *tx).await?;
        tx.commit().await?;
        Ok(record)
    }

    /// The stored record, or an empty one if nothing was saved yet.
    pub async fn load(tx: &mut dyn Transaction) -> anyhow::Result<ProgressRecord> {
        match tx
            .open_database(&DatabaseName::Maintenance, Self::database_config(false))
            .await
        {
            Ok(()) => {},
            Err(e) if e.is_not_found() => return Ok(ProgressRecord::default()),
            Err(e) => return Err(e),
        }
        let Some(bytes) = tx
            .get(&DatabaseName::Maintenance, PROGRESS_RECORD_KEY)
            .await?
        else {
            return Ok(ProgressRecord::default());
        };
        let record: ProgressRecord = serde_json::from_slice(&bytes).map_err(|e| {
            anyhow::anyhow!(e).context(ErrorMetadata::invariant_violation(
                "CorruptProgressRecord",
                "The index maintenance progress record could not be decoded",
            ))
        })?;
        if record.version != PROGRESS_RECORD_VERSION {
            anyhow::bail!(ErrorMetadata::invariant_violation(
                "UnknownProgressRecordVersion",
                format!(
                    "Progress record version {} is not supported (expected {})",
                    record.version, PROGRESS_RECORD_VERSION
                ),
            ));
        }
        Ok(record)
    }

    pub async fn save(tx: &mut dyn Transaction, record: &ProgressRecord) -> anyhow::Result<()> {
        tx.open_database(&DatabaseName::Maintenance, Self::database_config(true))
            .await?;
        let bytes = serde_json::to_vec(record)?;
        tx.put(&DatabaseName::Maintenance, PROGRESS_RECORD_KEY, &bytes)
            .await
    }

    /// Read the record in a transaction of its own.
    pub async fn read(env: &dyn StorageEnvironment) -> anyhow::Result<ProgressRecord> {
        let mut tx = env.begin(ConsistencyPolicy::LocalOnly).await?;
        let record = Self::load(&mut *tx).await?;
        tx.abort().await;
        Ok(record)
    }
}

mod hex_bytes {
    use serde::{
        de::Error,
        Deserialize,
        Deserializer,
        Serializer,
    };

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(D::Error::custom)
    }
}

mod hex_option {
    use serde::{
        de::Error,
        Deserialize,
        Deserializer,
        Serializer,
    };

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| hex::decode(s).map_err(D::Error::custom))
            .transpose()
    }
}
