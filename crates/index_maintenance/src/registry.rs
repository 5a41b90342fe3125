use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    fmt,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
};

use arc_swap::ArcSwap;
use common::{
    catalog::{
        IndexMetadata,
        SecondaryKeyExtractor,
        TableMetadata,
    },
    key::{
        push_component,
        KeyComponents,
        KeyShape,
    },
    kv_store::{
        DatabaseName,
        StorageEnvironment,
        Transaction,
    },
    types::{
        Generation,
        IndexDbName,
        PartitionId,
        TableId,
    },
};
use errors::ErrorMetadata;
use parking_lot::{
    Mutex,
    MutexGuard,
};

use crate::{
    metrics::log_open_handles,
    scheduler::ActiveTask,
};

/// Secondary index entries are stored as `[secondary key] ++ primary key`:
/// the secondary key as one length-prefixed component, then the primary key
/// bytes unchanged. Entries sort by secondary key first and several records
/// may share a secondary key.
pub fn encode_entry(secondary_key: &[u8], primary_key: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut entry = Vec::with_capacity(2 + secondary_key.len() + primary_key.len());
    push_component(&mut entry, secondary_key)?;
    entry.extend_from_slice(primary_key);
    Ok(entry)
}

/// Split an entry into `(secondary key, primary key)`.
pub fn decode_entry(entry: &[u8]) -> Option<(&[u8], &[u8])> {
    let mut components = KeyComponents::new(entry);
    let secondary_key = components.next()?;
    Some((secondary_key, components.remaining()))
}

/// An open secondary index on this node.
pub struct IndexHandle {
    pub db_name: IndexDbName,
    pub index_name: String,
    pub table_id: TableId,
    pub table_name: String,
    pub multi_key: bool,
    pub key_only: bool,
    /// Keys of the indexed table's records.
    pub key_shape: KeyShape,
    /// Prefix shared by every record of the indexed table's family.
    pub scan_prefix: Vec<u8>,
    /// Environment generation the handle was opened under.
    pub generation: Generation,
    database: DatabaseName,
    extractor: Arc<dyn SecondaryKeyExtractor>,
    /// Set while the index is being populated. Writes then tolerate entries
    /// that are missing on delete or already present on insert.
    incremental_population: AtomicBool,
}

impl fmt::Debug for IndexHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexHandle")
            .field("db_name", &self.db_name)
            .field("generation", &self.generation)
            .field("populating", &self.is_populating())
            .finish()
    }
}

/// Result of one bounded pass over an index's entries.
#[derive(Debug, Default)]
pub struct CleanResult {
    pub scanned: usize,
    pub deleted: usize,
    /// `(secondary key, primary key)` of the last entry scanned.
    pub last: Option<(Vec<u8>, Vec<u8>)>,
}

impl IndexHandle {
    pub fn new(
        table: &TableMetadata,
        index: &IndexMetadata,
        key_shape: KeyShape,
        generation: Generation,
        populating: bool,
    ) -> anyhow::Result<Self> {
        if index.name.is_empty() || index.name.contains('.') {
            anyhow::bail!(ErrorMetadata::invalid_definition(
                "InvalidIndexName",
                format!("Index name {:?} on {} is not valid", index.name, table.full_name),
            ));
        }
        let scan_prefix = key_shape.top_level_prefix().map_err(|e| {
            e.context(ErrorMetadata::invalid_definition(
                "InvalidKeyShape",
                format!("Table {} has no key shape", table.full_name),
            ))
        })?;
        let db_name = table.index_db_name(index);
        Ok(Self {
            database: DatabaseName::Secondary(db_name.clone()),
            db_name,
            index_name: index.name.clone(),
            table_id: table.id,
            table_name: table.full_name.clone(),
            multi_key: index.multi_key,
            key_only: index.key_only,
            key_shape,
            scan_prefix,
            generation,
            extractor: index.extractor.clone(),
            incremental_population: AtomicBool::new(populating),
        })
    }

    pub fn database(&self) -> &DatabaseName {
        &self.database
    }

    pub fn is_populating(&self) -> bool {
        self.incremental_population.load(Ordering::SeqCst)
    }

    pub fn set_populating(&self, populating: bool) {
        self.incremental_population
            .store(populating, Ordering::SeqCst);
    }

    /// True iff `primary_key` is the key of a record of the indexed table.
    pub fn matches(&self, primary_key: &[u8]) -> bool {
        self.key_shape.matches(primary_key)
    }

    pub fn secondary_keys(
        &self,
        primary_key: &[u8],
        value: Option<&[u8]>,
    ) -> anyhow::Result<Vec<Vec<u8>>> {
        let value = if self.key_only { None } else { value };
        let keys = self.extractor.extract(primary_key, value)?;
        if !self.multi_key && keys.len() > 1 {
            anyhow::bail!(ErrorMetadata::invalid_definition(
                "TooManySecondaryKeys",
                format!(
                    "Single-key index {} produced {} keys for one record",
                    self.db_name,
                    keys.len()
                ),
            ));
        }
        Ok(keys)
    }

    /// Write the entries of one primary record. Returns how many entries
    /// were written.
    pub async fn insert_entries(
        &self,
        tx: &mut dyn Transaction,
        primary_key: &[u8],
        value: Option<&[u8]>,
    ) -> anyhow::Result<usize> {
        let keys = self.secondary_keys(primary_key, value)?;
        for secondary_key in &keys {
            let entry = encode_entry(secondary_key, primary_key)?;
            tx.put(&self.database, &entry, &[]).await?;
        }
        Ok(keys.len())
    }

    /// Remove the entries of one primary record, given its value before the
    /// write. Returns `(expected, removed)` entry counts.
    pub async fn delete_entries(
        &self,
        tx: &mut dyn Transaction,
        primary_key: &[u8],
        value: Option<&[u8]>,
    ) -> anyhow::Result<(usize, usize)> {
        let keys = self.secondary_keys(primary_key, value)?;
        let mut removed = 0;
        for secondary_key in &keys {
            let entry = encode_entry(secondary_key, primary_key)?;
            if tx.delete(&self.database, &entry).await? {
                removed += 1;
            }
        }
        Ok((keys.len(), removed))
    }

    /// Scan up to `limit` entries after `after` and delete those whose
    /// primary record lives in a partition this node does not host.
    pub async fn clean_orphans(
        &self,
        tx: &mut dyn Transaction,
        env: &dyn StorageEnvironment,
        hosted: &BTreeSet<PartitionId>,
        after: Option<&[u8]>,
        limit: usize,
    ) -> anyhow::Result<CleanResult> {
        let entries = tx.scan(&self.database, &[], after, limit).await?;
        let mut result = CleanResult {
            scanned: entries.len(),
            ..Default::default()
        };
        for (entry, _) in &entries {
            let orphaned = match decode_entry(entry) {
                Some((_, primary_key)) => !hosted.contains(&env.partition_of(primary_key)),
                None => {
                    tracing::warn!("Removing malformed entry {entry:?} from {}", self.db_name);
                    true
                },
            };
            if orphaned && tx.delete(&self.database, entry).await? {
                result.deleted += 1;
            }
        }
        result.last = entries.last().and_then(|(entry, _)| {
            decode_entry(entry).map(|(secondary_key, primary_key)| {
                (secondary_key.to_vec(), primary_key.to_vec())
            })
        });
        Ok(result)
    }
}

pub type HandleMap = BTreeMap<IndexDbName, Arc<IndexHandle>>;

/// State guarded by the maintenance lock: the open handles and the running
/// maintenance task, if any. A task records which index it works on here so
/// the reconciler never closes a handle under it.
#[derive(Default)]
pub struct MaintenanceState {
    pub handles: HandleMap,
    pub active_task: Option<ActiveTask>,
}

impl MaintenanceState {
    /// If the active task is working on `name`, the task to stop before the
    /// handle may be closed.
    pub fn task_using(&self, name: &IndexDbName) -> Option<&ActiveTask> {
        self.active_task
            .as_ref()
            .filter(|task| task.current_index.as_ref() == Some(name))
    }

    pub fn set_current_index(&mut self, task_id: u64, index: Option<IndexDbName>) {
        match self.active_task.as_mut() {
            Some(task) if task.id == task_id => task.current_index = index,
            _ => {},
        }
    }
}

/// Owns the open handles. Writers go through the maintenance lock; the
/// write path reads a published copy of the handle map without locking.
pub struct HandleRegistry {
    state: Mutex<MaintenanceState>,
    published: ArcSwap<HandleMap>,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self {
            state: Mutex::new(MaintenanceState::default()),
            published: ArcSwap::from_pointee(BTreeMap::new()),
        }
    }
}

impl HandleRegistry {
    pub fn get(&self, name: &IndexDbName) -> Option<Arc<IndexHandle>> {
        self.published.load().get(name).cloned()
    }

    pub fn handles(&self) -> Arc<HandleMap> {
        self.published.load_full()
    }

    /// Run `f` under the maintenance lock. Must not be called from code
    /// that holds it.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut MaintenanceState) -> R) -> R {
        let mut state = self.state.lock();
        let result = f(&mut state);
        self.publish(&state);
        result
    }

    /// Like `with_state` but gives up instead of waiting for the lock.
    pub fn try_with_state<R>(&self, f: impl FnOnce(&mut MaintenanceState) -> R) -> Option<R> {
        let mut state = self.state.try_lock()?;
        let result = f(&mut state);
        self.publish(&state);
        Some(result)
    }

    pub fn is_locked(&self) -> bool {
        self.state.is_locked()
    }

    fn publish(&self, state: &MutexGuard<'_, MaintenanceState>) {
        if !same_handles(&self.published.load(), &state.handles) {
            self.published.store(Arc::new(state.handles.clone()));
            log_open_handles(state.handles.len());
        }
    }
}

fn same_handles(a: &HandleMap, b: &HandleMap) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|((name_a, a), (name_b, b))| name_a == name_b && Arc::ptr_eq(a, b))
}
