use std::{
    collections::{
        BTreeMap,
        BTreeSet,
        VecDeque,
    },
    ops::Bound,
    sync::Arc,
};

use async_trait::async_trait;
use errors::ErrorMetadata;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{
    key::prefix_len,
    kv_store::{
        ConsistencyPolicy,
        DatabaseConfig,
        DatabaseName,
        ReplicationRole,
        ScanResult,
        StorageEnvironment,
        Transaction,
    },
    types::{
        Generation,
        PartitionId,
    },
};

#[derive(Clone, Default)]
struct TestDatabase {
    config: DatabaseConfig,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

type Databases = BTreeMap<DatabaseName, TestDatabase>;

struct TestStorageState {
    generation: Generation,
    valid: bool,
    num_partitions: u32,
    hosted: BTreeSet<PartitionId>,
    databases: Databases,
    injected_faults: VecDeque<ErrorMetadata>,
    commits: usize,
    /// Commit sequence number that last wrote each key.
    key_versions: BTreeMap<(DatabaseName, Vec<u8>), u64>,
}

struct Inner {
    state: Mutex<TestStorageState>,
    role_tx: watch::Sender<ReplicationRole>,
}

/// In-memory storage environment for one node. Transactions read and write a
/// private copy of every database and replay their writes on commit, so an
/// aborted or dropped transaction leaves no trace. A writing transaction that
/// read a key another transaction committed since it began fails with a lock
/// conflict.
#[derive(Clone)]
pub struct TestEnvironment {
    inner: Arc<Inner>,
}

impl TestEnvironment {
    /// A leader hosting partitions `0..num_partitions`.
    pub fn new(num_partitions: u32) -> Self {
        let hosted: BTreeSet<_> = (0..num_partitions).map(PartitionId).collect();
        let databases = hosted
            .iter()
            .map(|p| (DatabaseName::Partition(*p), TestDatabase::default()))
            .collect();
        let (role_tx, _) = watch::channel(ReplicationRole::Leader);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(TestStorageState {
                    generation: 1,
                    valid: true,
                    num_partitions,
                    hosted,
                    databases,
                    injected_faults: VecDeque::new(),
                    commits: 0,
                    key_versions: BTreeMap::new(),
                }),
                role_tx,
            }),
        }
    }

    pub fn set_role(&self, role: ReplicationRole) {
        self.inner.role_tx.send_replace(role);
    }

    /// Close the environment: every transaction fails until it is recycled.
    pub fn invalidate(&self) {
        self.inner.state.lock().valid = false;
    }

    /// Recycle the environment. Data survives, handles must be reopened.
    pub fn bump_generation(&self) {
        let mut state = self.inner.state.lock();
        state.generation += 1;
        state.valid = true;
    }

    /// Relocate a partition away from this node, taking its records along.
    pub fn remove_partition(&self, partition: PartitionId) {
        let mut state = self.inner.state.lock();
        state.hosted.remove(&partition);
        state.databases.remove(&DatabaseName::Partition(partition));
    }

    /// Fail each of the next `n` majority commits with `error`.
    pub fn fail_next_commits(&self, n: usize, error: ErrorMetadata) {
        let mut state = self.inner.state.lock();
        state
            .injected_faults
            .extend(std::iter::repeat(error).take(n));
    }

    pub fn commit_count(&self) -> usize {
        self.inner.state.lock().commits
    }

    /// Write a primary record directly, outside any transaction.
    pub fn insert_record(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        let partition = self.partition_of(key);
        let mut state = self.inner.state.lock();
        let db = state
            .databases
            .get_mut(&DatabaseName::Partition(partition))
            .ok_or_else(|| anyhow::anyhow!("Partition {partition} is not hosted here"))?;
        db.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    pub fn database_exists(&self, db: &DatabaseName) -> bool {
        self.inner.state.lock().databases.contains_key(db)
    }

    pub fn database_config(&self, db: &DatabaseName) -> Option<DatabaseConfig> {
        self.inner.state.lock().databases.get(db).map(|d| d.config)
    }

    pub fn entries(&self, db: &DatabaseName) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.inner
            .state
            .lock()
            .databases
            .get(db)
            .map(|d| d.entries.clone().into_iter().collect())
            .unwrap_or_default()
    }

    /// Every primary record on this node, across partitions, in key order.
    pub fn all_records(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let state = self.inner.state.lock();
        let mut records: Vec<_> = state
            .databases
            .iter()
            .filter(|(name, _)| matches!(name, DatabaseName::Partition(_)))
            .flat_map(|(_, db)| db.entries.clone())
            .collect();
        records.sort();
        records
    }
}

#[async_trait]
impl StorageEnvironment for TestEnvironment {
    fn generation(&self) -> Generation {
        self.inner.state.lock().generation
    }

    fn is_valid(&self) -> bool {
        self.inner.state.lock().valid
    }

    fn role(&self) -> ReplicationRole {
        *self.inner.role_tx.borrow()
    }

    fn subscribe_role(&self) -> watch::Receiver<ReplicationRole> {
        self.inner.role_tx.subscribe()
    }

    /// Records are placed by their first two key components (the top-level
    /// table and its first key component), so a record and all of its
    /// descendants share a partition.
    fn partition_of(&self, key: &[u8]) -> PartitionId {
        let num_partitions = self.inner.state.lock().num_partitions.max(1);
        let shard_key = &key[..prefix_len(key, 2).unwrap_or(key.len())];
        PartitionId((fxhash::hash64(shard_key) % num_partitions as u64) as u32)
    }

    fn hosted_partitions(&self) -> BTreeSet<PartitionId> {
        self.inner.state.lock().hosted.clone()
    }

    async fn begin(&self, policy: ConsistencyPolicy) -> anyhow::Result<Box<dyn Transaction>> {
        let state = self.inner.state.lock();
        if !state.valid {
            anyhow::bail!(ErrorMetadata::environment_invalid());
        }
        Ok(Box::new(TestTransaction {
            env: self.clone(),
            generation: state.generation,
            start_seq: state.commits as u64,
            policy,
            view: state.databases.clone(),
            reads: BTreeSet::new(),
            ops: vec![],
        }))
    }
}

enum WriteOp {
    Create(DatabaseName, DatabaseConfig),
    Remove(DatabaseName),
    Put(DatabaseName, Vec<u8>, Vec<u8>),
    Delete(DatabaseName, Vec<u8>),
}

struct TestTransaction {
    env: TestEnvironment,
    generation: Generation,
    start_seq: u64,
    policy: ConsistencyPolicy,
    view: Databases,
    reads: BTreeSet<(DatabaseName, Vec<u8>)>,
    ops: Vec<WriteOp>,
}

impl TestTransaction {
    fn db(&self, db: &DatabaseName) -> anyhow::Result<&TestDatabase> {
        self.view.get(db).ok_or_else(|| missing_database(db))
    }

    fn db_mut(&mut self, db: &DatabaseName) -> anyhow::Result<&mut TestDatabase> {
        self.view.get_mut(db).ok_or_else(|| missing_database(db))
    }
}

fn missing_database(db: &DatabaseName) -> anyhow::Error {
    anyhow::anyhow!(ErrorMetadata::not_found(
        "DatabaseNotFound",
        format!("Database {db:?} does not exist")
    ))
}

#[async_trait]
impl Transaction for TestTransaction {
    async fn open_database(
        &mut self,
        db: &DatabaseName,
        config: DatabaseConfig,
    ) -> anyhow::Result<()> {
        if self.view.contains_key(db) {
            return Ok(());
        }
        if !config.allow_create {
            return Err(missing_database(db));
        }
        self.view.insert(
            db.clone(),
            TestDatabase {
                config,
                entries: BTreeMap::new(),
            },
        );
        self.ops.push(WriteOp::Create(db.clone(), config));
        Ok(())
    }

    async fn remove_database(&mut self, db: &DatabaseName) -> anyhow::Result<bool> {
        let existed = self.view.remove(db).is_some();
        if existed {
            self.ops.push(WriteOp::Remove(db.clone()));
        }
        Ok(existed)
    }

    async fn get(&mut self, db: &DatabaseName, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let value = self.db(db)?.entries.get(key).cloned();
        self.reads.insert((db.clone(), key.to_vec()));
        Ok(value)
    }

    async fn put(&mut self, db: &DatabaseName, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        let database = self.db_mut(db)?;
        let value = if database.config.key_only {
            vec![]
        } else {
            value.to_vec()
        };
        database.entries.insert(key.to_vec(), value.clone());
        self.ops.push(WriteOp::Put(db.clone(), key.to_vec(), value));
        Ok(())
    }

    async fn delete(&mut self, db: &DatabaseName, key: &[u8]) -> anyhow::Result<bool> {
        let existed = self.db_mut(db)?.entries.remove(key).is_some();
        if existed {
            self.ops.push(WriteOp::Delete(db.clone(), key.to_vec()));
        }
        Ok(existed)
    }

    async fn scan(
        &mut self,
        db: &DatabaseName,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> anyhow::Result<ScanResult> {
        let lower = match after {
            Some(after) if after >= prefix => Bound::Excluded(after.to_vec()),
            _ => Bound::Included(prefix.to_vec()),
        };
        Ok(self
            .db(db)?
            .entries
            .range((lower, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        let TestTransaction {
            env,
            generation,
            start_seq,
            policy,
            reads,
            ops,
            ..
        } = *self;
        let role = env.role();
        let mut state = env.inner.state.lock();
        if !state.valid || state.generation != generation {
            anyhow::bail!(ErrorMetadata::environment_invalid());
        }
        if policy == ConsistencyPolicy::Majority {
            if let Some(fault) = state.injected_faults.pop_front() {
                anyhow::bail!(fault);
            }
        }
        if !ops.is_empty() && !role.is_leader() {
            anyhow::bail!(ErrorMetadata::not_leader());
        }
        if !ops.is_empty() {
            if let Some((db, _)) = reads
                .iter()
                .find(|read| state.key_versions.get(*read).is_some_and(|v| *v > start_seq))
            {
                anyhow::bail!(ErrorMetadata::lock_conflict(format!(
                    "A concurrent transaction wrote a key in {db:?} read by this one"
                )));
            }
        }
        let seq = state.commits as u64 + 1;
        for op in ops {
            match op {
                WriteOp::Create(name, config) => {
                    state.databases.entry(name).or_insert(TestDatabase {
                        config,
                        entries: BTreeMap::new(),
                    });
                },
                WriteOp::Remove(name) => {
                    state.databases.remove(&name);
                },
                WriteOp::Put(name, key, value) => {
                    if let Some(db) = state.databases.get_mut(&name) {
                        db.entries.insert(key.clone(), value);
                    }
                    state.key_versions.insert((name, key), seq);
                },
                WriteOp::Delete(name, key) => {
                    if let Some(db) = state.databases.get_mut(&name) {
                        db.entries.remove(&key);
                    }
                    state.key_versions.insert((name, key), seq);
                },
            }
        }
        state.commits += 1;
        Ok(())
    }

    async fn abort(self: Box<Self>) {}
}
