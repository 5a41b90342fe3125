use std::{
    collections::BTreeSet,
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use common::{
    catalog::MetadataCatalog,
    key::KeyPath,
    kv_store::{
        ConsistencyPolicy,
        DatabaseName,
        ReplicationRole,
        StorageEnvironment,
    },
    runtime::Runtime,
    shutdown::{
        ShutdownMessage,
        ShutdownSignal,
    },
    testing::{
        JsonFieldExtractor,
        KeyComponentExtractor,
        TestCatalog,
        TestEnvironment,
    },
    types::{
        IndexDbName,
        TableId,
    },
};
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use maplit::btreeset;
use pretty_assertions::assert_eq;
use runtime::{
    prod::ProdRuntime,
    testing::TestRuntime,
};
use tokio::sync::mpsc;

use crate::{
    decode_entry,
    progress::ProgressStore,
    CheckOutcome,
    DeletedTableStatus,
    IndexManager,
    MaintenanceConfig,
    ReconcileOutcome,
    SecondaryIndexStatus,
    TaskKind,
};

const NUM_PARTITIONS: u32 = 4;
const NUM_ORDERS: usize = 12;
const ITEMS_PER_ORDER: usize = 3;
const NUM_AUDIT_RECORDS: usize = 10;

type Entries = BTreeSet<(Vec<u8>, Vec<u8>)>;

fn key(components: &[&str]) -> Vec<u8> {
    KeyPath::from_components(components)
        .expect("valid key")
        .into_bytes()
}

fn order_key(order: usize) -> Vec<u8> {
    key(&["10", order.to_string().as_str()])
}

fn item_key(order: usize, item: usize) -> Vec<u8> {
    key(&[
        "10",
        order.to_string().as_str(),
        "11",
        item.to_string().as_str(),
    ])
}

fn audit_key(n: usize) -> Vec<u8> {
    key(&["12", n.to_string().as_str()])
}

fn test_config() -> MaintenanceConfig {
    MaintenanceConfig {
        enabled: true,
        batch_size: 4,
        max_retries: 3,
        retry_delay: Duration::from_millis(10),
        reconciler_retry_delay: Duration::from_millis(10),
        busy_retry_delay: Duration::from_millis(1),
        busy_max_retries: 5,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(100),
    }
}

/// `orders(1) -> items(1)` plus an unrelated `audit(1)` table, with records
/// spread over four partitions and no indexes yet.
struct Fixture {
    env: TestEnvironment,
    catalog: TestCatalog,
    /// `(sku, item key)` of every item.
    skus: Entries,
}

fn orders_fixture() -> anyhow::Result<Fixture> {
    let env = TestEnvironment::new(NUM_PARTITIONS);
    let catalog = TestCatalog::new();
    catalog.add_table("orders", 1)?;
    catalog.add_table("orders.items", 1)?;
    catalog.add_table("audit", 1)?;
    let mut skus = BTreeSet::new();
    for order in 0..NUM_ORDERS {
        let customer = format!(r#"{{"customer": "c{}"}}"#, order % 3);
        env.insert_record(&order_key(order), customer.as_bytes())?;
        for item in 0..ITEMS_PER_ORDER {
            let sku = format!("sku-{}", (order + item) % 5);
            let value = format!(r#"{{"sku": "{sku}"}}"#);
            env.insert_record(&item_key(order, item), value.as_bytes())?;
            skus.insert((sku.into_bytes(), item_key(order, item)));
        }
    }
    for n in 0..NUM_AUDIT_RECORDS {
        env.insert_record(&audit_key(n), br#"{"actor": "ops"}"#)?;
    }
    Ok(Fixture {
        env,
        catalog,
        skus,
    })
}

fn sku_index() -> Arc<JsonFieldExtractor> {
    Arc::new(JsonFieldExtractor::new("sku"))
}

struct TestNode {
    rt: TestRuntime,
    env: TestEnvironment,
    catalog: TestCatalog,
    manager: IndexManager<TestRuntime>,
    shutdown_rx: mpsc::UnboundedReceiver<ShutdownMessage>,
}

impl TestNode {
    fn start(rt: TestRuntime, env: TestEnvironment, catalog: TestCatalog) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let manager = IndexManager::start(
            rt.clone(),
            Arc::new(env.clone()),
            Arc::new(catalog.clone()),
            test_config(),
            ShutdownSignal::new(shutdown_tx, "test-node".to_owned()),
        );
        Self {
            rt,
            env,
            catalog,
            manager,
            shutdown_rx,
        }
    }

    /// Let every background loop run until it is idle or waiting on a timer
    /// longer than any retry delay.
    async fn settle(&self) {
        self.rt.wait(Duration::from_secs(1)).await;
    }

    fn index_entries(&self, index_name: &str, table_name: &str) -> Entries {
        self.env
            .entries(&DatabaseName::Secondary(IndexDbName::new(index_name, table_name)))
            .into_iter()
            .filter_map(|(entry, _)| {
                decode_entry(&entry).map(|(secondary, primary)| (secondary.to_vec(), primary.to_vec()))
            })
            .collect()
    }

    /// Write a primary record the way the write path does: record and index
    /// entries in one transaction.
    async fn write(&self, key: &[u8], value: Option<&[u8]>) -> anyhow::Result<usize> {
        let db = DatabaseName::Partition(self.env.partition_of(key));
        let mut tx = self.env.begin(ConsistencyPolicy::Majority).await?;
        let old = tx.get(&db, key).await?;
        match value {
            Some(value) => tx.put(&db, key, value).await?,
            None => {
                tx.delete(&db, key).await?;
            },
        }
        let changed = self
            .manager
            .update_secondary_entries(&mut *tx, key, old.as_deref(), value)
            .await?;
        tx.commit().await?;
        Ok(changed)
    }

    fn assert_no_shutdown(&mut self) {
        assert!(self.shutdown_rx.try_recv().is_err());
    }

    /// Yield until `index_name` has some entries, ie population has
    /// committed at least one batch.
    async fn wait_for_first_entries(&self, index_name: &str, table_name: &str) {
        for _ in 0..1000 {
            if !self.index_entries(index_name, table_name).is_empty() {
                return;
            }
            tokio::task::yield_now().await;
        }
    }
}

async fn populated_node(rt: TestRuntime) -> anyhow::Result<(TestNode, Fixture)> {
    let fixture = orders_fixture()?;
    let node = TestNode::start(rt, fixture.env.clone(), fixture.catalog.clone());
    node.settle().await;
    node.catalog
        .add_index("orders.items", "ix_sku", false, false, sku_index())?;
    node.settle().await;
    assert!(
        node.manager
            .is_index_population_complete("ix_sku", "orders.items")
            .await?
    );
    Ok((node, fixture))
}

#[maintenance_macro::test_runtime]
async fn test_populate_existing_records(rt: TestRuntime) -> anyhow::Result<()> {
    let (mut node, fixture) = populated_node(rt).await?;
    let handle = node
        .manager
        .index_handle("ix_sku", "orders.items")
        .context("ix_sku is not open")?;
    assert!(!handle.is_populating());
    assert_eq!(node.index_entries("ix_sku", "orders.items"), fixture.skus);
    assert_eq!(
        node.manager.routing().lookup(&item_key(3, 1)),
        &btreeset! { IndexDbName::new("ix_sku", "orders.items") }
    );
    assert!(node.manager.routing().lookup(&order_key(3)).is_empty());
    assert_eq!(node.manager.active_task(), None);
    assert!(!node.manager.is_maintenance_busy());
    assert_eq!(node.manager.check_maintenance().await?, CheckOutcome::Idle);
    node.assert_no_shutdown();
    Ok(())
}

#[maintenance_macro::test_runtime]
async fn test_writes_keep_index_current(rt: TestRuntime) -> anyhow::Result<()> {
    let (mut node, fixture) = populated_node(rt).await?;
    let mut expected = fixture.skus.clone();

    let new_item = item_key(0, 9);
    assert_eq!(node.write(&new_item, Some(br#"{"sku": "sku-new"}"#)).await?, 1);
    expected.insert((b"sku-new".to_vec(), new_item.clone()));
    assert_eq!(node.index_entries("ix_sku", "orders.items"), expected);

    // Changing the indexed field moves the entry.
    assert_eq!(node.write(&new_item, Some(br#"{"sku": "sku-moved"}"#)).await?, 2);
    expected.remove(&(b"sku-new".to_vec(), new_item.clone()));
    expected.insert((b"sku-moved".to_vec(), new_item.clone()));
    assert_eq!(node.index_entries("ix_sku", "orders.items"), expected);

    assert_eq!(node.write(&new_item, None).await?, 1);
    expected.remove(&(b"sku-moved".to_vec(), new_item));
    assert_eq!(node.index_entries("ix_sku", "orders.items"), expected);

    // Records of unindexed tables touch no index.
    assert_eq!(node.write(&audit_key(99), Some(br#"{"actor": "x"}"#)).await?, 0);
    assert_eq!(node.write(&order_key(99), Some(br#"{"sku": "x"}"#)).await?, 0);
    assert_eq!(node.index_entries("ix_sku", "orders.items"), expected);
    node.assert_no_shutdown();
    Ok(())
}

#[maintenance_macro::test_runtime]
async fn test_populate_retries_transient_failures(rt: TestRuntime) -> anyhow::Result<()> {
    let fixture = orders_fixture()?;
    let mut node = TestNode::start(rt, fixture.env.clone(), fixture.catalog.clone());
    node.settle().await;
    node.env
        .fail_next_commits(2, ErrorMetadata::lock_conflict("record locked by a writer"));
    node.catalog
        .add_index("orders.items", "ix_sku", false, false, sku_index())?;
    node.settle().await;
    assert!(
        node.manager
            .is_index_population_complete("ix_sku", "orders.items")
            .await?
    );
    assert_eq!(node.index_entries("ix_sku", "orders.items"), fixture.skus);
    node.assert_no_shutdown();
    Ok(())
}

#[maintenance_macro::test_runtime]
async fn test_exhausted_retries_signal_shutdown(rt: TestRuntime) -> anyhow::Result<()> {
    let fixture = orders_fixture()?;
    let mut node = TestNode::start(rt, fixture.env.clone(), fixture.catalog.clone());
    node.settle().await;
    node.env.fail_next_commits(
        10,
        ErrorMetadata::insufficient_replicas("replicas did not acknowledge"),
    );
    node.catalog
        .add_index("orders.items", "ix_sku", false, false, sku_index())?;
    node.settle().await;

    let message = node.shutdown_rx.try_recv()?;
    assert!(message.error.is_transient());
    assert_eq!(message.node_name, "test-node");
    assert_eq!(node.manager.active_task(), None);
    assert!(
        !node
            .manager
            .is_index_population_complete("ix_sku", "orders.items")
            .await?
    );
    Ok(())
}

#[maintenance_macro::test_runtime]
async fn test_role_loss_stops_population_and_new_leader_resumes(
    rt: TestRuntime,
) -> anyhow::Result<()> {
    let fixture = orders_fixture()?;
    let mut node = TestNode::start(rt, fixture.env.clone(), fixture.catalog.clone());
    node.settle().await;
    node.catalog
        .add_index("orders.items", "ix_sku", false, false, sku_index())?;

    node.wait_for_first_entries("ix_sku", "orders.items").await;
    assert_eq!(node.manager.active_task(), Some(TaskKind::Populate));
    node.env.set_role(ReplicationRole::Replica);
    node.settle().await;

    assert_eq!(node.manager.active_task(), None);
    let partial = node.index_entries("ix_sku", "orders.items");
    assert!(!partial.is_empty());
    assert!(partial.len() < fixture.skus.len());
    assert!(
        !node
            .manager
            .is_index_population_complete("ix_sku", "orders.items")
            .await?
    );
    assert_eq!(node.manager.check_maintenance().await?, CheckOutcome::NotLeader);
    let progress = node.manager.progress_snapshot().await?;
    let status = &progress.secondaries[&IndexDbName::new("ix_sku", "orders.items")];
    assert!(!status.completed_partitions.is_empty() || status.resume_key.is_some());

    node.env.set_role(ReplicationRole::Leader);
    node.settle().await;
    assert!(
        node.manager
            .is_index_population_complete("ix_sku", "orders.items")
            .await?
    );
    assert_eq!(node.index_entries("ix_sku", "orders.items"), fixture.skus);
    node.assert_no_shutdown();
    Ok(())
}

#[maintenance_macro::test_runtime]
async fn test_drop_index_closes_handle_and_forgets_progress(rt: TestRuntime) -> anyhow::Result<()> {
    let (mut node, _fixture) = populated_node(rt).await?;
    node.catalog.drop_index("orders.items", "ix_sku")?;
    node.settle().await;

    assert!(node.manager.index_handle("ix_sku", "orders.items").is_none());
    assert!(!node
        .env
        .database_exists(&DatabaseName::Secondary(IndexDbName::new(
            "ix_sku",
            "orders.items"
        ))));
    assert!(
        !node
            .manager
            .is_index_population_complete("ix_sku", "orders.items")
            .await?
    );
    assert!(node.manager.progress_snapshot().await?.secondaries.is_empty());
    assert!(node.manager.routing().lookup(&item_key(3, 1)).is_empty());
    assert_eq!(node.write(&item_key(3, 1), Some(br#"{"sku": "x"}"#)).await?, 0);
    node.assert_no_shutdown();
    Ok(())
}

#[maintenance_macro::test_runtime]
async fn test_secondary_cleaning_after_partition_moves(rt: TestRuntime) -> anyhow::Result<()> {
    let (mut node, fixture) = populated_node(rt).await?;
    let moved = node.env.partition_of(&item_key(0, 0));
    node.env.remove_partition(moved);

    assert_eq!(node.manager.mark_for_secondary_cleaning().await?, 1);
    // Only one task runs at a time.
    assert_eq!(node.manager.active_task(), Some(TaskKind::SecondaryClean));
    assert!(node.manager.is_maintenance_busy());
    assert_eq!(
        node.manager.check_maintenance().await?,
        CheckOutcome::AlreadyRunning(TaskKind::SecondaryClean)
    );
    node.settle().await;

    let expected: Entries = fixture
        .skus
        .iter()
        .filter(|(_, primary_key)| node.env.partition_of(primary_key) != moved)
        .cloned()
        .collect();
    assert!(expected.len() < fixture.skus.len());
    assert_eq!(node.index_entries("ix_sku", "orders.items"), expected);
    let progress = node.manager.progress_snapshot().await?;
    let status = &progress.secondaries[&IndexDbName::new("ix_sku", "orders.items")];
    assert!(!status.needs_cleaning);
    assert_eq!(status.resume_key, None);
    assert_eq!(node.manager.active_task(), None);
    node.assert_no_shutdown();
    Ok(())
}

#[maintenance_macro::test_runtime]
async fn test_dropped_table_records_are_deleted(rt: TestRuntime) -> anyhow::Result<()> {
    let (mut node, fixture) = populated_node(rt).await?;
    node.catalog.mark_deleting("orders.items")?;
    node.settle().await;

    // The table's index is closed and its records are gone; its parent's
    // records are untouched.
    assert!(node.manager.index_handle("ix_sku", "orders.items").is_none());
    let records = node.env.all_records();
    assert!(records
        .iter()
        .all(|(key, _)| !fixture.skus.iter().any(|(_, item)| item == key)));
    assert_eq!(records.len(), NUM_ORDERS + NUM_AUDIT_RECORDS);
    assert!(
        node.manager
            .is_table_data_deletion_complete("orders.items")
            .await?
    );

    // Orchestration removes the table once deletion is acknowledged.
    node.catalog.remove_table("orders.items")?;
    node.settle().await;
    assert!(node.manager.progress_snapshot().await?.deleted_tables.is_empty());
    assert!(
        node.manager
            .is_table_data_deletion_complete("orders.items")
            .await?
    );

    // A top-level table is deleted whole.
    assert!(
        !node
            .manager
            .is_table_data_deletion_complete("audit")
            .await?
    );
    node.catalog.mark_deleting("audit")?;
    node.settle().await;
    assert_eq!(node.env.all_records().len(), NUM_ORDERS);
    assert!(
        node.manager
            .is_table_data_deletion_complete("audit")
            .await?
    );
    node.assert_no_shutdown();
    Ok(())
}

#[maintenance_macro::test_runtime]
async fn test_deleting_table_with_children_is_fatal(rt: TestRuntime) -> anyhow::Result<()> {
    let fixture = orders_fixture()?;
    let mut node = TestNode::start(rt, fixture.env.clone(), fixture.catalog.clone());
    node.settle().await;
    node.catalog.mark_deleting("orders")?;
    node.settle().await;

    let message = node.shutdown_rx.try_recv()?;
    assert!(message.error.is_invariant_violation());
    assert_eq!(node.env.all_records().len(), fixture.env.all_records().len());
    Ok(())
}

#[maintenance_macro::test_runtime]
async fn test_reconcile_is_idempotent_and_reopens_after_recycle(
    rt: TestRuntime,
) -> anyhow::Result<()> {
    let (mut node, _fixture) = populated_node(rt).await?;
    assert_eq!(node.manager.reconcile().await?, ReconcileOutcome::default());

    node.env.bump_generation();
    assert_eq!(
        node.manager.reconcile().await?,
        ReconcileOutcome {
            reopened: 1,
            ..Default::default()
        }
    );
    let handle = node
        .manager
        .index_handle("ix_sku", "orders.items")
        .context("ix_sku is not open")?;
    assert_eq!(handle.generation, node.env.generation());
    assert!(!handle.is_populating());
    assert_eq!(node.manager.reconcile().await?, ReconcileOutcome::default());
    node.assert_no_shutdown();
    Ok(())
}

#[maintenance_macro::test_runtime]
async fn test_replica_waits_for_leader_to_create_index(rt: TestRuntime) -> anyhow::Result<()> {
    let fixture = orders_fixture()?;
    fixture.env.set_role(ReplicationRole::Replica);
    let mut node = TestNode::start(rt, fixture.env.clone(), fixture.catalog.clone());
    node.settle().await;
    node.catalog
        .add_index("orders.items", "ix_sku", false, false, sku_index())?;
    node.settle().await;

    // Replicas never create index databases.
    assert!(node.manager.index_handle("ix_sku", "orders.items").is_none());
    assert_eq!(node.manager.active_task(), None);

    node.env.set_role(ReplicationRole::Leader);
    node.settle().await;
    assert!(node.manager.index_handle("ix_sku", "orders.items").is_some());
    assert!(
        node.manager
            .is_index_population_complete("ix_sku", "orders.items")
            .await?
    );
    assert_eq!(node.index_entries("ix_sku", "orders.items"), fixture.skus);
    node.assert_no_shutdown();
    Ok(())
}

#[maintenance_macro::test_runtime]
async fn test_invalid_index_is_skipped(rt: TestRuntime) -> anyhow::Result<()> {
    let fixture = orders_fixture()?;
    let mut node = TestNode::start(rt, fixture.env.clone(), fixture.catalog.clone());
    node.catalog.add_index(
        "audit",
        "bad.name",
        false,
        false,
        Arc::new(JsonFieldExtractor::new("actor")),
    )?;
    // Key-only and multi-key: one entry per record, keyed by its id.
    node.catalog.add_index(
        "audit",
        "ix_audit_id",
        true,
        true,
        Arc::new(KeyComponentExtractor { component: 1 }),
    )?;
    node.settle().await;

    assert!(node.manager.index_handle("bad.name", "audit").is_none());
    assert!(
        node.manager
            .is_index_population_complete("ix_audit_id", "audit")
            .await?
    );
    let expected: Entries = (0..NUM_AUDIT_RECORDS)
        .map(|n| (n.to_string().into_bytes(), audit_key(n)))
        .collect();
    assert_eq!(node.index_entries("ix_audit_id", "audit"), expected);
    assert_eq!(
        node.manager.reconcile().await?,
        ReconcileOutcome {
            skipped: 1,
            ..Default::default()
        }
    );
    node.assert_no_shutdown();
    Ok(())
}

#[maintenance_macro::test_runtime]
async fn test_shutdown_stops_maintenance(rt: TestRuntime) -> anyhow::Result<()> {
    let (mut node, _fixture) = populated_node(rt).await?;
    node.manager.shutdown().await?;
    assert_eq!(node.manager.check_maintenance().await?, CheckOutcome::Disabled);

    // Catalog updates are no longer followed.
    node.catalog
        .add_index("orders", "ix_customer", false, false, sku_index())?;
    node.settle().await;
    assert!(node.manager.index_handle("ix_customer", "orders").is_none());
    assert!(node.manager.index_handle("ix_sku", "orders.items").is_some());
    node.assert_no_shutdown();
    Ok(())
}

#[maintenance_macro::test_runtime]
async fn test_new_index_preempts_secondary_cleaning(rt: TestRuntime) -> anyhow::Result<()> {
    let (mut node, fixture) = populated_node(rt).await?;
    let ix_sku = IndexDbName::new("ix_sku", "orders.items");
    assert_eq!(node.manager.mark_for_secondary_cleaning().await?, 1);
    assert_eq!(node.manager.active_task(), Some(TaskKind::SecondaryClean));
    node.catalog.add_index(
        "orders",
        "ix_customer",
        false,
        false,
        Arc::new(JsonFieldExtractor::new("customer")),
    )?;

    // Population takes over while the cleaning pass is still unfinished.
    let mut populated_during_cleaning = false;
    for _ in 0..1000 {
        tokio::task::yield_now().await;
        if node.manager.active_task() == Some(TaskKind::Populate) {
            let progress = node.manager.progress_snapshot().await?;
            assert!(progress.secondaries[&ix_sku].needs_cleaning);
            populated_during_cleaning = true;
            break;
        }
    }
    assert!(populated_during_cleaning);
    node.settle().await;

    assert!(
        node.manager
            .is_index_population_complete("ix_customer", "orders")
            .await?
    );
    let customers: Entries = (0..NUM_ORDERS)
        .map(|order| (format!("c{}", order % 3).into_bytes(), order_key(order)))
        .collect();
    assert_eq!(node.index_entries("ix_customer", "orders"), customers);
    let progress = node.manager.progress_snapshot().await?;
    assert!(!progress.secondaries[&ix_sku].needs_cleaning);
    assert_eq!(node.index_entries("ix_sku", "orders.items"), fixture.skus);
    assert_eq!(node.manager.active_task(), None);
    node.assert_no_shutdown();
    Ok(())
}

#[maintenance_macro::test_runtime]
async fn test_leadership_flip_within_one_notification(rt: TestRuntime) -> anyhow::Result<()> {
    let fixture = orders_fixture()?;
    let mut node = TestNode::start(rt, fixture.env.clone(), fixture.catalog.clone());
    node.settle().await;
    node.catalog
        .add_index("orders.items", "ix_sku", false, false, sku_index())?;
    node.wait_for_first_entries("ix_sku", "orders.items").await;
    assert_eq!(node.manager.active_task(), Some(TaskKind::Populate));

    node.env.set_role(ReplicationRole::Replica);
    node.env.set_role(ReplicationRole::Leader);
    node.settle().await;

    assert!(
        node.manager
            .is_index_population_complete("ix_sku", "orders.items")
            .await?
    );
    assert_eq!(node.index_entries("ix_sku", "orders.items"), fixture.skus);
    node.assert_no_shutdown();
    Ok(())
}

#[maintenance_macro::test_runtime]
async fn test_task_stopped_by_stale_leadership_restarts(rt: TestRuntime) -> anyhow::Result<()> {
    let fixture = orders_fixture()?;
    let mut node = TestNode::start(rt, fixture.env.clone(), fixture.catalog.clone());
    node.settle().await;
    // The first batch commits after leadership moved away and came back,
    // with no role notification left to observe.
    node.env.fail_next_commits(1, ErrorMetadata::not_leader());
    node.catalog
        .add_index("orders.items", "ix_sku", false, false, sku_index())?;
    node.settle().await;

    assert!(
        node.manager
            .is_index_population_complete("ix_sku", "orders.items")
            .await?
    );
    assert_eq!(node.index_entries("ix_sku", "orders.items"), fixture.skus);
    node.assert_no_shutdown();
    Ok(())
}

#[maintenance_macro::test_runtime]
async fn test_check_maintenance_never_waits_for_the_lock(rt: TestRuntime) -> anyhow::Result<()> {
    let (mut node, _fixture) = populated_node(rt).await?;
    let (busy, outcome) = node.manager.registry().with_state(|_| {
        (
            node.manager.is_maintenance_busy(),
            futures::executor::block_on(node.manager.check_maintenance()),
        )
    });
    assert!(busy);
    assert_eq!(outcome?, CheckOutcome::Busy);

    assert!(!node.manager.is_maintenance_busy());
    assert_eq!(node.manager.check_maintenance().await?, CheckOutcome::Idle);
    node.assert_no_shutdown();
    Ok(())
}

#[maintenance_macro::test_runtime]
async fn test_concurrent_checks_start_one_task(rt: TestRuntime) -> anyhow::Result<()> {
    let (mut node, _fixture) = populated_node(rt).await?;
    let ix_sku = IndexDbName::new("ix_sku", "orders.items");
    // Flag cleaning without asking the scheduler to start anything.
    let mut tx = node.env.begin(ConsistencyPolicy::Majority).await?;
    let mut record = ProgressStore::load(&mut *tx).await?;
    assert_eq!(record.mark_all_for_cleaning(), 1);
    ProgressStore::save(&mut *tx, &record).await?;
    tx.commit().await?;

    let outcomes = futures::future::join_all((0..8).map(|_| node.manager.check_maintenance()))
        .await
        .into_iter()
        .collect::<anyhow::Result<Vec<_>>>()?;
    let started = outcomes
        .iter()
        .filter(|outcome| **outcome == CheckOutcome::Started(TaskKind::SecondaryClean))
        .count();
    assert_eq!(started, 1);
    assert!(outcomes.iter().all(|outcome| matches!(
        outcome,
        CheckOutcome::Started(TaskKind::SecondaryClean)
            | CheckOutcome::AlreadyRunning(TaskKind::SecondaryClean)
    )));

    node.settle().await;
    assert_eq!(node.manager.active_task(), None);
    let progress = node.manager.progress_snapshot().await?;
    assert!(!progress.secondaries[&ix_sku].needs_cleaning);
    node.assert_no_shutdown();
    Ok(())
}

#[maintenance_macro::test_runtime]
async fn test_restarted_manager_resumes_population(rt: TestRuntime) -> anyhow::Result<()> {
    let fixture = orders_fixture()?;
    let ix_sku = IndexDbName::new("ix_sku", "orders.items");
    let mut node = TestNode::start(rt.clone(), fixture.env.clone(), fixture.catalog.clone());
    node.settle().await;
    node.catalog
        .add_index("orders.items", "ix_sku", false, false, sku_index())?;
    node.wait_for_first_entries("ix_sku", "orders.items").await;
    node.manager.shutdown().await?;

    let partial = node.index_entries("ix_sku", "orders.items");
    assert!(!partial.is_empty());
    assert!(partial.len() < fixture.skus.len());
    let progress = node.manager.progress_snapshot().await?;
    let status = &progress.secondaries[&ix_sku];
    assert!(status.needs_populating);
    assert!(!status.completed_partitions.is_empty() || status.resume_key.is_some());
    node.assert_no_shutdown();

    // A new manager over the same storage picks up from the saved position.
    let mut restarted = TestNode::start(rt, fixture.env.clone(), fixture.catalog.clone());
    restarted.settle().await;
    assert!(
        restarted
            .manager
            .is_index_population_complete("ix_sku", "orders.items")
            .await?
    );
    assert_eq!(restarted.index_entries("ix_sku", "orders.items"), fixture.skus);
    assert_eq!(
        restarted
            .env
            .entries(&DatabaseName::Secondary(ix_sku))
            .len(),
        fixture.skus.len()
    );
    restarted.assert_no_shutdown();
    Ok(())
}

#[maintenance_macro::test_runtime]
async fn test_writes_during_population(rt: TestRuntime) -> anyhow::Result<()> {
    let fixture = orders_fixture()?;
    let ix_sku = IndexDbName::new("ix_sku", "orders.items");
    let mut node = TestNode::start(rt, fixture.env.clone(), fixture.catalog.clone());
    node.settle().await;
    node.catalog
        .add_index("orders.items", "ix_sku", false, false, sku_index())?;
    node.wait_for_first_entries("ix_sku", "orders.items").await;
    let progress = node.manager.progress_snapshot().await?;
    assert!(progress.secondaries[&ix_sku].needs_populating);

    // Orders are spread over every partition, so these land both behind and
    // ahead of the population cursor.
    for order in 0..NUM_ORDERS {
        let updated = format!(r#"{{"sku": "sku-upd-{order}"}}"#);
        node.write(&item_key(order, 0), Some(updated.as_bytes()))
            .await?;
        if order % 2 == 1 {
            node.write(&item_key(order, 1), None).await?;
        }
        let added = format!(r#"{{"sku": "sku-add-{order}"}}"#);
        node.write(&item_key(order, 7), Some(added.as_bytes()))
            .await?;
        tokio::task::yield_now().await;
    }
    node.settle().await;
    assert!(
        node.manager
            .is_index_population_complete("ix_sku", "orders.items")
            .await?
    );

    let routing = node.manager.routing();
    let derived = node
        .env
        .all_records()
        .into_iter()
        .filter(|(key, _)| routing.lookup(key).contains(&ix_sku))
        .map(|(key, value)| -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
            let value: serde_json::Value = serde_json::from_slice(&value)?;
            let sku = value["sku"].as_str().context("item without a sku")?;
            Ok((sku.as_bytes().to_vec(), key))
        })
        .collect::<anyhow::Result<Entries>>()?;
    assert_eq!(derived.len(), NUM_ORDERS * ITEMS_PER_ORDER + NUM_ORDERS / 2);
    assert_eq!(node.index_entries("ix_sku", "orders.items"), derived);
    node.assert_no_shutdown();
    Ok(())
}

#[maintenance_macro::test_runtime]
async fn test_blocked_task_hands_over_to_pending_work(rt: TestRuntime) -> anyhow::Result<()> {
    let (mut node, _fixture) = populated_node(rt).await?;
    let audit = TableId(12);
    let key_shape = node.catalog.current_snapshot().key_shape(audit)?;
    // An index this node has no handle for still needs populating, and the
    // audit records are due for deletion.
    let mut tx = node.env.begin(ConsistencyPolicy::Majority).await?;
    let mut record = ProgressStore::load(&mut *tx).await?;
    record.secondaries.insert(
        IndexDbName::new("ix_elsewhere", "orders"),
        SecondaryIndexStatus::new_populating(),
    );
    record
        .deleted_tables
        .insert(audit, DeletedTableStatus::new(audit, key_shape)?);
    ProgressStore::save(&mut *tx, &record).await?;
    tx.commit().await?;

    assert!(node.manager.force_start(TaskKind::Populate));
    node.settle().await;

    assert_eq!(node.env.all_records().len(), NUM_ORDERS * (1 + ITEMS_PER_ORDER));
    let progress = node.manager.progress_snapshot().await?;
    assert!(progress.deleted_tables[&audit].done);
    assert_eq!(node.manager.active_task(), None);
    node.assert_no_shutdown();
    Ok(())
}

#[maintenance_macro::prod_rt_test]
async fn test_populate_on_multi_threaded_runtime(rt: ProdRuntime) -> anyhow::Result<()> {
    let fixture = orders_fixture()?;
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
    let manager = IndexManager::start(
        rt.clone(),
        Arc::new(fixture.env.clone()),
        Arc::new(fixture.catalog.clone()),
        test_config(),
        ShutdownSignal::new(shutdown_tx, "prod-node".to_owned()),
    );
    fixture
        .catalog
        .add_index("orders.items", "ix_sku", false, false, sku_index())?;

    let deadline = rt.monotonic_now() + Duration::from_secs(30);
    while !manager
        .is_index_population_complete("ix_sku", "orders.items")
        .await?
    {
        anyhow::ensure!(rt.monotonic_now() < deadline, "Population did not finish");
        rt.wait(Duration::from_millis(10)).await;
    }
    let entries: Entries = fixture
        .env
        .entries(&DatabaseName::Secondary(IndexDbName::new("ix_sku", "orders.items")))
        .into_iter()
        .filter_map(|(entry, _)| {
            decode_entry(&entry).map(|(secondary, primary)| (secondary.to_vec(), primary.to_vec()))
        })
        .collect();
    assert_eq!(entries, fixture.skus);
    manager.shutdown().await?;
    assert!(shutdown_rx.try_recv().is_err());
    Ok(())
}
