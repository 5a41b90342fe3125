use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{
    catalog::{
        CatalogSnapshot,
        IndexMetadata,
        MetadataCatalog,
        SecondaryKeyExtractor,
        TableMetadata,
        TableStatus,
    },
    types::TableId,
};

/// In-memory catalog. Every mutation publishes a new snapshot with a bumped
/// version to subscribers.
#[derive(Clone)]
pub struct TestCatalog {
    snapshot_tx: Arc<watch::Sender<Arc<CatalogSnapshot>>>,
    next_table_id: Arc<Mutex<u64>>,
}

impl Default for TestCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl TestCatalog {
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(CatalogSnapshot::default()));
        Self {
            snapshot_tx: Arc::new(snapshot_tx),
            next_table_id: Arc::new(Mutex::new(10)),
        }
    }

    fn update<R>(
        &self,
        f: impl FnOnce(&mut CatalogSnapshot) -> anyhow::Result<R>,
    ) -> anyhow::Result<R> {
        let mut snapshot = (**self.snapshot_tx.borrow()).clone();
        let result = f(&mut snapshot)?;
        snapshot.version += 1;
        self.snapshot_tx.send_replace(Arc::new(snapshot));
        Ok(result)
    }

    fn table_id(snapshot: &CatalogSnapshot, full_name: &str) -> anyhow::Result<TableId> {
        snapshot
            .table_by_name(full_name)
            .map(|t| t.id)
            .ok_or_else(|| anyhow::anyhow!("No table named {full_name}"))
    }

    /// Add a table. A dotted name (`orders.items`) makes it a child of the
    /// table named by everything before the last dot.
    pub fn add_table(&self, full_name: &str, own_key_components: usize) -> anyhow::Result<TableId> {
        let id = {
            let mut next = self.next_table_id.lock();
            let id = TableId(*next);
            *next += 1;
            id
        };
        self.update(|snapshot| {
            anyhow::ensure!(
                snapshot.table_by_name(full_name).is_none(),
                "Table {full_name} already exists"
            );
            let parent = match full_name.rsplit_once('.') {
                Some((parent_name, _)) => {
                    let parent_id = Self::table_id(snapshot, parent_name)?;
                    let parent = snapshot
                        .tables
                        .get_mut(&parent_id)
                        .ok_or_else(|| anyhow::anyhow!("Parent {parent_name} vanished"))?;
                    parent.children.push(id);
                    Some(parent_id)
                },
                None => {
                    anyhow::ensure!(
                        own_key_components > 0,
                        "Top-level tables need at least one key component"
                    );
                    None
                },
            };
            snapshot.tables.insert(
                id,
                TableMetadata {
                    id,
                    full_name: full_name.to_owned(),
                    parent,
                    own_key_components,
                    children: vec![],
                    indexes: vec![],
                    status: TableStatus::Active,
                },
            );
            Ok(id)
        })
    }

    pub fn add_index(
        &self,
        table: &str,
        index_name: &str,
        multi_key: bool,
        key_only: bool,
        extractor: Arc<dyn SecondaryKeyExtractor>,
    ) -> anyhow::Result<()> {
        self.update(|snapshot| {
            let id = Self::table_id(snapshot, table)?;
            let table = snapshot
                .tables
                .get_mut(&id)
                .ok_or_else(|| anyhow::anyhow!("Table {id} vanished"))?;
            anyhow::ensure!(
                table.indexes.iter().all(|i| i.name != index_name),
                "Index {index_name} already exists"
            );
            table.indexes.push(IndexMetadata {
                name: index_name.to_owned(),
                multi_key,
                key_only,
                extractor,
            });
            Ok(())
        })
    }

    pub fn drop_index(&self, table: &str, index_name: &str) -> anyhow::Result<()> {
        self.update(|snapshot| {
            let id = Self::table_id(snapshot, table)?;
            let table = snapshot
                .tables
                .get_mut(&id)
                .ok_or_else(|| anyhow::anyhow!("Table {id} vanished"))?;
            let before = table.indexes.len();
            table.indexes.retain(|i| i.name != index_name);
            anyhow::ensure!(table.indexes.len() < before, "No index named {index_name}");
            Ok(())
        })
    }

    /// Drop a table: it stays in the catalog as `Deleting` until its records
    /// are gone.
    pub fn mark_deleting(&self, table: &str) -> anyhow::Result<()> {
        self.update(|snapshot| {
            let id = Self::table_id(snapshot, table)?;
            let table = snapshot
                .tables
                .get_mut(&id)
                .ok_or_else(|| anyhow::anyhow!("Table {id} vanished"))?;
            table.status = TableStatus::Deleting;
            table.indexes.clear();
            Ok(())
        })
    }

    /// Remove a table outright, as orchestration does once its deletion is
    /// complete.
    pub fn remove_table(&self, table: &str) -> anyhow::Result<()> {
        self.update(|snapshot| {
            let id = Self::table_id(snapshot, table)?;
            let Some(removed) = snapshot.tables.remove(&id) else {
                anyhow::bail!("Table {id} vanished");
            };
            if let Some(parent) = removed.parent.and_then(|p| snapshot.tables.get_mut(&p)) {
                parent.children.retain(|c| *c != id);
            }
            Ok(())
        })
    }
}

impl MetadataCatalog for TestCatalog {
    fn current_snapshot(&self) -> Arc<CatalogSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Arc<CatalogSnapshot>> {
        self.snapshot_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::TestCatalog;
    use crate::{
        catalog::MetadataCatalog,
        key::{
            KeyShape,
            KeyShapeSegment,
        },
        testing::JsonFieldExtractor,
    };

    #[test]
    fn test_catalog_hierarchy() -> anyhow::Result<()> {
        let catalog = TestCatalog::new();
        let mut rx = catalog.subscribe();
        let orders = catalog.add_table("orders", 1)?;
        let items = catalog.add_table("orders.items", 1)?;
        catalog.add_index(
            "orders.items",
            "ix_sku",
            false,
            false,
            Arc::new(JsonFieldExtractor::new("sku")),
        )?;
        assert!(rx.has_changed()?);
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.version, 3);
        assert_eq!(snapshot.table(orders).unwrap().children, vec![items]);
        assert_eq!(snapshot.top_level_ancestor(items)?.id, orders);
        assert_eq!(
            snapshot.key_shape(items)?,
            KeyShape(vec![
                KeyShapeSegment {
                    table_id: orders,
                    own_key_components: 1
                },
                KeyShapeSegment {
                    table_id: items,
                    own_key_components: 1
                },
            ])
        );
        let key = snapshot.key_shape(items)?.primary_key(&["7", "3"])?;
        assert_eq!(snapshot.find_target_table(&key).map(|t| t.id), Some(items));
        let key = snapshot.key_shape(orders)?.primary_key(&["7"])?;
        assert_eq!(snapshot.find_target_table(&key).map(|t| t.id), Some(orders));

        catalog.remove_table("orders.items")?;
        let snapshot = catalog.current_snapshot();
        assert!(snapshot.table(orders).unwrap().children.is_empty());
        assert!(catalog.add_table("missing.child", 1).is_err());
        Ok(())
    }
}
