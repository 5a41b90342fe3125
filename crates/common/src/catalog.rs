//! The metadata catalog contract: the source of truth for which tables and
//! secondary indexes exist on this node.

use std::{
    collections::BTreeMap,
    fmt,
    sync::Arc,
};

use tokio::sync::watch;

use crate::{
    key::{
        parse_table_id,
        KeyComponents,
        KeyShape,
        KeyShapeSegment,
    },
    types::{
        IndexDbName,
        TableId,
    },
};

/// The per-index function deriving secondary keys from a primary record.
/// Single-key indexes return at most one key.
pub trait SecondaryKeyExtractor: Send + Sync + fmt::Debug {
    fn extract(&self, primary_key: &[u8], value: Option<&[u8]>) -> anyhow::Result<Vec<Vec<u8>>>;
}

#[derive(Clone, Debug)]
pub struct IndexMetadata {
    pub name: String,
    /// One primary record may produce several secondary entries.
    pub multi_key: bool,
    /// Entries are derived from the primary key alone.
    pub key_only: bool,
    pub extractor: Arc<dyn SecondaryKeyExtractor>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableStatus {
    Active,
    /// Dropped; its remaining records are being deleted.
    Deleting,
}

#[derive(Clone, Debug)]
pub struct TableMetadata {
    pub id: TableId,
    /// Dotted path from the top-level table, eg `orders.items`.
    pub full_name: String,
    pub parent: Option<TableId>,
    /// Primary key components this table adds to its parent's.
    pub own_key_components: usize,
    pub children: Vec<TableId>,
    pub indexes: Vec<IndexMetadata>,
    pub status: TableStatus,
}

impl TableMetadata {
    pub fn index_db_name(&self, index: &IndexMetadata) -> IndexDbName {
        IndexDbName::new(&index.name, &self.full_name)
    }

    pub fn is_deleting(&self) -> bool {
        self.status == TableStatus::Deleting
    }
}

/// An immutable, versioned view of the catalog.
#[derive(Clone, Debug, Default)]
pub struct CatalogSnapshot {
    pub version: u64,
    pub tables: BTreeMap<TableId, TableMetadata>,
}

impl CatalogSnapshot {
    pub fn table(&self, id: TableId) -> Option<&TableMetadata> {
        self.tables.get(&id)
    }

    pub fn table_by_name(&self, full_name: &str) -> Option<&TableMetadata> {
        self.tables.values().find(|t| t.full_name == full_name)
    }

    pub fn top_level_tables(&self) -> impl Iterator<Item = &TableMetadata> {
        self.tables.values().filter(|t| t.parent.is_none())
    }

    pub fn top_level_ancestor(&self, id: TableId) -> anyhow::Result<&TableMetadata> {
        let mut table = self.require_table(id)?;
        while let Some(parent) = table.parent {
            table = self.require_table(parent)?;
        }
        Ok(table)
    }

    /// The key shape of `id`'s records, from its top-level ancestor down.
    pub fn key_shape(&self, id: TableId) -> anyhow::Result<KeyShape> {
        let mut segments = vec![];
        let mut next = Some(id);
        while let Some(table_id) = next {
            let table = self.require_table(table_id)?;
            anyhow::ensure!(
                segments.len() <= self.tables.len(),
                "Cycle in table hierarchy at {}",
                table.full_name
            );
            segments.push(KeyShapeSegment {
                table_id,
                own_key_components: table.own_key_components,
            });
            next = table.parent;
        }
        segments.reverse();
        Ok(KeyShape(segments))
    }

    /// The table whose records have keys shaped like `key`, if any.
    pub fn find_target_table(&self, key: &[u8]) -> Option<&TableMetadata> {
        let mut components = KeyComponents::new(key);
        let root_id = parse_table_id(components.next()?)?;
        let mut table = self.table(root_id).filter(|t| t.parent.is_none())?;
        loop {
            if !components.skip_components(table.own_key_components) {
                return None;
            }
            let Some(child_component) = components.next() else {
                return (!components.is_malformed()).then_some(table);
            };
            let child_id = parse_table_id(child_component)?;
            if !table.children.contains(&child_id) {
                return None;
            }
            table = self.table(child_id)?;
        }
    }

    fn require_table(&self, id: TableId) -> anyhow::Result<&TableMetadata> {
        self.table(id)
            .ok_or_else(|| anyhow::anyhow!("Table {id} is not in catalog version {}", self.version))
    }
}

/// Read side of the metadata catalog. Updates are delivered as whole new
/// snapshots through a watch channel, so a slow subscriber only ever sees the
/// latest version.
pub trait MetadataCatalog: Send + Sync + 'static {
    fn current_snapshot(&self) -> Arc<CatalogSnapshot>;

    fn subscribe(&self) -> watch::Receiver<Arc<CatalogSnapshot>>;
}
