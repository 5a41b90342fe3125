//! Maps a primary key to the secondary indexes of the table the key belongs
//! to. Consulted on every primary write, so lookups walk the key's
//! components in place and never allocate.

use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    sync::Arc,
};

use arc_swap::ArcSwap;
use common::{
    catalog::{
        CatalogSnapshot,
        TableMetadata,
    },
    key::KeyComponents,
    types::IndexDbName,
};

static NO_INDEXES: BTreeSet<IndexDbName> = BTreeSet::new();

/// One table in the routing tree. Only tables that have secondary indexes,
/// or descendants that do, get a node.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RoutingNode {
    pub own_key_component_count: usize,
    pub secondary_index_names: BTreeSet<IndexDbName>,
    /// Keyed by the child table's id as it appears in keys.
    pub children: BTreeMap<Box<[u8]>, RoutingNode>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RoutingIndex {
    catalog_version: u64,
    roots: BTreeMap<Box<[u8]>, RoutingNode>,
}

impl RoutingIndex {
    /// Build the routing tree for a catalog snapshot. Tables being deleted
    /// route to no index.
    pub fn rebuild(catalog: &CatalogSnapshot) -> Self {
        let roots = catalog
            .top_level_tables()
            .filter_map(|table| {
                Self::build_node(catalog, table)
                    .map(|node| (table.id.key_component().into_boxed_slice(), node))
            })
            .collect();
        Self {
            catalog_version: catalog.version,
            roots,
        }
    }

    fn build_node(catalog: &CatalogSnapshot, table: &TableMetadata) -> Option<RoutingNode> {
        let secondary_index_names: BTreeSet<_> = if table.is_deleting() {
            BTreeSet::new()
        } else {
            table
                .indexes
                .iter()
                .map(|index| table.index_db_name(index))
                .collect()
        };
        let children: BTreeMap<_, _> = table
            .children
            .iter()
            .filter_map(|child_id| {
                let child = catalog.table(*child_id)?;
                let node = Self::build_node(catalog, child)?;
                Some((child_id.key_component().into_boxed_slice(), node))
            })
            .collect();
        if secondary_index_names.is_empty() && children.is_empty() {
            return None;
        }
        Some(RoutingNode {
            own_key_component_count: table.own_key_components,
            secondary_index_names,
            children,
        })
    }

    /// The indexes of the table `primary_key` belongs to. Empty when the key
    /// belongs to a table without indexes, names no known table, or is too
    /// short or malformed. Table id components must be spelled canonically,
    /// matching `CatalogSnapshot::find_target_table`.
    pub fn lookup(&self, primary_key: &[u8]) -> &BTreeSet<IndexDbName> {
        let mut components = KeyComponents::new(primary_key);
        let Some(root_id) = components.next() else {
            return &NO_INDEXES;
        };
        let Some(mut node) = self.roots.get(root_id) else {
            return &NO_INDEXES;
        };
        loop {
            if !components.skip_components(node.own_key_component_count) {
                return &NO_INDEXES;
            }
            let Some(child_id) = components.next() else {
                if components.is_malformed() {
                    return &NO_INDEXES;
                }
                return &node.secondary_index_names;
            };
            match node.children.get(child_id) {
                Some(child) => node = child,
                None => return &NO_INDEXES,
            }
        }
    }

    pub fn catalog_version(&self) -> u64 {
        self.catalog_version
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// The published routing index. Readers load a snapshot without locking;
/// the catalog listener swaps in a rebuilt index after each catalog update.
pub struct RoutingTable {
    current: ArcSwap<RoutingIndex>,
}

impl RoutingTable {
    pub fn new(index: RoutingIndex) -> Self {
        Self {
            current: ArcSwap::from_pointee(index),
        }
    }

    pub fn load(&self) -> Arc<RoutingIndex> {
        self.current.load_full()
    }

    pub fn publish(&self, index: RoutingIndex) {
        tracing::debug!(
            "Publishing routing index for catalog version {}",
            index.catalog_version()
        );
        self.current.store(Arc::new(index));
    }
}
