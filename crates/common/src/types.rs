use std::fmt;

use serde::{
    Deserialize,
    Serialize,
};

/// Numeric id of a table in the metadata catalog.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[serde(transparent)]
pub struct TableId(pub u64);

impl TableId {
    /// The key component identifying this table inside a key path.
    pub fn key_component(&self) -> Vec<u8> {
        self.0.to_string().into_bytes()
    }
}

/// A fixed shard of the primary key space.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, derive_more::Display,
)]
#[serde(transparent)]
pub struct PartitionId(pub u32);

/// Name of the database backing a secondary index, unique per node:
/// `<index name>.<table full name>`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexDbName(String);

impl IndexDbName {
    pub fn new(index_name: &str, table_name: &str) -> Self {
        Self(format!("{index_name}.{table_name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IndexDbName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for IndexDbName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Incremented every time the storage environment is recycled. Handles opened
/// under an older generation must be reopened.
pub type Generation = u64;
