use anyhow::Context;

use crate::{
    catalog::SecondaryKeyExtractor,
    key::KeyComponents,
};

/// Indexes a top-level field of a JSON record value. Arrays produce one
/// secondary key per element, which makes the index multi-key.
#[derive(Debug)]
pub struct JsonFieldExtractor {
    pub field: String,
}

impl JsonFieldExtractor {
    pub fn new(field: &str) -> Self {
        Self {
            field: field.to_owned(),
        }
    }
}

fn scalar_key(value: &serde_json::Value) -> Option<Vec<u8>> {
    match value {
        serde_json::Value::String(s) => Some(s.as_bytes().to_vec()),
        serde_json::Value::Number(n) => Some(n.to_string().into_bytes()),
        serde_json::Value::Bool(b) => Some(b.to_string().into_bytes()),
        _ => None,
    }
}

impl SecondaryKeyExtractor for JsonFieldExtractor {
    fn extract(&self, _primary_key: &[u8], value: Option<&[u8]>) -> anyhow::Result<Vec<Vec<u8>>> {
        let Some(value) = value else {
            return Ok(vec![]);
        };
        let record: serde_json::Value =
            serde_json::from_slice(value).context("Record value is not JSON")?;
        let keys = match record.get(&self.field) {
            None | Some(serde_json::Value::Null) => vec![],
            Some(serde_json::Value::Array(elements)) => {
                let mut keys: Vec<_> = elements.iter().filter_map(scalar_key).collect();
                keys.sort();
                keys.dedup();
                keys
            },
            Some(scalar) => scalar_key(scalar).into_iter().collect(),
        };
        Ok(keys)
    }
}

/// Indexes the `n`th component of the primary key; needs no record value.
#[derive(Debug)]
pub struct KeyComponentExtractor {
    pub component: usize,
}

impl SecondaryKeyExtractor for KeyComponentExtractor {
    fn extract(&self, primary_key: &[u8], _value: Option<&[u8]>) -> anyhow::Result<Vec<Vec<u8>>> {
        Ok(KeyComponents::new(primary_key)
            .nth(self.component)
            .map(|c| c.to_vec())
            .into_iter()
            .collect())
    }
}
