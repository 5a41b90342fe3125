//! Key paths: primary keys are an ordered list of byte components, each
//! encoded as a `u16` big-endian length followed by its bytes. A parent
//! table's key is a byte prefix of its child tables' keys.
//!
//! Each table contributes a segment of `[table id] ++ own key components` to
//! the keys of its records, so a record of a grandchild table looks like
//! `[top id, top pk.., child id, child pk.., grandchild id, grandchild pk..]`.

use std::fmt;

use serde::{
    Deserialize,
    Serialize,
};

use crate::types::TableId;

const LEN_PREFIX: usize = 2;

/// Append one length-prefixed component to `out`.
pub fn push_component(out: &mut Vec<u8>, component: &[u8]) -> anyhow::Result<()> {
    let len = u16::try_from(component.len())
        .map_err(|_| anyhow::anyhow!("Key component of {} bytes is too long", component.len()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(component);
    Ok(())
}

#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyPath(Vec<u8>);

impl KeyPath {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_components<T: AsRef<[u8]>>(
        components: impl IntoIterator<Item = T>,
    ) -> anyhow::Result<Self> {
        let mut path = Self::new();
        for component in components {
            path.push(component.as_ref())?;
        }
        Ok(path)
    }

    pub fn push(&mut self, component: &[u8]) -> anyhow::Result<()> {
        push_component(&mut self.0, component)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn components(&self) -> KeyComponents<'_> {
        KeyComponents::new(&self.0)
    }
}

impl fmt::Debug for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.components().map(String::from_utf8_lossy))
            .finish()
    }
}

/// Borrowing iterator over the components of an encoded key. Never allocates.
/// A truncated encoding ends the iteration and sets `is_malformed`.
#[derive(Clone)]
pub struct KeyComponents<'a> {
    rest: &'a [u8],
    malformed: bool,
}

impl<'a> KeyComponents<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            rest: bytes,
            malformed: false,
        }
    }

    pub fn is_malformed(&self) -> bool {
        self.malformed
    }

    /// The undecoded tail of the key.
    pub fn remaining(&self) -> &'a [u8] {
        self.rest
    }

    /// Advance past `n` components, returning false if the key ran out first.
    pub fn skip_components(&mut self, n: usize) -> bool {
        for _ in 0..n {
            if self.next().is_none() {
                return false;
            }
        }
        true
    }
}

impl<'a> Iterator for KeyComponents<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.rest.is_empty() || self.malformed {
            return None;
        }
        if self.rest.len() < LEN_PREFIX {
            self.malformed = true;
            return None;
        }
        let len = u16::from_be_bytes([self.rest[0], self.rest[1]]) as usize;
        let body = &self.rest[LEN_PREFIX..];
        if body.len() < len {
            self.malformed = true;
            return None;
        }
        let (component, rest) = body.split_at(len);
        self.rest = rest;
        Some(component)
    }
}

/// Byte length of the first `n` components of `key`, or None if the key has
/// fewer than `n` well-formed components.
pub fn prefix_len(key: &[u8], n: usize) -> Option<usize> {
    let mut components = KeyComponents::new(key);
    if !components.skip_components(n) {
        return None;
    }
    Some(key.len() - components.remaining().len())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyShapeSegment {
    pub table_id: TableId,
    pub own_key_components: usize,
}

/// The path of `(table id, own key component count)` segments from a
/// top-level table down to one of its descendants. Describes exactly which
/// keys belong to the descendant's records.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyShape(pub Vec<KeyShapeSegment>);

impl KeyShape {
    pub fn top_level_table(&self) -> Option<TableId> {
        self.0.first().map(|segment| segment.table_id)
    }

    pub fn is_top_level(&self) -> bool {
        self.0.len() == 1
    }

    /// Encoded `[top-level table id]`, the prefix shared by every record of
    /// the table family.
    pub fn top_level_prefix(&self) -> anyhow::Result<Vec<u8>> {
        let top = self
            .top_level_table()
            .ok_or_else(|| anyhow::anyhow!("Empty key shape"))?;
        let mut prefix = vec![];
        push_component(&mut prefix, &top.key_component())?;
        Ok(prefix)
    }

    /// True iff `key` is the key of a record of the table this shape ends at.
    pub fn matches(&self, key: &[u8]) -> bool {
        let mut components = KeyComponents::new(key);
        for segment in &self.0 {
            let Some(id) = components.next() else {
                return false;
            };
            if !table_id_matches(id, segment.table_id) {
                return false;
            }
            if !components.skip_components(segment.own_key_components) {
                return false;
            }
        }
        components.remaining().is_empty()
    }

    /// Build the primary key of a record from its own key components, in
    /// segment order.
    pub fn primary_key<T: AsRef<[u8]>>(&self, components: &[T]) -> anyhow::Result<Vec<u8>> {
        let expected: usize = self.0.iter().map(|s| s.own_key_components).sum();
        anyhow::ensure!(
            components.len() == expected,
            "Expected {expected} key components, got {}",
            components.len()
        );
        let mut key = vec![];
        let mut rest = components;
        for segment in &self.0 {
            push_component(&mut key, &segment.table_id.key_component())?;
            let (own, tail) = rest.split_at(segment.own_key_components);
            for component in own {
                push_component(&mut key, component.as_ref())?;
            }
            rest = tail;
        }
        Ok(key)
    }
}

/// Compare a decimal id component against a table id without allocating.
pub fn table_id_matches(component: &[u8], table_id: TableId) -> bool {
    parse_table_id(component) == Some(table_id)
}

/// Table ids are written in canonical decimal: no sign and no leading zeros.
/// Any other spelling names no table.
pub fn parse_table_id(component: &[u8]) -> Option<TableId> {
    if component.is_empty() || component.len() > 20 {
        return None;
    }
    if component.len() > 1 && component[0] == b'0' {
        return None;
    }
    let mut value: u64 = 0;
    for b in component {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add((b - b'0') as u64)?;
    }
    Some(TableId(value))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn shape(segments: &[(u64, usize)]) -> KeyShape {
        KeyShape(
            segments
                .iter()
                .map(|(id, n)| KeyShapeSegment {
                    table_id: TableId(*id),
                    own_key_components: *n,
                })
                .collect(),
        )
    }

    #[test]
    fn test_truncated_key_is_malformed() -> anyhow::Result<()> {
        let key = KeyPath::from_components(["orders", "7"])?.into_bytes();
        let mut components = KeyComponents::new(&key[..key.len() - 1]);
        assert_eq!(components.next(), Some(&b"orders"[..]));
        assert_eq!(components.next(), None);
        assert!(components.is_malformed());

        let mut components = KeyComponents::new(&[0u8][..]);
        assert_eq!(components.next(), None);
        assert!(components.is_malformed());
        Ok(())
    }

    #[test]
    fn test_shape_matching() -> anyhow::Result<()> {
        let items = shape(&[(10, 1), (11, 1)]);
        let item_key = items.primary_key(&["7", "3"])?;
        assert!(items.matches(&item_key));

        let orders = shape(&[(10, 1)]);
        let order_key = orders.primary_key(&["7"])?;
        assert!(orders.matches(&order_key));
        assert!(!orders.matches(&item_key));
        assert!(!items.matches(&order_key));
        assert!(item_key.starts_with(&order_key));
        assert!(item_key.starts_with(&items.top_level_prefix()?));

        assert!(items.primary_key(&["7"]).is_err());
        Ok(())
    }

    #[test]
    fn test_parse_table_id() {
        assert_eq!(parse_table_id(b"42"), Some(TableId(42)));
        assert_eq!(parse_table_id(b""), None);
        assert_eq!(parse_table_id(b"4x"), None);
        assert_eq!(parse_table_id(b"99999999999999999999"), None);
        assert_eq!(parse_table_id(b"0"), Some(TableId(0)));
        assert_eq!(parse_table_id(b"010"), None);
        assert_eq!(parse_table_id(b"+10"), None);
        assert!(!table_id_matches(b"010", TableId(10)));
    }

    proptest! {
        #![proptest_config(
            ProptestConfig { failure_persistence: None, ..ProptestConfig::default() }
        )]

        #[test]
        fn test_components_decode_what_was_pushed(
            components in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..8), 0..6),
            extra in 0usize..3,
        ) {
            let path = KeyPath::from_components(&components).unwrap();
            let decoded: Vec<&[u8]> = path.components().collect();
            let expected: Vec<&[u8]> = components.iter().map(|c| c.as_slice()).collect();
            prop_assert_eq!(decoded, expected);
            prop_assert_eq!(prefix_len(path.as_bytes(), components.len()), Some(path.as_bytes().len()));
            prop_assert_eq!(prefix_len(path.as_bytes(), components.len() + extra + 1), None);
        }
    }
}
