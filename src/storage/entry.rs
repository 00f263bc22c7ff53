use std::collections::BTreeMap;

use crate::primitives::bytes::var;
use crate::types::{Dn, EntryId, Result, StoreError};

use super::index::vlv::{key::normalize_value, SortOrder, SortValues};

/// A directory entry as stored in `id2entry`: its DN plus attribute values
/// keyed by lower-cased attribute type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryRecord {
    dn: Dn,
    attributes: BTreeMap<String, Vec<String>>,
}

/// One change applied by [`super::EntryContainer::modify_entry`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Modification {
    /// Adds a value, ignoring duplicates.
    Add(String, String),
    /// Removes one value, or the whole attribute when `None`.
    Delete(String, Option<String>),
    /// Replaces every value of the attribute.
    Replace(String, Vec<String>),
}

impl EntryRecord {
    /// An entry with no attributes.
    pub fn new(dn: Dn) -> Self {
        Self {
            dn,
            attributes: BTreeMap::new(),
        }
    }

    /// Builder form of [`EntryRecord::add_value`].
    pub fn with(mut self, attribute: &str, value: &str) -> Self {
        self.add_value(attribute, value);
        self
    }

    /// The entry DN.
    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    /// Values of `attribute`, empty when absent.
    pub fn values(&self, attribute: &str) -> &[String] {
        self.attributes
            .get(&attribute.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every attribute with its values.
    pub fn attributes(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.attributes
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    /// Adds a value unless an equal (after normalization) one is present.
    pub fn add_value(&mut self, attribute: &str, value: &str) -> bool {
        let values = self.attributes.entry(attribute.to_lowercase()).or_default();
        let normalized = normalize_value(value);
        if values.iter().any(|v| normalize_value(v) == normalized) {
            return false;
        }
        values.push(value.to_string());
        true
    }

    /// Applies one modification.
    pub fn apply(&mut self, modification: &Modification) {
        match modification {
            Modification::Add(attribute, value) => {
                self.add_value(attribute, value);
            }
            Modification::Delete(attribute, None) => {
                self.attributes.remove(&attribute.to_lowercase());
            }
            Modification::Delete(attribute, Some(value)) => {
                let name = attribute.to_lowercase();
                if let Some(values) = self.attributes.get_mut(&name) {
                    let normalized = normalize_value(value);
                    values.retain(|v| normalize_value(v) != normalized);
                    if values.is_empty() {
                        self.attributes.remove(&name);
                    }
                }
            }
            Modification::Replace(attribute, values) => {
                let name = attribute.to_lowercase();
                self.attributes.remove(&name);
                for value in values {
                    self.add_value(&name, value);
                }
            }
        }
    }

    /// Sort values for `order`: per key, the smallest normalized value for an
    /// ascending key and the largest for a descending one.
    pub fn sort_values(&self, id: EntryId, order: &SortOrder) -> SortValues {
        let values = order
            .keys()
            .iter()
            .map(|key| {
                let candidates = self.values(&key.attribute).iter().map(|v| normalize_value(v));
                if key.ascending {
                    candidates.min()
                } else {
                    candidates.max()
                }
            })
            .collect();
        SortValues::new(id, values)
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        put_str(&mut out, &self.dn.to_string());
        var::encode_u64(self.attributes.len() as u64, &mut out);
        for (name, values) in &self.attributes {
            put_str(&mut out, name);
            var::encode_u64(values.len() as u64, &mut out);
            for value in values {
                put_str(&mut out, value);
            }
        }
        out
    }

    pub(crate) fn decode(src: &[u8]) -> Result<Self> {
        let mut off = 0;
        let dn = Dn::parse(&get_str(src, &mut off)?)
            .map_err(|_| StoreError::Corruption("stored entry has an invalid dn"))?;
        let mut attributes = BTreeMap::new();
        for _ in 0..var::decode_u64(src, &mut off)? {
            let name = get_str(src, &mut off)?;
            let count = var::decode_u64(src, &mut off)?;
            let mut values = Vec::new();
            for _ in 0..count {
                values.push(get_str(src, &mut off)?);
            }
            attributes.insert(name, values);
        }
        if off != src.len() {
            return Err(StoreError::Corruption("trailing bytes after stored entry"));
        }
        Ok(Self { dn, attributes })
    }
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    var::encode_u64(s.len() as u64, out);
    out.extend_from_slice(s.as_bytes());
}

fn get_str(src: &[u8], off: &mut usize) -> Result<String> {
    let len = usize::try_from(var::decode_u64(src, off)?)
        .map_err(|_| StoreError::Corruption("string length overflows"))?;
    let end = off
        .checked_add(len)
        .filter(|end| *end <= src.len())
        .ok_or(StoreError::Corruption("stored string truncated"))?;
    let s = std::str::from_utf8(&src[*off..end])
        .map_err(|_| StoreError::Corruption("stored string is not utf-8"))?;
    *off = end;
    Ok(s.to_string())
}
