use std::fmt;
use std::sync::Arc;

use super::{Result, StoreError};

/// A normalized distinguished name.
///
/// RDNs are stored root-most first, so `uid=a,ou=people,dc=example` is held as
/// `["dc=example", "ou=people", "uid=a"]`. Attribute types and values are
/// lower-cased and trimmed; escaped separators (`\,`) are kept verbatim.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Dn {
    rdns: Arc<[Box<str>]>,
}

impl Dn {
    /// The root DN, with no RDNs.
    pub fn root() -> Self {
        Self {
            rdns: Arc::from(Vec::new()),
        }
    }

    /// Parses and normalizes a string DN.
    pub fn parse(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(Self::root());
        }
        let mut rdns = Vec::new();
        for raw in split_unescaped(input) {
            rdns.push(normalize_rdn(raw, input)?);
        }
        rdns.reverse();
        Ok(Self { rdns: rdns.into() })
    }

    /// Number of RDNs.
    pub fn depth(&self) -> usize {
        self.rdns.len()
    }

    /// Whether this is the root DN.
    pub fn is_root(&self) -> bool {
        self.rdns.is_empty()
    }

    /// Leaf-most RDN, if any.
    pub fn rdn(&self) -> Option<&str> {
        self.rdns.last().map(|rdn| &**rdn)
    }

    /// The immediate superior, or `None` for the root DN.
    pub fn parent(&self) -> Option<Dn> {
        if self.rdns.is_empty() {
            return None;
        }
        Some(Self {
            rdns: self.rdns[..self.rdns.len() - 1].into(),
        })
    }

    /// Builds a child DN below this one.
    pub fn child(&self, rdn: &str) -> Result<Dn> {
        let normalized = normalize_rdn(rdn, rdn)?;
        let mut rdns: Vec<Box<str>> = self.rdns.to_vec();
        rdns.push(normalized);
        Ok(Self { rdns: rdns.into() })
    }

    /// Whether `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &Dn) -> bool {
        other.rdns.len() > self.rdns.len() && other.rdns.starts_with(&self.rdns)
    }

    /// Whether `self` is a strict descendant of `other`.
    pub fn is_descendant_of(&self, other: &Dn) -> bool {
        other.is_ancestor_of(self)
    }

    /// Whether `self` equals `other` or lies anywhere beneath it.
    pub fn is_in_subtree_of(&self, other: &Dn) -> bool {
        self.rdns.starts_with(&other.rdns)
    }

    /// Strict ancestors from the root-most down to the immediate parent.
    ///
    /// The root DN itself is not included.
    pub fn ancestors(&self) -> impl Iterator<Item = Dn> + '_ {
        (1..self.rdns.len()).map(move |len| Self {
            rdns: self.rdns[..len].into(),
        })
    }

    /// Order-preserving storage key: each RDN followed by a `0x00` terminator,
    /// root-most first, so descendant keys extend their ancestors' keys.
    pub fn to_key(&self) -> Vec<u8> {
        let len = self.rdns.iter().map(|rdn| rdn.len() + 1).sum();
        let mut out = Vec::with_capacity(len);
        for rdn in self.rdns.iter() {
            out.extend_from_slice(rdn.as_bytes());
            out.push(0);
        }
        out
    }
}

fn split_unescaped(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (idx, ch) in input.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            ',' => {
                parts.push(&input[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn normalize_rdn(raw: &str, whole: &str) -> Result<Box<str>> {
    let Some((attr, value)) = raw.split_once('=') else {
        return Err(StoreError::InvalidDn(whole.to_string()));
    };
    let attr = attr.trim();
    let value = value.trim();
    if attr.is_empty() || value.is_empty() || raw.contains('\0') {
        return Err(StoreError::InvalidDn(whole.to_string()));
    }
    let mut out = String::with_capacity(attr.len() + value.len() + 1);
    out.push_str(&attr.to_lowercase());
    out.push('=');
    out.push_str(&value.to_lowercase());
    Ok(out.into_boxed_str())
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, rdn) in self.rdns.iter().rev().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            f.write_str(rdn)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dn({self})")
    }
}

impl std::str::FromStr for Dn {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        Dn::parse(s)
    }
}
