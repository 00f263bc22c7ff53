#![forbid(unsafe_code)]
//! Identifiers, distinguished names and the crate-wide error type.

use std::fmt;

mod dn;

pub use dn::Dn;

/// Identifier assigned to every stored entry.
///
/// IDs are non-negative 63-bit values; the top bit is reserved so that encoded
/// ID sets can tag undefined values unambiguously. Values above
/// [`EntryId::MAX`] cannot be constructed.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct EntryId(pub(crate) u64);

impl EntryId {
    /// Largest ID that may be assigned to an entry.
    pub const MAX: EntryId = EntryId(i64::MAX as u64);

    /// Wraps `raw`, rejecting values with the reserved top bit set.
    pub fn new(raw: u64) -> Result<Self> {
        if raw > Self::MAX.0 {
            return Err(StoreError::Invalid("entry id exceeds 63 bits"));
        }
        Ok(EntryId(raw))
    }

    /// Returns the raw value.
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the big-endian storage form.
    pub const fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Decodes a big-endian storage form.
    pub fn from_be_slice(src: &[u8]) -> Result<Self> {
        let bytes: [u8; 8] = src
            .get(..8)
            .and_then(|head| head.try_into().ok())
            .ok_or(StoreError::Corruption("entry id shorter than 8 bytes"))?;
        let raw = u64::from_be_bytes(bytes);
        if raw > Self::MAX.0 {
            return Err(StoreError::Corruption("stored entry id exceeds 63 bits"));
        }
        Ok(EntryId(raw))
    }

    /// Returns the ID that follows this one.
    pub fn next(self) -> Option<EntryId> {
        if self >= Self::MAX {
            None
        } else {
            Some(EntryId(self.0 + 1))
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u64> for EntryId {
    type Error = StoreError;

    fn try_from(value: u64) -> Result<Self> {
        EntryId::new(value)
    }
}

impl From<EntryId> for u64 {
    fn from(value: EntryId) -> Self {
        value.0
    }
}

/// Errors surfaced by the backend core.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// The storage/transaction collaborator failed.
    #[error("storage: {0}")]
    Storage(String),
    /// Persisted bytes could not be decoded.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// A caller supplied an argument the operation cannot accept.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A distinguished name could not be parsed.
    #[error("invalid DN: {0}")]
    InvalidDn(String),
    /// The entry to add already exists.
    #[error("entry already exists: {0}")]
    EntryAlreadyExists(String),
    /// The target entry (or its parent) does not exist.
    #[error("no such entry: {0}")]
    NoSuchEntry(String),
    /// A leaf-only operation was attempted on an entry with children.
    #[error("operation not allowed on non-leaf entry: {0}")]
    NotAllowedOnNonLeaf(String),
    /// A DN lock could not be acquired before the configured timeout.
    #[error("entry busy, lock not acquired: {0}")]
    Busy(String),
    /// Configuration could not be loaded or failed validation.
    #[error("configuration: {0}")]
    Config(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
