//! Identifiers and error types shared across the crate.

use std::fmt;

use rand::RngCore;
use serde::{Serialize, Serializer};

mod error;

pub use error::{GraphError, Result};

/// Length in bytes of a node identifier.
pub const UID_LEN: usize = 16;

/// Fixed-size binary node identifier; the partition key of every row a node owns.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Uid(pub [u8; UID_LEN]);

impl Uid {
    /// Mints a fresh random identifier.
    pub fn generate() -> Self {
        let mut bytes = [0u8; UID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Uid(bytes)
    }

    /// Builds an identifier from a byte slice of exactly [`UID_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; UID_LEN] = bytes
            .try_into()
            .map_err(|_| GraphError::Invalid("uid must be 16 bytes"))?;
        Ok(Uid(arr))
    }

    /// Parses the lowercase hex rendering produced by `Display`.
    pub fn parse_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text).map_err(|_| GraphError::Invalid("uid is not valid hex"))?;
        Self::from_slice(&bytes)
    }

    /// Raw bytes of the identifier.
    pub fn as_bytes(&self) -> &[u8; UID_LEN] {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", hex::encode(&self.0[..4]))
    }
}

impl Serialize for Uid {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl From<[u8; UID_LEN]> for Uid {
    fn from(value: [u8; UID_LEN]) -> Self {
        Uid(value)
    }
}

/// Composite sort key addressing one row inside a node's partition.
///
/// See [`crate::storage::sortkey`] for the layouts in use.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SortKey(String);

impl SortKey {
    /// Wraps an already-encoded sort key.
    pub fn new(raw: impl Into<String>) -> Self {
        SortKey(raw.into())
    }

    /// Encoded form of the key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true when this key falls under `prefix`.
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SortKey {
    fn from(value: &str) -> Self {
        SortKey(value.to_string())
    }
}
