//! Compact binary reverse-edge marker.
//!
//! Layout: `parent(16) | target(16) | batch(u32 BE) | flags(u8) | predicate`.
//! The marker is stored in the child's reverse-edge row under the edge key
//! `parent(16) | predicate`, so at most one marker exists per edge.

use crate::types::{GraphError, Result, Uid, UID_LEN};

const FLAG_QUALIFIED: u8 = 0b0000_0001;
const FLAGS_AT: usize = UID_LEN * 2 + 4;
const HEADER_LEN: usize = FLAGS_AT + 1;

/// Decoded reverse-edge marker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReverseMarker {
    /// Parent endpoint.
    pub parent: Uid,
    /// Row holding the forward slot: the parent or an overflow row.
    pub target: Uid,
    /// Overflow batch holding the slot; zero for embedded slots.
    pub batch: u32,
    /// Predicate short code.
    pub predicate: String,
    /// False while the attach that wrote it is still in flight.
    pub qualified: bool,
}

impl ReverseMarker {
    /// Marker written by the gatekeeper before the target is known.
    pub fn provisional(parent: Uid, predicate: &str) -> Self {
        Self {
            parent,
            target: parent,
            batch: 0,
            predicate: predicate.to_string(),
            qualified: false,
        }
    }

    /// Marker naming the row that holds the forward slot.
    pub fn qualified(parent: Uid, predicate: &str, target: Uid, batch: u32) -> Self {
        Self {
            parent,
            target,
            batch,
            predicate: predicate.to_string(),
            qualified: true,
        }
    }

    /// Binary encoding.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.predicate.len());
        out.extend_from_slice(self.parent.as_bytes());
        out.extend_from_slice(self.target.as_bytes());
        out.extend_from_slice(&self.batch.to_be_bytes());
        out.push(if self.qualified { FLAG_QUALIFIED } else { 0 });
        out.extend_from_slice(self.predicate.as_bytes());
        out
    }

    /// Decodes a marker produced by [`ReverseMarker::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(GraphError::Invalid("reverse marker truncated"));
        }
        let parent = Uid::from_slice(&bytes[..UID_LEN])?;
        let target = Uid::from_slice(&bytes[UID_LEN..UID_LEN * 2])?;
        let mut batch = [0u8; 4];
        batch.copy_from_slice(&bytes[UID_LEN * 2..FLAGS_AT]);
        let predicate = std::str::from_utf8(&bytes[HEADER_LEN..])
            .map_err(|_| GraphError::Invalid("reverse marker predicate is not utf-8"))?;
        Ok(Self {
            parent,
            target,
            batch: u32::from_be_bytes(batch),
            predicate: predicate.to_string(),
            qualified: bytes[FLAGS_AT] & FLAG_QUALIFIED != 0,
        })
    }

    /// Reads the qualified flag without a full decode.
    pub fn is_qualified_bytes(bytes: &[u8]) -> bool {
        bytes
            .get(FLAGS_AT)
            .map(|flags| flags & FLAG_QUALIFIED != 0)
            .unwrap_or(false)
    }
}

/// Key of the marker for edge `parent --predicate--> child`.
pub fn edge_key(parent: Uid, predicate: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(UID_LEN + predicate.len());
    key.extend_from_slice(parent.as_bytes());
    key.extend_from_slice(predicate.as_bytes());
    key
}
