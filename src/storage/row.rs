use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{GraphError, Result, Uid};

/// Per-slot state flag of an adjacency or overflow row.
///
/// The numeric order matters: everything up to [`SlotState::UidDetached`]
/// is an embedded child slot, [`SlotState::OvflBlockUid`] through
/// [`SlotState::OvflItemFull`] are overflow pointers.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum SlotState {
    /// Embedded child, attached.
    ChildUid = 1,
    /// Embedded child, reservation in flight.
    CuidInUse = 2,
    /// Soft-deleted child.
    UidDetached = 3,
    /// Pointer to an overflow row with free capacity.
    OvflBlockUid = 4,
    /// Pointer reservation in flight.
    OuidInUse = 5,
    /// Pointer whose current batch is exhausted.
    OvflItemFull = 6,
    /// Query-time exclusion; never persisted.
    EdgeFiltered = 7,
}

impl SlotState {
    /// Embedded child slot in any state.
    pub fn is_embedded(self) -> bool {
        self <= SlotState::UidDetached
    }

    /// Overflow pointer slot in any state.
    pub fn is_overflow(self) -> bool {
        (SlotState::OvflBlockUid..=SlotState::OvflItemFull).contains(&self)
    }

    /// Byte encoding.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for SlotState {
    type Error = GraphError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(SlotState::ChildUid),
            2 => Ok(SlotState::CuidInUse),
            3 => Ok(SlotState::UidDetached),
            4 => Ok(SlotState::OvflBlockUid),
            5 => Ok(SlotState::OuidInUse),
            6 => Ok(SlotState::OvflItemFull),
            7 => Ok(SlotState::EdgeFiltered),
            _ => Err(GraphError::Invalid("unknown slot state")),
        }
    }
}

/// Scalar attribute value. Physical encoding is left to the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Opaque bytes.
    Bytes(Vec<u8>),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Bool(v) => write!(f, "{v}"),
            ScalarValue::Int(v) => write!(f, "{v}"),
            ScalarValue::Float(v) => write!(f, "{v}"),
            ScalarValue::Str(v) => f.write_str(v),
            ScalarValue::Bytes(v) => f.write_str(&hex::encode(v)),
        }
    }
}

/// One `(Nd, XF, Id)` triple.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Slot {
    /// Child UID or overflow-row UID.
    pub uid: Uid,
    /// Slot state.
    pub state: SlotState,
    /// Current batch of an overflow pointer; zero otherwise.
    pub batch: u32,
}

/// The three parallel sequences of an adjacency row.
///
/// Fields are private so the sequences can only change together.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Slots {
    nd: Vec<Uid>,
    xf: Vec<SlotState>,
    id: Vec<u32>,
}

impl Slots {
    /// Number of slots.
    pub fn len(&self) -> usize {
        self.nd.len()
    }

    /// True when the row holds no slots.
    pub fn is_empty(&self) -> bool {
        self.nd.is_empty()
    }

    /// Appends a slot and returns its index.
    pub fn push(&mut self, uid: Uid, state: SlotState, batch: u32) -> usize {
        self.nd.push(uid);
        self.xf.push(state);
        self.id.push(batch);
        self.nd.len() - 1
    }

    /// Slot at `index`.
    pub fn get(&self, index: usize) -> Option<Slot> {
        Some(Slot {
            uid: *self.nd.get(index)?,
            state: *self.xf.get(index)?,
            batch: *self.id.get(index)?,
        })
    }

    /// Updates the state of slot `index`.
    pub fn set_state(&mut self, index: usize, state: SlotState) -> Result<()> {
        let slot = self
            .xf
            .get_mut(index)
            .ok_or(GraphError::Invalid("slot index out of range"))?;
        *slot = state;
        Ok(())
    }

    /// Updates the batch number of slot `index`.
    pub fn set_batch(&mut self, index: usize, batch: u32) -> Result<()> {
        let slot = self
            .id
            .get_mut(index)
            .ok_or(GraphError::Invalid("slot index out of range"))?;
        *slot = batch;
        Ok(())
    }

    /// Iterates slots in insertion order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = Slot> + ExactSizeIterator + '_ {
        self.nd
            .iter()
            .zip(self.xf.iter())
            .zip(self.id.iter())
            .map(|((uid, state), batch)| Slot {
                uid: *uid,
                state: *state,
                batch: *batch,
            })
    }

    /// Index of the most recently added slot holding `uid` in `state`.
    pub fn rposition(&self, uid: Uid, state: SlotState) -> Option<usize> {
        self.iter()
            .rposition(|slot| slot.uid == uid && slot.state == state)
    }

    /// Raw child/pointer UIDs.
    pub fn nd(&self) -> &[Uid] {
        &self.nd
    }

    /// Raw state flags.
    pub fn xf(&self) -> &[SlotState] {
        &self.xf
    }

    /// Raw batch numbers.
    pub fn id(&self) -> &[u32] {
        &self.id
    }
}

/// Unit of cached and mutated state: one row of a node's partition.
///
/// A row typically uses a single group of fields: the type row carries
/// `type_name`, scalar rows `scalar`, adjacency and overflow rows `slots`,
/// propagated rows `values`, the reverse-edge row `markers`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DataItem {
    /// Adjacency slots.
    pub slots: Slots,
    /// Propagated scalar list; `None` is the null marker.
    pub values: Vec<Option<ScalarValue>>,
    /// Scalar attribute value.
    pub scalar: Option<ScalarValue>,
    /// Node type name.
    pub type_name: Option<String>,
    /// Reverse-edge markers keyed by edge key.
    pub markers: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Number of attached child slots.
    pub live: u64,
    /// Overflow batch exhausted.
    pub full: bool,
}

impl DataItem {
    /// Type row.
    pub fn typed(name: impl Into<String>) -> Self {
        Self {
            type_name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Scalar attribute row.
    pub fn scalar(value: ScalarValue) -> Self {
        Self {
            scalar: Some(value),
            ..Self::default()
        }
    }

    /// Counts child slots and collects available overflow pointers.
    pub fn slot_counts(&self) -> SlotCounts {
        let mut counts = SlotCounts::default();
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.state.is_embedded() {
                counts.embedded += 1;
            } else if slot.state.is_overflow() {
                counts.overflow += 1;
                if slot.state == SlotState::OvflBlockUid {
                    counts.available.push(idx);
                }
            }
        }
        counts
    }
}

/// Slot census of an adjacency row.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SlotCounts {
    /// Slots in any embedded state.
    pub embedded: usize,
    /// Slots in any overflow-pointer state.
    pub overflow: usize,
    /// Indexes of pointers in state `OvflBlockUid`, oldest first.
    pub available: smallvec::SmallVec<[usize; 8]>,
}
