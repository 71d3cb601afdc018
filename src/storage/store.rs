use thiserror::Error;

use super::row::{DataItem, ScalarValue, SlotState};
use crate::types::{GraphError, SortKey, Uid};

/// Errors reported by a [`RowStore`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The precondition did not hold.
    #[error("condition failed")]
    ConditionFailed,
    /// The mutation would grow the row past the store's item bound.
    #[error("item too large")]
    ItemTooLarge,
    /// The row does not exist and the precondition required it.
    #[error("row not found")]
    NotFound,
    /// Any other backend failure.
    #[error("backend: {0}")]
    Backend(String),
}

/// Result alias for store calls.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for GraphError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConditionFailed => GraphError::ConditionFailed,
            StoreError::ItemTooLarge => GraphError::ItemSizeExceeded,
            StoreError::NotFound => GraphError::Storage("row not found".into()),
            StoreError::Backend(msg) => GraphError::Storage(msg),
        }
    }
}

/// Single-row mutation applied atomically by [`RowStore::update_row`].
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    /// Appends one `(Nd, XF, Id)` triple.
    AppendSlot {
        /// Child or overflow UID.
        uid: Uid,
        /// Initial state.
        state: SlotState,
        /// Batch number.
        batch: u32,
    },
    /// Overwrites the state of one slot.
    SetSlotState {
        /// Slot index.
        index: usize,
        /// New state.
        state: SlotState,
    },
    /// Appends to the propagated scalar list.
    AppendValue(Option<ScalarValue>),
    /// Flags an overflow batch as exhausted.
    MarkFull,
    /// Adjusts the live child counter, saturating at zero.
    AddLive(i64),
    /// Adds a reverse-edge marker.
    InsertMarker {
        /// Edge key.
        key: Vec<u8>,
        /// Encoded marker.
        marker: Vec<u8>,
    },
    /// Replaces an existing reverse-edge marker.
    QualifyMarker {
        /// Edge key.
        key: Vec<u8>,
        /// Encoded marker.
        marker: Vec<u8>,
    },
    /// Removes a reverse-edge marker.
    RemoveMarker {
        /// Edge key.
        key: Vec<u8>,
    },
    /// Applies several mutations as one.
    Many(Vec<Mutation>),
}

impl Mutation {
    /// Whether applying this mutation lengthens a list on the row.
    pub fn grows_row(&self) -> bool {
        match self {
            Mutation::AppendSlot { .. } | Mutation::AppendValue(_) => true,
            Mutation::Many(inner) => inner.iter().any(Mutation::grows_row),
            _ => false,
        }
    }
}

/// Condition checked atomically before a mutation is applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Precondition {
    /// Always apply; a missing row is created empty.
    None,
    /// The row must exist.
    Exists,
    /// No marker may be stored under the key.
    MarkerAbsent(Vec<u8>),
    /// A qualified marker must be stored under the key.
    MarkerQualified(Vec<u8>),
    /// The row must exist and hold fewer than this many slots.
    SlotsBelow(usize),
}

/// Row images around a successful update.
#[derive(Clone, Debug, PartialEq)]
pub struct RowUpdate {
    /// Row before the mutation; `None` when it was created by it.
    pub old: Option<DataItem>,
    /// Row after the mutation.
    pub new: DataItem,
}

/// Partitioned key-value store consumed by the cache and edge protocols.
///
/// Rows are addressed by node UID and sort key. Implementations must make
/// each `update_row` call atomic with respect to its precondition.
pub trait RowStore: Send + Sync {
    /// All rows of `uid` whose sort key starts with `prefix`, in key order.
    fn fetch_rows(&self, uid: Uid, prefix: &str) -> StoreResult<Vec<(SortKey, DataItem)>>;

    /// Conditionally applies `mutation` to one row.
    fn update_row(
        &self,
        uid: Uid,
        sortk: &SortKey,
        mutation: Mutation,
        precondition: Precondition,
    ) -> StoreResult<RowUpdate>;

    /// Creates or replaces one row.
    fn put_row(&self, uid: Uid, sortk: &SortKey, item: DataItem) -> StoreResult<()>;
}
