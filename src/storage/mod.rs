//! Row model and the key-value store interface.
//!
//! Everything above this module talks to storage only through the
//! [`RowStore`] trait: prefix fetches, single-row conditional updates and
//! row puts.

/// Compact reverse-edge marker codec.
pub mod marker;

/// In-process store used by tests and the CLI.
pub mod memory;

/// Sort-key layouts.
pub mod sortkey;

mod row;
mod store;

pub use marker::ReverseMarker;
pub use memory::{MemoryStore, MemoryStoreStats};
pub use row::{DataItem, ScalarValue, Slot, SlotCounts, SlotState, Slots};
pub use store::{Mutation, Precondition, RowStore, RowUpdate, StoreError, StoreResult};
