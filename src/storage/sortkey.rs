//! Composite sort-key layouts.
//!
//! | Row | Partition key | Sort key |
//! |---|---|---|
//! | type | node | `A#T` |
//! | scalar attribute | node | `{partition}#:{short}` |
//! | adjacency | node | `{partition}#G#:{short}` |
//! | overflow batch | overflow UID | `{adjacency}%{batch}` |
//! | propagated list | target row's UID | `{target sort key}#:{short}` |
//! | reverse edges | node | `R#` |

use crate::types::SortKey;

/// Sort key of the row holding a node's type name.
pub const TYPE_ROW: &str = "A#T";

/// Sort key of the row holding a node's reverse-edge markers.
pub const REVERSE_ROW: &str = "R#";

/// Type row key.
pub fn type_row() -> SortKey {
    SortKey::new(TYPE_ROW)
}

/// Reverse-edge row key.
pub fn reverse_row() -> SortKey {
    SortKey::new(REVERSE_ROW)
}

/// Scalar attribute row key.
pub fn scalar(partition: &str, short: &str) -> SortKey {
    SortKey::new(format!("{partition}#:{short}"))
}

/// Adjacency row key for a uid-predicate.
pub fn adjacency(partition: &str, short: &str) -> SortKey {
    SortKey::new(format!("{partition}#G#:{short}"))
}

/// Prefix covering every batch row of an overflow row.
pub fn overflow_prefix(adjacency: &SortKey) -> String {
    format!("{adjacency}%")
}

/// Batch-suffixed key of an overflow row.
pub fn overflow_batch(adjacency: &SortKey, batch: u32) -> SortKey {
    SortKey::new(format!("{adjacency}%{batch}"))
}

/// Key of the propagated scalar list for `short` on `target`.
pub fn propagated(target: &SortKey, short: &str) -> SortKey {
    SortKey::new(format!("{target}#:{short}"))
}

/// Batch number of an overflow batch key, if `key` is one.
pub fn batch_of(key: &SortKey) -> Option<u32> {
    let (_, suffix) = key.as_str().rsplit_once('%')?;
    suffix.parse().ok()
}
