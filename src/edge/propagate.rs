//! Copies a child's propagated scalars into the row that holds its slot.

use tracing::{trace, warn};

use super::EdgeContext;
use crate::catalog::TypeDef;
use crate::storage::{sortkey, DataItem, Mutation, Precondition, RowStore, ScalarValue, StoreError};
use crate::types::{GraphError, Result, SortKey, Uid};

/// One propagated scalar of the child, `None` when the child has no value.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PropagatedValue {
    pub short: String,
    pub value: Option<ScalarValue>,
}

/// Row images written by one propagation pass, in attribute order. `error`
/// is set when the pass stopped early.
#[derive(Debug, Default)]
pub(crate) struct Propagation {
    pub images: Vec<(SortKey, DataItem)>,
    pub error: Option<GraphError>,
}

/// Reads the child's type and propagated scalars under a shared lock.
///
/// The child must carry the type the predicate targets.
pub(crate) fn snapshot(
    ctx: &EdgeContext<'_>,
    child: Uid,
    expected: &TypeDef,
) -> Result<Vec<PropagatedValue>> {
    let keys: Vec<(String, SortKey)> = expected
        .propagated()
        .map(|attr| (attr.short.clone(), attr.sort_key()))
        .collect();
    let prefix = keys
        .iter()
        .fold(sortkey::TYPE_ROW.to_string(), |acc, (_, key)| {
            common_prefix(&acc, key.as_str()).to_string()
        });

    let handle = ctx.cache.lock_for_read(child, &prefix)?;
    let ty = handle
        .get(&sortkey::type_row())
        .and_then(|row| row.type_name.as_deref())
        .ok_or(GraphError::NoTypeDefined(child))?;
    if ty != expected.name {
        return Err(GraphError::Invalid("child type does not match predicate target"));
    }
    Ok(keys
        .into_iter()
        .map(|(short, key)| PropagatedValue {
            value: handle.get(&key).and_then(|row| row.scalar.clone()),
            short,
        })
        .collect())
}

fn common_prefix<'a>(a: &'a str, b: &str) -> &'a str {
    let len = a
        .char_indices()
        .zip(b.chars())
        .take_while(|((_, x), y)| x == y)
        .last()
        .map_or(0, |((idx, ch), _)| idx + ch.len_utf8());
    &a[..len]
}

/// Appends each value to its list on `target` under the row key `sortk`.
pub(crate) fn propagate(
    store: &dyn RowStore,
    target: Uid,
    sortk: &SortKey,
    values: &[PropagatedValue],
) -> Propagation {
    let mut out = Propagation::default();
    for item in values {
        let key = sortkey::propagated(sortk, &item.short);
        match append(store, target, &key, item.value.clone()) {
            Ok(image) => out.images.push((key, image)),
            Err(err) => {
                trace!(target = %target, sortk = %key, error = %err, "edge.propagate.stopped");
                out.error = Some(err);
                break;
            }
        }
    }
    out
}

/// Appends to one list. A missing list row is created and the append is
/// retried exactly once.
fn append(
    store: &dyn RowStore,
    target: Uid,
    key: &SortKey,
    value: Option<ScalarValue>,
) -> Result<DataItem> {
    let mutation = Mutation::AppendValue(value);
    match store.update_row(target, key, mutation.clone(), Precondition::Exists) {
        Ok(update) => Ok(update.new),
        Err(StoreError::NotFound) => {
            store.put_row(target, key, DataItem::default())?;
            Ok(store
                .update_row(target, key, mutation, Precondition::Exists)?
                .new)
        }
        Err(err) => Err(err.into()),
    }
}

/// Appends null markers to the lists a stopped pass did not reach, so
/// that later slots stay index-aligned.
pub(crate) fn pad(
    store: &dyn RowStore,
    target: Uid,
    sortk: &SortKey,
    values: &[PropagatedValue],
    reached: usize,
) -> Vec<(SortKey, DataItem)> {
    let mut images = Vec::new();
    for item in values.iter().skip(reached) {
        let key = sortkey::propagated(sortk, &item.short);
        match append(store, target, &key, None) {
            Ok(image) => images.push((key, image)),
            Err(err) => {
                warn!(target = %target, sortk = %key, error = %err, "edge.propagate.pad_failed");
            }
        }
    }
    images
}
