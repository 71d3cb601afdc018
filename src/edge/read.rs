//! Adjacency read path.

use serde::Serialize;
use tracing::trace;

use super::{resolve, EdgeContext};
use crate::cache::CacheHandle;
use crate::storage::{sortkey, DataItem, ScalarValue, SlotState};
use crate::types::{Result, SortKey, Uid};

/// One live edge as seen by a reader.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EdgeView {
    /// Child endpoint.
    pub child: Uid,
    /// `ChildUid`, or `EdgeFiltered` once a filter excluded the edge.
    pub state: SlotState,
    /// Row holding the slot: the parent or an overflow row.
    pub row: Uid,
    /// Overflow batch; zero for embedded slots.
    pub batch: u32,
    /// Propagated scalars by attribute name, in catalog order.
    pub scalars: Vec<(String, Option<ScalarValue>)>,
}

impl EdgeView {
    /// Propagated value of `attr`.
    pub fn scalar(&self, attr: &str) -> Option<&ScalarValue> {
        self.scalars
            .iter()
            .find(|(name, _)| name == attr)
            .and_then(|(_, value)| value.as_ref())
    }
}

/// Live edges of one predicate, embedded slots first, then every batch of
/// every overflow row in pointer order.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AdjacencyView {
    parent: Uid,
    edges: Vec<EdgeView>,
}

impl AdjacencyView {
    /// Parent the edges hang off.
    pub fn parent(&self) -> Uid {
        self.parent
    }

    /// Every edge, filtered ones included.
    pub fn edges(&self) -> &[EdgeView] {
        &self.edges
    }

    /// Edges no filter has excluded.
    pub fn visible(&self) -> impl Iterator<Item = &EdgeView> + '_ {
        self.edges
            .iter()
            .filter(|edge| edge.state != SlotState::EdgeFiltered)
    }

    /// Children of the visible edges.
    pub fn children(&self) -> Vec<Uid> {
        self.visible().map(|edge| edge.child).collect()
    }

    /// Number of visible edges.
    pub fn len(&self) -> usize {
        self.visible().count()
    }

    /// True when no edge is visible.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks every visible edge for which `keep` returns false as
    /// `EdgeFiltered` and returns how many were excluded. Only the view
    /// changes; nothing is written back.
    pub fn filter(&mut self, mut keep: impl FnMut(&EdgeView) -> bool) -> usize {
        let mut excluded = 0;
        for edge in &mut self.edges {
            if edge.state != SlotState::EdgeFiltered && !keep(edge) {
                edge.state = SlotState::EdgeFiltered;
                excluded += 1;
            }
        }
        excluded
    }

    /// Propagated value of `attr` on the edge to `child`.
    pub fn scalar(&self, child: Uid, attr: &str) -> Option<&ScalarValue> {
        self.visible()
            .find(|edge| edge.child == child)
            .and_then(|edge| edge.scalar(attr))
    }
}

/// Collects the live edges of `predicate` on `parent`.
pub(crate) fn children(ctx: &EdgeContext<'_>, parent: Uid, predicate: &str) -> Result<AdjacencyView> {
    let edge = resolve(ctx, parent, predicate)?;
    let attrs: Vec<(&str, &str)> = edge
        .child_type
        .propagated()
        .map(|attr| (attr.name.as_str(), attr.short.as_str()))
        .collect();

    let mut view = AdjacencyView {
        parent,
        edges: Vec::new(),
    };
    let handle = ctx.cache.lock_for_read(parent, edge.adj.as_str())?;
    let Some(row) = handle.get(&edge.adj) else {
        return Ok(view);
    };
    collect(&mut view.edges, &handle, 0, &edge.adj, row, &attrs);

    let prefix = sortkey::overflow_prefix(&edge.adj);
    for pointer in row.slots.iter().filter(|slot| slot.state.is_overflow()) {
        let overflow = ctx.cache.lock_for_read(pointer.uid, &prefix)?;
        for (key, batch_row) in overflow.rows_with_prefix(&prefix) {
            if let Some(batch) = sortkey::batch_of(key) {
                collect(&mut view.edges, &overflow, batch, key, batch_row, &attrs);
            }
        }
    }
    trace!(parent = %parent, edges = view.edges.len(), "edge.children");
    Ok(view)
}

/// Appends the attached slots of `row`, stored under `key` in `holder`.
fn collect(
    out: &mut Vec<EdgeView>,
    holder: &CacheHandle,
    batch: u32,
    key: &SortKey,
    row: &DataItem,
    attrs: &[(&str, &str)],
) {
    let columns: Vec<Option<&DataItem>> = attrs
        .iter()
        .map(|(_, short)| holder.get(&sortkey::propagated(key, short)))
        .collect();
    for (index, slot) in row.slots.iter().enumerate() {
        if slot.state != SlotState::ChildUid {
            continue;
        }
        let scalars = attrs
            .iter()
            .zip(&columns)
            .map(|((name, _), column)| {
                let value = column.and_then(|list| list.values.get(index).cloned().flatten());
                (name.to_string(), value)
            })
            .collect();
        out.push(EdgeView {
            child: slot.uid,
            state: slot.state,
            row: holder.uid(),
            batch,
            scalars,
        });
    }
}
