//! Edge attach/detach protocol and the adjacency read path.
//!
//! Every attach and detach passes the gatekeeper first: a conditional write
//! of the edge's reverse marker on the child. That write is the only thing
//! that makes a duplicate attach, or a detach of a missing edge, a no-op.

mod attach;
mod detach;
mod propagate;
mod read;

pub use read::{AdjacencyView, EdgeView};

pub(crate) use attach::attach;
pub(crate) use detach::detach;
pub(crate) use read::children;

use tracing::trace;

use crate::cache::NodeCache;
use crate::catalog::{AttrDef, TypeCatalog, TypeDef};
use crate::config::GraphConfig;
use crate::metrics::EdgeMetrics;
use crate::storage::{sortkey, Mutation, Precondition, RowStore};
use crate::types::{GraphError, Result, SortKey, Uid};

/// Collaborators shared by the edge operations.
#[derive(Clone, Copy)]
pub(crate) struct EdgeContext<'a> {
    pub store: &'a dyn RowStore,
    pub cache: &'a NodeCache,
    pub catalog: &'a TypeCatalog,
    pub config: &'a GraphConfig,
    pub metrics: &'a dyn EdgeMetrics,
}

/// A uid-predicate resolved against the catalog.
pub(crate) struct ResolvedEdge<'c> {
    pub attr: &'c AttrDef,
    pub child_type: &'c TypeDef,
    pub adj: SortKey,
}

/// Reads the type name of `uid` under a short shared lock.
pub(crate) fn node_type(ctx: &EdgeContext<'_>, uid: Uid) -> Result<String> {
    let handle = ctx.cache.lock_for_read(uid, sortkey::TYPE_ROW)?;
    handle
        .get(&sortkey::type_row())
        .and_then(|row| row.type_name.clone())
        .ok_or(GraphError::NoTypeDefined(uid))
}

/// Resolves `predicate` on the type of `parent`.
pub(crate) fn resolve<'c>(
    ctx: &EdgeContext<'c>,
    parent: Uid,
    predicate: &str,
) -> Result<ResolvedEdge<'c>> {
    let ty = node_type(ctx, parent)?;
    let attr = ctx.catalog.uid_predicate(&ty, predicate)?;
    let target = attr
        .target
        .as_deref()
        .ok_or(GraphError::Invalid("uid-predicate without target type"))?;
    let child_type = ctx.catalog.get(target)?;
    Ok(ResolvedEdge {
        attr,
        child_type,
        adj: attr.sort_key(),
    })
}

/// Drops the marker stored under `key` on `child`, whatever its state.
pub(crate) fn remove_marker(ctx: &EdgeContext<'_>, child: Uid, key: &[u8]) -> Result<()> {
    ctx.store.update_row(
        child,
        &sortkey::reverse_row(),
        Mutation::RemoveMarker { key: key.to_vec() },
        Precondition::None,
    )?;
    ctx.cache.invalidate_prefix(child, sortkey::REVERSE_ROW);
    trace!(child = %child, "edge.marker.removed");
    Ok(())
}
