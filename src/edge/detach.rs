use tracing::{debug, warn};

use super::{resolve, EdgeContext, ResolvedEdge};
use crate::storage::marker::edge_key;
use crate::storage::{sortkey, Mutation, Precondition, ReverseMarker, SlotState, StoreError};
use crate::types::{GraphError, Result, Uid};

/// Detaches `child` from `parent` under `predicate`.
///
/// The slot is soft-deleted: its state becomes `UidDetached` and the
/// propagated scalars stay in place. If the slot cannot be updated once the
/// marker is gone, the marker is put back so the edge still reads as
/// attached.
pub(crate) fn detach(ctx: &EdgeContext<'_>, child: Uid, parent: Uid, predicate: &str) -> Result<()> {
    let edge = resolve(ctx, parent, predicate)?;
    let key = edge_key(parent, &edge.attr.short);

    let removed = ctx.store.update_row(
        child,
        &sortkey::reverse_row(),
        Mutation::RemoveMarker { key: key.clone() },
        Precondition::MarkerQualified(key.clone()),
    );
    let update = match removed {
        Ok(update) => update,
        Err(StoreError::ConditionFailed) => {
            ctx.metrics.gatekeeper_rejected();
            return Err(GraphError::EdgeNotAttached {
                child,
                parent,
                predicate: edge.attr.name.clone(),
            });
        }
        Err(err) => return Err(err.into()),
    };
    ctx.cache.invalidate_prefix(child, sortkey::REVERSE_ROW);

    let raw = update
        .old
        .and_then(|mut row| row.markers.remove(&key))
        .ok_or(GraphError::Invalid("removed marker missing from old image"))?;
    let outcome = ReverseMarker::decode(&raw)
        .and_then(|marker| soft_delete(ctx, &edge, child, parent, &marker));
    if let Err(err) = outcome {
        restore_marker(ctx, child, key, raw);
        return Err(err);
    }
    Ok(())
}

/// Marks the child's latest attached slot in the marker's target row
/// `UidDetached`.
fn soft_delete(
    ctx: &EdgeContext<'_>,
    edge: &ResolvedEdge<'_>,
    child: Uid,
    parent: Uid,
    marker: &ReverseMarker,
) -> Result<()> {
    let sortk = if marker.target == parent {
        edge.adj.clone()
    } else {
        sortkey::overflow_batch(&edge.adj, marker.batch)
    };

    let mut handle = ctx.cache.lock_for_write(marker.target, sortk.as_str())?;
    let index = handle
        .get(&sortk)
        .and_then(|row| row.slots.rposition(child, SlotState::ChildUid))
        .ok_or(GraphError::SlotNotFound {
            target: marker.target,
            child,
        })?;
    handle.apply(
        &sortk,
        Mutation::Many(vec![
            Mutation::SetSlotState {
                index,
                state: SlotState::UidDetached,
            },
            Mutation::AddLive(-1),
        ]),
        Precondition::None,
    )?;
    ctx.metrics.detach_completed();
    debug!(
        child = %child,
        parent = %parent,
        target = %marker.target,
        batch = marker.batch,
        slot = index,
        "edge.detach.done"
    );
    Ok(())
}

/// Reinserts a removed marker. Fails quietly if an attach raced in and
/// already holds the key.
fn restore_marker(ctx: &EdgeContext<'_>, child: Uid, key: Vec<u8>, raw: Vec<u8>) {
    let restored = ctx.store.update_row(
        child,
        &sortkey::reverse_row(),
        Mutation::InsertMarker {
            key: key.clone(),
            marker: raw,
        },
        Precondition::MarkerAbsent(key),
    );
    ctx.cache.invalidate_prefix(child, sortkey::REVERSE_ROW);
    match restored {
        Ok(_) => debug!(child = %child, "edge.detach.marker_restored"),
        Err(err) => warn!(child = %child, error = %err, "edge.detach.restore_failed"),
    }
}
