//! Attach: `Requested -> Gatekept -> Reserved -> Propagating -> ReverseEdged -> Available`.
//!
//! Two tasks cooperate per attach. The child task snapshots the child's
//! propagated scalars under a shared lock and hands them over before the
//! parent task takes the parent's exclusive lock, so no task ever waits for
//! a shared lock while holding an exclusive one. The parent task then
//! reserves a slot and hands each reservation back to the child task, which
//! writes the scalar copies and returns the row images.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use tracing::{debug, warn};

use super::propagate::{self, PropagatedValue, Propagation};
use super::{remove_marker, resolve, EdgeContext, ResolvedEdge};
use crate::cache::CacheHandle;
use crate::catalog::TypeDef;
use crate::overflow::{self, Allocator, Reservation};
use crate::primitives::promise::{self, Pending, Resolver};
use crate::storage::marker::edge_key;
use crate::storage::{sortkey, Mutation, Precondition, ReverseMarker, SlotState, StoreError};
use crate::types::{GraphError, SortKey, Uid};

/// A reservation handed to the child task for propagation.
struct Work {
    target: Uid,
    sortk: SortKey,
    reply: Resolver<Propagation>,
}

/// Attaches `child` to `parent` under `predicate`.
///
/// Returns every error observed; an empty list means the edge is available.
/// At most one error comes from each of the two tasks.
pub(crate) fn attach(
    ctx: &EdgeContext<'_>,
    child: Uid,
    parent: Uid,
    predicate: &str,
) -> Vec<GraphError> {
    let edge = match resolve(ctx, parent, predicate) {
        Ok(edge) => edge,
        Err(err) => return vec![err],
    };
    let key = edge_key(parent, &edge.attr.short);
    if let Err(err) = gatekeep(ctx, child, parent, &edge, &key) {
        return vec![err];
    }
    ctx.metrics.attach_started();

    let (scalars_tx, scalars_rx) = promise::pair();
    let (work_tx, work_rx) = mpsc::channel();
    let child_type = edge.child_type;
    thread::scope(|scope| {
        let child_task = scope.spawn(move || run_child(ctx, child, child_type, scalars_tx, work_rx));
        let mut errors = run_parent(ctx, &edge, child, parent, &key, scalars_rx, work_tx);
        match child_task.join() {
            Ok(Some(err)) if !errors.contains(&err) => errors.insert(0, err),
            Ok(_) => {}
            Err(_) => errors.push(GraphError::Cancelled),
        }
        errors
    })
}

/// Inserts the provisional marker; an existing marker means the edge is
/// attached or being attached.
fn gatekeep(
    ctx: &EdgeContext<'_>,
    child: Uid,
    parent: Uid,
    edge: &ResolvedEdge<'_>,
    key: &[u8],
) -> Result<(), GraphError> {
    let marker = ReverseMarker::provisional(parent, &edge.attr.short);
    let outcome = ctx.store.update_row(
        child,
        &sortkey::reverse_row(),
        Mutation::InsertMarker {
            key: key.to_vec(),
            marker: marker.encode(),
        },
        Precondition::MarkerAbsent(key.to_vec()),
    );
    match outcome {
        Ok(_) => {
            ctx.cache.invalidate_prefix(child, sortkey::REVERSE_ROW);
            debug!(child = %child, parent = %parent, predicate = %edge.attr.name, "edge.attach.gatekept");
            Ok(())
        }
        Err(StoreError::ConditionFailed) => {
            ctx.metrics.gatekeeper_rejected();
            debug!(child = %child, parent = %parent, predicate = %edge.attr.name, "edge.attach.duplicate");
            Err(GraphError::EdgeAlreadyExists {
                child,
                parent,
                predicate: edge.attr.name.clone(),
            })
        }
        Err(err) => Err(err.into()),
    }
}

fn run_child(
    ctx: &EdgeContext<'_>,
    child: Uid,
    child_type: &TypeDef,
    scalars: Resolver<Vec<PropagatedValue>>,
    work: Receiver<Work>,
) -> Option<GraphError> {
    let values = match propagate::snapshot(ctx, child, child_type) {
        Ok(values) => values,
        Err(err) => return Some(err),
    };
    scalars.resolve(values.clone());
    for Work {
        target,
        sortk,
        reply,
    } in work
    {
        reply.resolve(propagate::propagate(ctx.store, target, &sortk, &values));
    }
    None
}

fn run_parent(
    ctx: &EdgeContext<'_>,
    edge: &ResolvedEdge<'_>,
    child: Uid,
    parent: Uid,
    key: &[u8],
    scalars: Pending<Vec<PropagatedValue>>,
    work: Sender<Work>,
) -> Vec<GraphError> {
    let handoff = match ctx.config.lock_timeout() {
        Some(timeout) => scalars
            .wait_timeout(timeout)
            .unwrap_or(Err(GraphError::LockTimeout(child))),
        None => scalars.wait(),
    };
    let values = match handoff {
        Ok(values) => values,
        Err(GraphError::Cancelled) => {
            // the child task reports its own error
            withdraw(ctx, child, key);
            return Vec::new();
        }
        Err(err) => {
            withdraw(ctx, child, key);
            return vec![err];
        }
    };
    let mut handle = match ctx.cache.lock_for_write(parent, edge.adj.as_str()) {
        Ok(handle) => handle,
        Err(err) => {
            withdraw(ctx, child, key);
            return vec![err];
        }
    };
    let allocator = Allocator::new(ctx.cache, ctx.store, ctx.config, ctx.metrics);

    for attempt in 0..=ctx.config.max_overflow {
        let mut reservation = match allocator.reserve(&mut handle, &edge.adj, child) {
            Ok(reservation) => reservation,
            Err(err) => {
                withdraw(ctx, child, key);
                return vec![err];
            }
        };
        let (reply, pending) = promise::pair();
        let sent = work.send(Work {
            target: reservation.target,
            sortk: reservation.sortk.clone(),
            reply,
        });
        let propagation = match sent.map_err(|_| GraphError::Cancelled).and_then(|()| pending.wait()) {
            Ok(propagation) => propagation,
            Err(err) => {
                abort(ctx, &mut handle, &edge.adj, &mut reservation, child, key);
                return vec![err];
            }
        };
        let reached = propagation.images.len();
        for (sortk, image) in propagation.images {
            if let Err(err) = target_of(&mut handle, &mut reservation).install(sortk, image) {
                warn!(error = %err, "edge.attach.install_failed");
            }
        }

        match propagation.error {
            None => return settle(ctx, edge, &mut handle, reservation, child, parent, key),
            Some(GraphError::ItemSizeExceeded) if !reservation.is_embedded() => {
                warn!(
                    child = %child,
                    parent = %parent,
                    overflow = %reservation.target,
                    batch = reservation.batch,
                    attempt,
                    "edge.attach.retry"
                );
                ctx.metrics.retry("attach");
                if let Err(err) = recover(&mut handle, &edge.adj, &mut reservation) {
                    abort(ctx, &mut handle, &edge.adj, &mut reservation, child, key);
                    return vec![err];
                }
            }
            Some(err) => {
                let padded = propagate::pad(ctx.store, reservation.target, &reservation.sortk, &values, reached);
                for (sortk, image) in padded {
                    if let Err(err) = target_of(&mut handle, &mut reservation).install(sortk, image) {
                        warn!(error = %err, "edge.attach.install_failed");
                    }
                }
                abort(ctx, &mut handle, &edge.adj, &mut reservation, child, key);
                return vec![err];
            }
        }
    }
    warn!(child = %child, parent = %parent, "edge.attach.exhausted");
    withdraw(ctx, child, key);
    vec![GraphError::ItemSizeExceeded]
}

/// Handle on the row holding the reserved slot.
fn target_of<'h>(parent: &'h mut CacheHandle, reservation: &'h mut Reservation) -> &'h mut CacheHandle {
    match reservation.overflow.as_mut() {
        Some(overflow) => overflow,
        None => parent,
    }
}

/// The reserved batch filled up under propagation: retire it and orphan
/// the slot so the next reservation lands elsewhere.
fn recover(
    parent: &mut CacheHandle,
    adj: &SortKey,
    reservation: &mut Reservation,
) -> Result<(), GraphError> {
    let (Some(pointer), Some(overflow)) = (reservation.pointer, reservation.overflow.as_mut()) else {
        return Err(GraphError::Invalid("recovery needs an overflow reservation"));
    };
    overflow::mark_full(parent, adj, pointer, overflow, &reservation.sortk)?;
    overflow.apply(
        &reservation.sortk,
        Mutation::SetSlotState {
            index: reservation.slot,
            state: SlotState::UidDetached,
        },
        Precondition::None,
    )?;
    Ok(())
}

/// Steps 4 and 5: qualify the marker, then make the slot visible.
fn settle(
    ctx: &EdgeContext<'_>,
    edge: &ResolvedEdge<'_>,
    parent_handle: &mut CacheHandle,
    mut reservation: Reservation,
    child: Uid,
    parent: Uid,
    key: &[u8],
) -> Vec<GraphError> {
    let marker = ReverseMarker::qualified(parent, &edge.attr.short, reservation.target, reservation.batch);
    let qualified = ctx.store.update_row(
        child,
        &sortkey::reverse_row(),
        Mutation::QualifyMarker {
            key: key.to_vec(),
            marker: marker.encode(),
        },
        Precondition::Exists,
    );
    if let Err(err) = qualified {
        abort(ctx, parent_handle, &edge.adj, &mut reservation, child, key);
        return vec![err.into()];
    }
    ctx.cache.invalidate_prefix(child, sortkey::REVERSE_ROW);

    let slot = reservation.slot;
    let sortk = reservation.sortk.clone();
    let available = target_of(parent_handle, &mut reservation).apply(
        &sortk,
        Mutation::Many(vec![
            Mutation::SetSlotState {
                index: slot,
                state: SlotState::ChildUid,
            },
            Mutation::AddLive(1),
        ]),
        Precondition::None,
    );
    if let Err(err) = available {
        warn!(child = %child, parent = %parent, error = %err, "edge.attach.unsettled");
        abort(ctx, parent_handle, &edge.adj, &mut reservation, child, key);
        return vec![err];
    }
    if let Some(pointer) = reservation.pointer {
        if let Err(err) = overflow::release_pointer(parent_handle, &edge.adj, pointer) {
            return vec![err];
        }
    }
    ctx.metrics.attach_completed();
    debug!(
        child = %child,
        parent = %parent,
        target = %reservation.target,
        batch = reservation.batch,
        slot,
        "edge.attach.available"
    );
    Vec::new()
}

/// Reverts a reservation: orphan the slot, free the pointer, drop the marker.
fn abort(
    ctx: &EdgeContext<'_>,
    parent: &mut CacheHandle,
    adj: &SortKey,
    reservation: &mut Reservation,
    child: Uid,
    key: &[u8],
) {
    let slot = reservation.slot;
    let sortk = reservation.sortk.clone();
    let detached = target_of(parent, reservation).apply(
        &sortk,
        Mutation::SetSlotState {
            index: slot,
            state: SlotState::UidDetached,
        },
        Precondition::None,
    );
    if let Err(err) = detached {
        warn!(target = %reservation.target, slot, error = %err, "edge.attach.abort.slot");
    }
    if let Some(pointer) = reservation.pointer {
        if let Err(err) = overflow::release_pointer(parent, adj, pointer) {
            warn!(pointer, error = %err, "edge.attach.abort.pointer");
        }
    }
    withdraw(ctx, child, key);
}

fn withdraw(ctx: &EdgeContext<'_>, child: Uid, key: &[u8]) {
    match remove_marker(ctx, child, key) {
        Ok(()) => debug!(child = %child, "edge.attach.aborted"),
        Err(err) => warn!(child = %child, error = %err, "edge.attach.abort.marker"),
    }
}
