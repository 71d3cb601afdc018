use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::trace;

use super::marker::ReverseMarker;
use super::row::{DataItem, SlotState};
use super::store::{Mutation, Precondition, RowStore, RowUpdate, StoreError, StoreResult};
use crate::types::{SortKey, Uid};

/// Counters kept by [`MemoryStore`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStoreStats {
    /// `fetch_rows` calls.
    pub reads: u64,
    /// Successful `update_row` and `put_row` calls.
    pub writes: u64,
    /// `update_row` calls rejected by a precondition, bound or fault.
    pub rejected: u64,
}

struct Fault {
    uid: Option<Uid>,
    prefix: String,
    error: StoreError,
    remaining: usize,
}

/// In-process [`RowStore`] backed by ordered maps.
///
/// Optionally enforces a per-row list bound (reported as
/// [`StoreError::ItemTooLarge`]) and supports injecting errors into
/// `update_row` for exercising recovery paths.
#[derive(Default)]
pub struct MemoryStore {
    rows: RwLock<FxHashMap<Uid, BTreeMap<SortKey, DataItem>>>,
    max_list_len: Option<usize>,
    faults: Mutex<Vec<Fault>>,
    reads: AtomicU64,
    writes: AtomicU64,
    rejected: AtomicU64,
}

impl MemoryStore {
    /// Empty store with no item bound.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects any append that would make a row's slot or value list longer than `len`.
    pub fn with_max_list_len(mut self, len: usize) -> Self {
        self.max_list_len = Some(len);
        self
    }

    /// Makes the next `times` updates to `uid` (any node when `None`) whose
    /// sort key starts with `prefix` fail with `error`.
    pub fn inject_fault(&self, uid: Option<Uid>, prefix: &str, error: StoreError, times: usize) {
        self.faults.lock().push(Fault {
            uid,
            prefix: prefix.to_string(),
            error,
            remaining: times,
        });
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> MemoryStoreStats {
        MemoryStoreStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Direct read of one row, bypassing counters.
    pub fn row(&self, uid: Uid, sortk: &SortKey) -> Option<DataItem> {
        self.rows.read().get(&uid)?.get(sortk).cloned()
    }

    fn take_fault(&self, uid: Uid, sortk: &SortKey) -> Option<StoreError> {
        let mut faults = self.faults.lock();
        let pos = faults.iter().position(|fault| {
            fault.remaining > 0
                && fault.uid.map_or(true, |target| target == uid)
                && sortk.has_prefix(&fault.prefix)
        })?;
        let fault = &mut faults[pos];
        fault.remaining -= 1;
        let error = fault.error.clone();
        if fault.remaining == 0 {
            faults.remove(pos);
        }
        Some(error)
    }

    fn reject<T>(&self, err: StoreError) -> StoreResult<T> {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        Err(err)
    }
}

fn check(existing: Option<&DataItem>, precondition: &Precondition) -> StoreResult<()> {
    match precondition {
        Precondition::None => Ok(()),
        Precondition::Exists => existing.map(|_| ()).ok_or(StoreError::NotFound),
        Precondition::MarkerAbsent(key) => match existing {
            Some(item) if item.markers.contains_key(key) => Err(StoreError::ConditionFailed),
            _ => Ok(()),
        },
        Precondition::MarkerQualified(key) => match existing.and_then(|item| item.markers.get(key)) {
            Some(marker) if ReverseMarker::is_qualified_bytes(marker) => Ok(()),
            _ => Err(StoreError::ConditionFailed),
        },
        Precondition::SlotsBelow(limit) => {
            let item = existing.ok_or(StoreError::NotFound)?;
            if item.slots.len() < *limit {
                Ok(())
            } else {
                Err(StoreError::ConditionFailed)
            }
        }
    }
}

fn apply(item: &mut DataItem, mutation: Mutation) -> StoreResult<()> {
    match mutation {
        Mutation::AppendSlot { uid, state, batch } => {
            if state == SlotState::EdgeFiltered {
                return Err(StoreError::Backend("EdgeFiltered is query-only".into()));
            }
            item.slots.push(uid, state, batch);
        }
        Mutation::SetSlotState { index, state } => {
            if state == SlotState::EdgeFiltered {
                return Err(StoreError::Backend("EdgeFiltered is query-only".into()));
            }
            item.slots
                .set_state(index, state)
                .map_err(|err| StoreError::Backend(err.to_string()))?;
        }
        Mutation::AppendValue(value) => item.values.push(value),
        Mutation::MarkFull => item.full = true,
        Mutation::AddLive(delta) => {
            item.live = if delta >= 0 {
                item.live.saturating_add(delta as u64)
            } else {
                item.live.saturating_sub(delta.unsigned_abs())
            };
        }
        Mutation::InsertMarker { key, marker } | Mutation::QualifyMarker { key, marker } => {
            item.markers.insert(key, marker);
        }
        Mutation::RemoveMarker { key } => {
            item.markers.remove(&key);
        }
        Mutation::Many(inner) => {
            for step in inner {
                apply(item, step)?;
            }
        }
    }
    Ok(())
}

impl RowStore for MemoryStore {
    fn fetch_rows(&self, uid: Uid, prefix: &str) -> StoreResult<Vec<(SortKey, DataItem)>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let rows = self.rows.read();
        let Some(node) = rows.get(&uid) else {
            return Ok(Vec::new());
        };
        let start = SortKey::new(prefix);
        Ok(node
            .range((Bound::Included(start), Bound::Unbounded))
            .take_while(|(key, _)| key.has_prefix(prefix))
            .map(|(key, item)| (key.clone(), item.clone()))
            .collect())
    }

    fn update_row(
        &self,
        uid: Uid,
        sortk: &SortKey,
        mutation: Mutation,
        precondition: Precondition,
    ) -> StoreResult<RowUpdate> {
        if let Some(err) = self.take_fault(uid, sortk) {
            trace!(uid = %uid, sortk = %sortk, error = %err, "memory_store.fault");
            return self.reject(err);
        }
        let grows = mutation.grows_row();
        let mut rows = self.rows.write();
        let node = rows.entry(uid).or_default();
        let existing = node.get(sortk);
        if let Err(err) = check(existing, &precondition) {
            return self.reject(err);
        }
        let old = existing.cloned();
        let mut new = old.clone().unwrap_or_default();
        if let Err(err) = apply(&mut new, mutation) {
            return self.reject(err);
        }
        if let Some(limit) = self.max_list_len {
            if grows && (new.slots.len() > limit || new.values.len() > limit) {
                return self.reject(StoreError::ItemTooLarge);
            }
        }
        node.insert(sortk.clone(), new.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(RowUpdate { old, new })
    }

    fn put_row(&self, uid: Uid, sortk: &SortKey, item: DataItem) -> StoreResult<()> {
        if item.slots.xf().contains(&SlotState::EdgeFiltered) {
            return Err(StoreError::Backend("EdgeFiltered is query-only".into()));
        }
        self.rows
            .write()
            .entry(uid)
            .or_default()
            .insert(sortk.clone(), item);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
