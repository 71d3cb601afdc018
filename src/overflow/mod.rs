//! Overflow allocator: decides where a new child edge is physically stored.
//!
//! A parent's adjacency row embeds child slots until `embedded_threshold`
//! is reached. From then on children go to overflow rows, each keyed by its
//! own UID and addressed by an overflow pointer slot on the adjacency row.
//! An overflow row holds one writable batch at a time; when the batch is
//! full the pointer is flagged and, once every pointer is full and no more
//! rows may be created, the full rows are reopened under a new batch.

use tracing::{debug, warn};

use crate::cache::{CacheHandle, NodeCache};
use crate::config::GraphConfig;
use crate::metrics::EdgeMetrics;
use crate::storage::{sortkey, DataItem, Mutation, Precondition, RowStore, SlotState};
use crate::types::{GraphError, Result, SortKey, Uid};

/// A child slot reserved in state `CuidInUse`.
#[derive(Debug)]
pub struct Reservation {
    /// Row holding the slot: the parent or an overflow row.
    pub target: Uid,
    /// Batch of the overflow row; zero when embedded.
    pub batch: u32,
    /// Sort key of the row holding the slot.
    pub sortk: SortKey,
    /// Index of the child slot within that row.
    pub slot: usize,
    /// Index of the overflow pointer on the adjacency row.
    pub pointer: Option<usize>,
    /// Exclusive handle on the overflow row, held until the attach settles.
    pub overflow: Option<CacheHandle>,
}

impl Reservation {
    /// Whether the slot is embedded in the parent's adjacency row.
    pub fn is_embedded(&self) -> bool {
        self.pointer.is_none()
    }
}

/// Allocator bound to one cache and configuration.
pub struct Allocator<'a> {
    cache: &'a NodeCache,
    store: &'a dyn RowStore,
    config: &'a GraphConfig,
    metrics: &'a dyn EdgeMetrics,
}

impl<'a> Allocator<'a> {
    /// Creates an allocator.
    pub fn new(
        cache: &'a NodeCache,
        store: &'a dyn RowStore,
        config: &'a GraphConfig,
        metrics: &'a dyn EdgeMetrics,
    ) -> Self {
        Self {
            cache,
            store,
            config,
            metrics,
        }
    }

    /// Reserves a slot for `child` on the adjacency row `adj` of the node
    /// `parent` is an exclusive handle on.
    ///
    /// Each attempt re-reads the row's slot census. Lost conditional writes
    /// and exhausted batches mark the pointer full and try again, for at
    /// most `max_overflow + 1` attempts.
    pub fn reserve(
        &self,
        parent: &mut CacheHandle,
        adj: &SortKey,
        child: Uid,
    ) -> Result<Reservation> {
        let parent_uid = parent.uid();
        for attempt in 0..=self.config.max_overflow {
            let counts = parent
                .get(adj)
                .map(DataItem::slot_counts)
                .unwrap_or_default();

            if counts.embedded < self.config.embedded_threshold && counts.overflow == 0 {
                let slot = parent.update(adj, |row| {
                    Ok(row.slots.push(child, SlotState::CuidInUse, 0))
                })?;
                parent.persist(adj)?;
                debug!(parent = %parent_uid, child = %child, slot, "overflow.reserve.embedded");
                return Ok(Reservation {
                    target: parent_uid,
                    batch: 0,
                    sortk: adj.clone(),
                    slot,
                    pointer: None,
                    overflow: None,
                });
            }

            let mut available = counts.available;
            if available.len() <= self.config.grow_by_threshold
                && counts.overflow < self.config.max_overflow
            {
                available.push(self.grow(parent, adj)?);
            }

            if available.is_empty() && counts.overflow >= self.config.max_overflow {
                self.reopen(parent, adj)?;
                available = parent
                    .get(adj)
                    .map(|row| row.slot_counts().available)
                    .unwrap_or_default();
            }

            let Some(&pointer) = available.last() else {
                self.metrics.retry("reserve");
                continue;
            };

            match self.claim(parent, adj, pointer, child) {
                Ok(reservation) => return Ok(reservation),
                Err(err) if err.is_retryable() => {
                    warn!(
                        parent = %parent_uid,
                        pointer,
                        attempt,
                        error = %err,
                        "overflow.reserve.batch_full"
                    );
                    self.metrics.retry("reserve");
                }
                Err(err) => return Err(err),
            }
        }
        warn!(parent = %parent_uid, child = %child, "overflow.reserve.exhausted");
        Err(GraphError::ItemSizeExceeded)
    }

    /// Creates an overflow row and appends a pointer to it.
    fn grow(&self, parent: &mut CacheHandle, adj: &SortKey) -> Result<usize> {
        let ouid = Uid::generate();
        self.store
            .put_row(ouid, &sortkey::overflow_batch(adj, 0), DataItem::default())?;
        let pointer = parent.update(adj, |row| {
            Ok(row.slots.push(ouid, SlotState::OvflBlockUid, 0))
        })?;
        parent.persist(adj)?;
        self.metrics.overflow_created();
        debug!(parent = %parent.uid(), overflow = %ouid, pointer, "overflow.reserve.grow");
        Ok(pointer)
    }

    /// Opens a new batch on every full overflow row.
    fn reopen(&self, parent: &mut CacheHandle, adj: &SortKey) -> Result<()> {
        let full: Vec<(usize, Uid, u32)> = parent
            .get(adj)
            .map(|row| {
                row.slots
                    .iter()
                    .enumerate()
                    .filter(|(_, slot)| slot.state == SlotState::OvflItemFull)
                    .map(|(idx, slot)| (idx, slot.uid, slot.batch))
                    .collect()
            })
            .unwrap_or_default();
        for (pointer, ouid, batch) in full {
            let next = batch + 1;
            let sortk = sortkey::overflow_batch(adj, next);
            let mut overflow = self.cache.lock_for_write(ouid, sortk.as_str())?;
            overflow.put(&sortk, DataItem::default())?;
            parent.update(adj, |row| {
                row.slots.set_state(pointer, SlotState::OvflBlockUid)?;
                row.slots.set_batch(pointer, next)
            })?;
            self.metrics.batch_reopened();
            debug!(parent = %parent.uid(), overflow = %ouid, batch = next, "overflow.reserve.reopen");
        }
        parent.persist(adj)
    }

    /// Marks `pointer` in use and appends the child to its current batch.
    fn claim(
        &self,
        parent: &mut CacheHandle,
        adj: &SortKey,
        pointer: usize,
        child: Uid,
    ) -> Result<Reservation> {
        let slot = parent
            .get(adj)
            .and_then(|row| row.slots.get(pointer))
            .ok_or(GraphError::Invalid("overflow pointer out of range"))?;
        parent.update(adj, |row| row.slots.set_state(pointer, SlotState::OuidInUse))?;

        let sortk = sortkey::overflow_batch(adj, slot.batch);
        let mut overflow = match self.cache.lock_for_write(slot.uid, sortk.as_str()) {
            Ok(handle) => handle,
            Err(err) => {
                parent.update(adj, |row| row.slots.set_state(pointer, SlotState::OvflBlockUid))?;
                return Err(err);
            }
        };
        let appended = overflow.apply(
            &sortk,
            Mutation::AppendSlot {
                uid: child,
                state: SlotState::CuidInUse,
                batch: slot.batch,
            },
            Precondition::SlotsBelow(self.config.overflow_batch_limit),
        );
        match appended {
            Ok(update) => {
                parent.persist(adj)?;
                let index = update.new.slots.len() - 1;
                debug!(
                    parent = %parent.uid(),
                    overflow = %slot.uid,
                    batch = slot.batch,
                    slot = index,
                    "overflow.reserve.claimed"
                );
                Ok(Reservation {
                    target: slot.uid,
                    batch: slot.batch,
                    sortk,
                    slot: index,
                    pointer: Some(pointer),
                    overflow: Some(overflow),
                })
            }
            Err(err) if err.is_retryable() => {
                mark_full(parent, adj, pointer, &mut overflow, &sortk)?;
                Err(err)
            }
            Err(err) => {
                parent.update(adj, |row| row.slots.set_state(pointer, SlotState::OvflBlockUid))?;
                Err(err)
            }
        }
    }
}

/// Returns an overflow pointer to `OvflBlockUid` once its reservation settles.
pub fn release_pointer(parent: &mut CacheHandle, adj: &SortKey, pointer: usize) -> Result<()> {
    parent.update(adj, |row| row.slots.set_state(pointer, SlotState::OvflBlockUid))?;
    parent.persist(adj)
}

/// Flags `pointer` as `OvflItemFull` and the batch row as full, in cache and storage.
pub fn mark_full(
    parent: &mut CacheHandle,
    adj: &SortKey,
    pointer: usize,
    overflow: &mut CacheHandle,
    sortk: &SortKey,
) -> Result<()> {
    parent.update(adj, |row| row.slots.set_state(pointer, SlotState::OvflItemFull))?;
    parent.persist(adj)?;
    if let Err(err) = overflow.apply(sortk, Mutation::MarkFull, Precondition::None) {
        warn!(overflow = %overflow.uid(), sortk = %sortk, error = %err, "overflow.mark_full.failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::CounterMetrics;
    use crate::storage::{MemoryStore, StoreError};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    struct Fixture {
        store: Arc<MemoryStore>,
        cache: NodeCache,
        config: GraphConfig,
        metrics: CounterMetrics,
        parent: Uid,
        adj: SortKey,
    }

    impl Fixture {
        fn new(config: GraphConfig) -> Self {
            let store = Arc::new(MemoryStore::new());
            let cache = NodeCache::new(store.clone(), 64);
            Self {
                store,
                cache,
                config: config.normalize(),
                metrics: CounterMetrics::default(),
                parent: Uid::generate(),
                adj: sortkey::adjacency("A", "F"),
            }
        }

        fn reserve(&self) -> Result<Reservation> {
            let allocator = Allocator::new(&self.cache, self.store.as_ref(), &self.config, &self.metrics);
            let mut parent = self.cache.lock_for_write(self.parent, self.adj.as_str())?;
            let reservation = allocator.reserve(&mut parent, &self.adj, Uid::generate())?;
            if let Some(pointer) = reservation.pointer {
                release_pointer(&mut parent, &self.adj, pointer)?;
            }
            Ok(reservation)
        }

        fn parent_row(&self) -> DataItem {
            self.store.row(self.parent, &self.adj).unwrap_or_default()
        }
    }

    #[test]
    fn embeds_until_threshold_then_spills() {
        let fx = Fixture::new(GraphConfig::default().embedded_threshold(2));
        for _ in 0..2 {
            let reservation = fx.reserve().unwrap();
            assert!(reservation.is_embedded());
            assert_eq!(reservation.target, fx.parent);
        }
        let spilled = fx.reserve().unwrap();
        assert_ne!(spilled.target, fx.parent);
        assert_eq!(spilled.batch, 0);
        assert_eq!(spilled.slot, 0);
        drop(spilled);

        let row = fx.parent_row();
        assert_eq!(
            row.slots.xf(),
            &[SlotState::CuidInUse, SlotState::CuidInUse, SlotState::OvflBlockUid]
        );
        assert_eq!(fx.metrics.overflow_rows_created.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn full_batch_switches_to_new_row() {
        let fx = Fixture::new(GraphConfig::default().embedded_threshold(1));
        fx.reserve().unwrap();
        let first = fx.reserve().unwrap();
        let first_row = first.target;
        drop(first);
        fx.store.inject_fault(Some(first_row), "A#G#:F%", StoreError::ItemTooLarge, 1);
        let second = fx.reserve().unwrap();
        assert_ne!(second.target, first_row);
        drop(second);

        let row = fx.parent_row();
        assert_eq!(row.slots.xf()[1], SlotState::OvflItemFull);
        assert_eq!(row.slots.xf()[2], SlotState::OvflBlockUid);
        let batch = fx
            .store
            .row(first_row, &sortkey::overflow_batch(&fx.adj, 0))
            .unwrap();
        assert!(batch.full);
        assert_eq!(fx.metrics.reserve_retries.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn reopens_full_rows_at_ceiling() {
        let fx = Fixture::new(
            GraphConfig::default()
                .embedded_threshold(1)
                .max_overflow(1)
                .overflow_batch_limit(2),
        );
        fx.reserve().unwrap();
        let mut targets = Vec::new();
        for _ in 0..5 {
            let reservation = fx.reserve().unwrap();
            targets.push((reservation.target, reservation.batch));
        }
        let ouid = targets[0].0;
        assert!(targets.iter().all(|(uid, _)| *uid == ouid));
        let batches: Vec<u32> = targets.iter().map(|(_, batch)| *batch).collect();
        assert_eq!(batches, vec![0, 0, 1, 1, 2]);
        assert_eq!(fx.parent_row().slot_counts().overflow, 1);
        assert_eq!(fx.metrics.batches_reopened.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn non_size_errors_restore_pointer() {
        let fx = Fixture::new(GraphConfig::default().embedded_threshold(1));
        fx.reserve().unwrap();
        drop(fx.reserve().unwrap());
        fx.store
            .inject_fault(None, "A#G#:F%", StoreError::Backend("disk".into()), 1);
        assert_eq!(fx.reserve().unwrap_err(), GraphError::Storage("disk".into()));
        let handle = fx.cache.lock_for_read(fx.parent, fx.adj.as_str()).unwrap();
        let row = handle.get(&fx.adj).unwrap();
        assert_eq!(row.slots.xf()[1], SlotState::OvflBlockUid);
    }
}
