use std::fmt;
use std::sync::Arc;

use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::RawRwLock;
use tracing::warn;

use super::{refresh, CachedNode, EntrySlot, Uncounted, WriteGuard};
use crate::storage::{DataItem, Mutation, Precondition, RowStore, RowUpdate};
use crate::types::{GraphError, Result, SortKey, Uid};

/// Lock mode a [`CacheHandle`] was acquired with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    /// Shared with other readers.
    Shared,
    /// Exclusive use of the whole entry.
    Exclusive,
}

enum Guard {
    Shared(ArcRwLockReadGuard<RawRwLock, CachedNode>),
    Exclusive(WriteGuard),
}

/// Locked view of one cached node.
///
/// Dropping the handle releases the lock in the mode it was taken.
/// Exclusive handles also offer write-through helpers that update storage
/// and the cached image together.
pub struct CacheHandle {
    guard: Option<Guard>,
    slot: Arc<EntrySlot>,
    store: Arc<dyn RowStore>,
}

impl fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHandle")
            .field("uid", &self.slot.uid())
            .field("mode", &self.mode())
            .finish()
    }
}

impl CacheHandle {
    pub(super) fn shared(
        slot: Arc<EntrySlot>,
        guard: ArcRwLockReadGuard<RawRwLock, CachedNode>,
        store: Arc<dyn RowStore>,
    ) -> Self {
        Self {
            guard: Some(Guard::Shared(guard)),
            slot,
            store,
        }
    }

    pub(super) fn exclusive(slot: Arc<EntrySlot>, guard: WriteGuard, store: Arc<dyn RowStore>) -> Self {
        Self {
            guard: Some(Guard::Exclusive(guard)),
            slot,
            store,
        }
    }

    /// Node this handle locks.
    pub fn uid(&self) -> Uid {
        self.slot.uid()
    }

    /// Mode the lock was acquired in.
    pub fn mode(&self) -> LockMode {
        match self.guard {
            Some(Guard::Exclusive(_)) => LockMode::Exclusive,
            _ => LockMode::Shared,
        }
    }

    fn node(&self) -> Option<&CachedNode> {
        match self.guard.as_ref()? {
            Guard::Shared(guard) => Some(&**guard),
            Guard::Exclusive(guard) => Some(&**guard),
        }
    }

    fn node_mut(&mut self) -> Result<&mut CachedNode> {
        match self.guard.as_mut() {
            Some(Guard::Exclusive(guard)) => Ok(&mut **guard),
            _ => Err(GraphError::Invalid("handle is not exclusive")),
        }
    }

    /// Cached row under `sortk`.
    pub fn get(&self, sortk: &SortKey) -> Option<&DataItem> {
        self.node()?.rows().get(sortk)
    }

    /// Cached rows whose sort key starts with `prefix`, in key order.
    pub fn rows_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a SortKey, &'a DataItem)> + 'a {
        self.node()
            .into_iter()
            .flat_map(|node| node.rows().iter())
            .filter(move |(key, _)| key.has_prefix(prefix))
    }

    /// True when no rows are cached for the node.
    pub fn is_empty(&self) -> bool {
        self.node().map_or(true, |node| node.rows().is_empty())
    }

    /// Mutates the cached row under `sortk`, creating it empty if absent.
    /// Storage is not touched; follow with [`CacheHandle::persist`].
    pub fn update<R>(
        &mut self,
        sortk: &SortKey,
        f: impl FnOnce(&mut DataItem) -> Result<R>,
    ) -> Result<R> {
        let node = self.node_mut()?;
        f(node.rows_mut().entry(sortk.clone()).or_default())
    }

    /// Writes the cached image of `sortk` to storage.
    pub fn persist(&mut self, sortk: &SortKey) -> Result<()> {
        let uid = self.uid();
        let store = Arc::clone(&self.store);
        let node = self.node_mut()?;
        let item = node.rows().get(sortk).cloned().unwrap_or_default();
        store.put_row(uid, sortk, item)?;
        Ok(())
    }

    /// Writes `item` to storage and installs it in the cache.
    pub fn put(&mut self, sortk: &SortKey, item: DataItem) -> Result<()> {
        let uid = self.uid();
        let store = Arc::clone(&self.store);
        let node = self.node_mut()?;
        store.put_row(uid, sortk, item.clone())?;
        node.rows_mut().insert(sortk.clone(), item);
        Ok(())
    }

    /// Conditionally updates one row in storage and installs the new image.
    pub fn apply(
        &mut self,
        sortk: &SortKey,
        mutation: Mutation,
        precondition: Precondition,
    ) -> Result<RowUpdate> {
        let uid = self.uid();
        let store = Arc::clone(&self.store);
        let node = self.node_mut()?;
        let update = store.update_row(uid, sortk, mutation, precondition)?;
        node.rows_mut().insert(sortk.clone(), update.new.clone());
        Ok(update)
    }

    /// Installs a row image already written to storage by someone else.
    pub fn install(&mut self, sortk: SortKey, item: DataItem) -> Result<()> {
        self.node_mut()?.rows_mut().insert(sortk, item);
        Ok(())
    }

    /// Releases the lock, re-reading invalidated rows first when exclusive.
    pub fn release(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        match self.guard.take() {
            Some(Guard::Exclusive(mut guard)) => {
                if self.slot.is_stale() {
                    refresh(&self.slot, &mut guard, self.store.as_ref(), &Uncounted)?;
                }
                Ok(())
            }
            Some(Guard::Shared(_)) | None => Ok(()),
        }
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        if let Err(err) = self.finish() {
            warn!(uid = %self.slot.uid(), error = %err, "cache.release.refresh_failed");
        }
    }
}
