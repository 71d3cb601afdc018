//! Node cache: the process-wide map from node UID to cached rows.
//!
//! Each entry is materialized lazily on first access under an init gate:
//! the first caller performs the storage read while later arrivals wait on
//! a one-shot readiness signal and then take their own lock. Entries hold a
//! reader/writer lock over the cached rows; handles own the guard, so the
//! lock mode is decided once at acquisition and consulted once at release.
//!
//! The cache is bounded. Least-recently-used entries are evicted once the
//! capacity is exceeded, but only when no handle or waiter holds them.

mod handle;

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::{Condvar, Mutex, RawRwLock, RwLock};
use tracing::{debug, trace, warn};

pub use handle::{CacheHandle, LockMode};

use crate::storage::{DataItem, RowStore};
use crate::types::{GraphError, Result, SortKey, Uid};

pub(crate) type WriteGuard = ArcRwLockWriteGuard<RawRwLock, CachedNode>;

/// Counters reported by [`NodeCache::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Acquisitions that found an entry.
    pub hits: u64,
    /// Acquisitions that created an entry.
    pub misses: u64,
    /// Entries dropped to respect the capacity.
    pub evictions: u64,
    /// Storage reads issued for stale or missing prefixes of existing entries.
    pub refreshes: u64,
}

impl CacheStats {
    /// Fraction of acquisitions served by an existing entry.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    refreshes: AtomicU64,
}

/// Rows of one node materialized in memory.
#[derive(Debug, Default)]
pub struct CachedNode {
    rows: BTreeMap<SortKey, DataItem>,
    loaded: Vec<String>,
}

impl CachedNode {
    pub(crate) fn covers(&self, prefix: &str) -> bool {
        self.loaded.iter().any(|done| prefix.starts_with(done.as_str()))
    }

    fn merge(&mut self, prefix: &str, rows: Vec<(SortKey, DataItem)>) {
        self.rows.retain(|key, _| !key.has_prefix(prefix));
        self.rows.extend(rows);
        self.loaded.retain(|done| !done.starts_with(prefix));
        self.loaded.push(prefix.to_string());
    }

    fn forget(&mut self, prefix: &str) {
        self.rows.retain(|key, _| !key.has_prefix(prefix));
        self.loaded.retain(|done| !done.starts_with(prefix));
    }

    pub(crate) fn rows(&self) -> &BTreeMap<SortKey, DataItem> {
        &self.rows
    }

    pub(crate) fn rows_mut(&mut self) -> &mut BTreeMap<SortKey, DataItem> {
        &mut self.rows
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Init {
    Loading,
    Ready,
    Failed,
}

#[derive(Debug, Default)]
struct Staleness {
    all: bool,
    prefixes: Vec<String>,
}

impl Staleness {
    fn is_empty(&self) -> bool {
        !self.all && self.prefixes.is_empty()
    }
}

pub(crate) struct EntrySlot {
    uid: Uid,
    init: Mutex<Init>,
    ready: Condvar,
    node: Arc<RwLock<CachedNode>>,
    stale: Mutex<Staleness>,
}

impl EntrySlot {
    fn new(uid: Uid) -> Self {
        Self {
            uid,
            init: Mutex::new(Init::Loading),
            ready: Condvar::new(),
            node: Arc::new(RwLock::new(CachedNode::default())),
            stale: Mutex::new(Staleness::default()),
        }
    }

    fn settle(&self, state: Init) {
        *self.init.lock() = state;
        self.ready.notify_all();
    }

    /// Waits for the creator's initial read. `Ok(false)` means it failed and
    /// the caller should start over.
    fn wait_ready(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        let mut init = self.init.lock();
        loop {
            match *init {
                Init::Ready => return Ok(true),
                Init::Failed => return Ok(false),
                Init::Loading => {}
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut init, deadline).timed_out()
                        && *init == Init::Loading
                    {
                        return Err(GraphError::LockTimeout(self.uid));
                    }
                }
                None => self.ready.wait(&mut init),
            }
        }
    }

    pub(crate) fn is_stale(&self) -> bool {
        !self.stale.lock().is_empty()
    }

    fn take_stale(&self) -> Staleness {
        std::mem::take(&mut *self.stale.lock())
    }

    fn mark_all_stale(&self) {
        self.stale.lock().all = true;
    }

    pub(crate) fn uid(&self) -> Uid {
        self.uid
    }
}

/// Process-wide node cache. Constructed once and shared by reference.
pub struct NodeCache {
    entries: Mutex<LruCache<Uid, Arc<EntrySlot>>>,
    capacity: NonZeroUsize,
    store: Arc<dyn RowStore>,
    lock_timeout: Option<Duration>,
    counters: Counters,
}

impl NodeCache {
    /// Creates a cache over `store` holding at most `capacity` idle entries.
    pub fn new(store: Arc<dyn RowStore>, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
            capacity: NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN),
            store,
            lock_timeout: None,
            counters: Counters::default(),
        }
    }

    /// Bounds every lock acquisition by `timeout`.
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Acquires a shared handle on `uid`, loading `prefix` if it is not cached.
    pub fn lock_for_read(&self, uid: Uid, prefix: &str) -> Result<CacheHandle> {
        self.acquire(uid, prefix, LockMode::Shared)
    }

    /// Acquires an exclusive handle on `uid`, loading `prefix` if it is not cached.
    pub fn lock_for_write(&self, uid: Uid, prefix: &str) -> Result<CacheHandle> {
        self.acquire(uid, prefix, LockMode::Exclusive)
    }

    /// Marks every cached row of `uid` stale.
    pub fn invalidate(&self, uid: Uid) {
        if let Some(slot) = self.entries.lock().peek(&uid).cloned() {
            slot.mark_all_stale();
            debug!(uid = %uid, "cache.invalidate");
        }
    }

    /// Marks the cached rows of `uid` under `prefix` stale.
    pub fn invalidate_prefix(&self, uid: Uid, prefix: &str) {
        if let Some(slot) = self.entries.lock().peek(&uid).cloned() {
            let mut stale = slot.stale.lock();
            if !stale.all && !stale.prefixes.iter().any(|known| prefix.starts_with(known.as_str())) {
                stale.prefixes.retain(|known| !known.starts_with(prefix));
                stale.prefixes.push(prefix.to_string());
            }
            trace!(uid = %uid, prefix, "cache.invalidate_prefix");
        }
    }

    /// Whether an entry for `uid` is resident.
    pub fn contains(&self, uid: Uid) -> bool {
        self.entries.lock().contains(&uid)
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when no entry is resident.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            refreshes: self.counters.refreshes.load(Ordering::Relaxed),
        }
    }

    fn acquire(&self, uid: Uid, prefix: &str, mode: LockMode) -> Result<CacheHandle> {
        loop {
            let (slot, created) = self.slot_for(uid);
            if created {
                self.initialize(&slot, prefix)?;
            } else if !slot.wait_ready(self.lock_timeout)? {
                trace!(uid = %uid, "cache.init.retry");
                continue;
            }
            return match mode {
                LockMode::Shared => {
                    let guard = self.read_guard(&slot)?;
                    if guard.covers(prefix) && !slot.is_stale() {
                        Ok(CacheHandle::shared(slot, guard, Arc::clone(&self.store)))
                    } else {
                        drop(guard);
                        let mut guard = self.write_guard(&slot)?;
                        self.bring_current(&slot, &mut guard, prefix)?;
                        let guard = ArcRwLockWriteGuard::downgrade(guard);
                        Ok(CacheHandle::shared(slot, guard, Arc::clone(&self.store)))
                    }
                }
                LockMode::Exclusive => {
                    let mut guard = self.write_guard(&slot)?;
                    self.bring_current(&slot, &mut guard, prefix)?;
                    Ok(CacheHandle::exclusive(slot, guard, Arc::clone(&self.store)))
                }
            };
        }
    }

    fn slot_for(&self, uid: Uid) -> (Arc<EntrySlot>, bool) {
        let mut entries = self.entries.lock();
        if let Some(slot) = entries.get(&uid) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return (Arc::clone(slot), false);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(EntrySlot::new(uid));
        entries.put(uid, Arc::clone(&slot));
        self.evict_idle(&mut entries);
        (slot, true)
    }

    fn evict_idle(&self, entries: &mut LruCache<Uid, Arc<EntrySlot>>) {
        while entries.len() > self.capacity.get() {
            let victim = entries
                .iter()
                .rev()
                .find(|(_, slot)| Arc::strong_count(slot) == 1 && Arc::strong_count(&slot.node) == 1)
                .map(|(uid, _)| *uid);
            let Some(uid) = victim else {
                trace!(resident = entries.len(), "cache.evict.busy");
                break;
            };
            entries.pop(&uid);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            trace!(uid = %uid, "cache.evict");
        }
    }

    fn initialize(&self, slot: &Arc<EntrySlot>, prefix: &str) -> Result<()> {
        match self.store.fetch_rows(slot.uid, prefix) {
            Ok(rows) => {
                slot.node.write().merge(prefix, rows);
                slot.settle(Init::Ready);
                debug!(uid = %slot.uid, prefix, "cache.lock.miss");
                Ok(())
            }
            Err(err) => {
                {
                    let mut entries = self.entries.lock();
                    if entries.peek(&slot.uid).is_some_and(|known| Arc::ptr_eq(known, slot)) {
                        entries.pop(&slot.uid);
                    }
                }
                slot.settle(Init::Failed);
                warn!(uid = %slot.uid, prefix, error = %err, "cache.init.failed");
                Err(err.into())
            }
        }
    }

    fn read_guard(
        &self,
        slot: &EntrySlot,
    ) -> Result<parking_lot::lock_api::ArcRwLockReadGuard<RawRwLock, CachedNode>> {
        match self.lock_timeout {
            Some(timeout) => slot
                .node
                .try_read_arc_for(timeout)
                .ok_or(GraphError::LockTimeout(slot.uid)),
            None => Ok(slot.node.read_arc()),
        }
    }

    fn write_guard(&self, slot: &EntrySlot) -> Result<WriteGuard> {
        match self.lock_timeout {
            Some(timeout) => slot
                .node
                .try_write_arc_for(timeout)
                .ok_or(GraphError::LockTimeout(slot.uid)),
            None => Ok(slot.node.write_arc()),
        }
    }

    /// Applies pending invalidations, then widens the entry to `prefix`.
    fn bring_current(&self, slot: &EntrySlot, node: &mut CachedNode, prefix: &str) -> Result<()> {
        refresh(slot, node, self.store.as_ref(), &self.counters)?;
        if !node.covers(prefix) {
            let rows = self.store.fetch_rows(slot.uid, prefix)?;
            node.merge(prefix, rows);
            self.counters.refreshes.fetch_add(1, Ordering::Relaxed);
            debug!(uid = %slot.uid, prefix, "cache.lock.widen");
        }
        Ok(())
    }
}

/// Re-reads whatever was invalidated since the entry was last brought current.
pub(crate) fn refresh(
    slot: &EntrySlot,
    node: &mut CachedNode,
    store: &dyn RowStore,
    counters: &impl RefreshCounter,
) -> Result<()> {
    let stale = slot.take_stale();
    if stale.is_empty() {
        return Ok(());
    }
    let outcome = reload(slot.uid, node, store, &stale);
    match outcome {
        Ok(reads) => {
            counters.add_refreshes(reads);
            trace!(uid = %slot.uid, reads, "cache.refresh");
            Ok(())
        }
        Err(err) => {
            slot.mark_all_stale();
            warn!(uid = %slot.uid, error = %err, "cache.refresh.failed");
            Err(err.into())
        }
    }
}

fn reload(
    uid: Uid,
    node: &mut CachedNode,
    store: &dyn RowStore,
    stale: &Staleness,
) -> std::result::Result<u64, crate::storage::StoreError> {
    let mut reads = 0;
    if stale.all {
        let loaded = std::mem::take(&mut node.loaded);
        node.rows.clear();
        for prefix in loaded {
            let rows = store.fetch_rows(uid, &prefix)?;
            node.merge(&prefix, rows);
            reads += 1;
        }
        return Ok(reads);
    }
    for prefix in &stale.prefixes {
        let covered = node.covers(prefix);
        node.forget(prefix);
        if covered {
            let rows = store.fetch_rows(uid, prefix)?;
            node.merge(prefix, rows);
            reads += 1;
        }
    }
    Ok(reads)
}

/// Sink for refresh counts; lets handles refresh without the whole cache.
pub(crate) trait RefreshCounter {
    fn add_refreshes(&self, reads: u64);
}

impl RefreshCounter for Counters {
    fn add_refreshes(&self, reads: u64) {
        self.refreshes.fetch_add(reads, Ordering::Relaxed);
    }
}

/// Counter used by handles refreshing at release time.
pub(crate) struct Uncounted;

impl RefreshCounter for Uncounted {
    fn add_refreshes(&self, _reads: u64) {}
}
