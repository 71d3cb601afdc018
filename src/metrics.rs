use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Hooks for counting edge-protocol events.
///
/// Implementations must be cheap; they are called on the attach hot path.
pub trait EdgeMetrics: Send + Sync {
    /// An attach passed the gatekeeper.
    fn attach_started(&self);

    /// An attach reached the available state.
    fn attach_completed(&self);

    /// The gatekeeper rejected an attach or detach.
    fn gatekeeper_rejected(&self);

    /// A detach soft-deleted a slot.
    fn detach_completed(&self);

    /// The allocator created an overflow row.
    fn overflow_created(&self);

    /// The allocator reopened a full overflow row under a new batch.
    fn batch_reopened(&self);

    /// A transient failure was retried.
    ///
    /// # Parameters
    /// * `site` - `"reserve"` for allocator retries, `"attach"` for whole-attach retries.
    fn retry(&self, site: &'static str);
}

/// Discards every event.
#[derive(Default)]
pub struct NoopMetrics;

impl EdgeMetrics for NoopMetrics {
    fn attach_started(&self) {}
    fn attach_completed(&self) {}
    fn gatekeeper_rejected(&self) {}
    fn detach_completed(&self) {}
    fn overflow_created(&self) {}
    fn batch_reopened(&self) {}
    fn retry(&self, _site: &'static str) {}
}

/// Atomic counters for every event.
#[derive(Default)]
pub struct CounterMetrics {
    /// Attaches that passed the gatekeeper.
    pub attaches_started: AtomicU64,
    /// Attaches that completed.
    pub attaches_completed: AtomicU64,
    /// Gatekeeper rejections.
    pub gatekeeper_rejections: AtomicU64,
    /// Completed detaches.
    pub detaches_completed: AtomicU64,
    /// Overflow rows created.
    pub overflow_rows_created: AtomicU64,
    /// Overflow batches reopened.
    pub batches_reopened: AtomicU64,
    /// Allocator retries.
    pub reserve_retries: AtomicU64,
    /// Whole-attach retries.
    pub attach_retries: AtomicU64,
}

impl EdgeMetrics for CounterMetrics {
    fn attach_started(&self) {
        self.attaches_started.fetch_add(1, Ordering::Relaxed);
    }

    fn attach_completed(&self) {
        self.attaches_completed.fetch_add(1, Ordering::Relaxed);
    }

    fn gatekeeper_rejected(&self) {
        self.gatekeeper_rejections.fetch_add(1, Ordering::Relaxed);
    }

    fn detach_completed(&self) {
        self.detaches_completed.fetch_add(1, Ordering::Relaxed);
    }

    fn overflow_created(&self) {
        self.overflow_rows_created.fetch_add(1, Ordering::Relaxed);
    }

    fn batch_reopened(&self) {
        self.batches_reopened.fetch_add(1, Ordering::Relaxed);
    }

    fn retry(&self, site: &'static str) {
        match site {
            "reserve" => {
                self.reserve_retries.fetch_add(1, Ordering::Relaxed);
            }
            "attach" => {
                self.attach_retries.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

/// The default metrics sink, [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn EdgeMetrics> {
    Arc::new(NoopMetrics)
}
