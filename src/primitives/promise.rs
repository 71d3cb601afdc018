//! Single-resolution promise used to hand one value between two tasks.
//!
//! A [`Resolver`] settles the promise at most once; the matching [`Pending`]
//! blocks until the value arrives. Dropping the resolver without settling
//! wakes the waiter with [`GraphError::Cancelled`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::types::{GraphError, Result};

enum Slot<T> {
    Empty,
    Ready(T),
    Taken,
    Abandoned,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    cv: Condvar,
}

/// Write side of a promise.
pub struct Resolver<T> {
    shared: Arc<Shared<T>>,
}

/// Read side of a promise.
pub struct Pending<T> {
    shared: Arc<Shared<T>>,
}

/// Creates a connected resolver / pending pair.
pub fn pair<T>() -> (Resolver<T>, Pending<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot::Empty),
        cv: Condvar::new(),
    });
    (
        Resolver {
            shared: Arc::clone(&shared),
        },
        Pending { shared },
    )
}

impl<T> Resolver<T> {
    /// Settles the promise. Returns false if it was already settled.
    pub fn resolve(self, value: T) -> bool {
        let mut slot = self.shared.slot.lock();
        if !matches!(*slot, Slot::Empty) {
            return false;
        }
        *slot = Slot::Ready(value);
        self.shared.cv.notify_all();
        true
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        let mut slot = self.shared.slot.lock();
        if matches!(*slot, Slot::Empty) {
            *slot = Slot::Abandoned;
            self.shared.cv.notify_all();
        }
    }
}

impl<T> Pending<T> {
    /// Blocks until the value is available.
    pub fn wait(self) -> Result<T> {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(outcome) = Self::take(&mut slot) {
                return outcome;
            }
            self.shared.cv.wait(&mut slot);
        }
    }

    /// Blocks until the value is available or `timeout` elapses.
    ///
    /// On timeout the promise stays pending and can be waited on again.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(outcome) = Self::take(&mut slot) {
                return Some(outcome);
            }
            if self.shared.cv.wait_until(&mut slot, deadline).timed_out() {
                return Self::take(&mut slot);
            }
        }
    }

    fn take(slot: &mut Slot<T>) -> Option<Result<T>> {
        match std::mem::replace(slot, Slot::Taken) {
            Slot::Ready(value) => Some(Ok(value)),
            Slot::Abandoned => Some(Err(GraphError::Cancelled)),
            Slot::Taken => Some(Err(GraphError::Cancelled)),
            Slot::Empty => {
                *slot = Slot::Empty;
                None
            }
        }
    }
}
