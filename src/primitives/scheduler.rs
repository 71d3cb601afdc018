//! Edge conflict scheduler.
//!
//! Queues edge-attachment requests and dispatches a request only when no
//! in-flight request touches either of its endpoints. The queue and the
//! in-flight set are owned by one coordination thread; every dispatched
//! request reports back through the same mailbox, which is what wakes the
//! dispatcher. A request gets a permit from the throttle class
//! [`ATTACH_CLASS`] before its thread is started, and the permit comes back
//! with the completion, so running threads never outnumber the ceiling.
//!
//! Non-overlap is a contention heuristic, not a lock: the attach protocol's
//! conditional writes remain the source of truth.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use super::promise::{self, Pending, Resolver};
use super::throttle::{Permit, Throttle};
use crate::types::{GraphError, Result, Uid};

/// Throttle class every dispatched request is admitted through.
pub const ATTACH_CLASS: &str = "attach";

/// One pending edge attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeRequest {
    /// Child endpoint.
    pub child: Uid,
    /// Parent endpoint.
    pub parent: Uid,
    /// Predicate name on the parent's type.
    pub predicate: String,
}

impl EdgeRequest {
    /// Convenience constructor.
    pub fn new(child: Uid, parent: Uid, predicate: impl Into<String>) -> Self {
        Self {
            child,
            parent,
            predicate: predicate.into(),
        }
    }
}

/// Work function run for each dispatched request.
pub type EdgeExecutor = Arc<dyn Fn(&EdgeRequest) -> Vec<GraphError> + Send + Sync>;

/// Counters reported by [`EdgeScheduler::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Requests waiting for their endpoints to free up.
    pub pending: usize,
    /// Requests currently executing.
    pub in_flight: usize,
    /// Requests dispatched since start.
    pub dispatched: u64,
    /// Requests completed since start.
    pub completed: u64,
    /// Highest number of requests observed in flight at once.
    pub peak_in_flight: usize,
}

/// Result handle for a submitted request.
pub struct AttachTicket {
    pending: Pending<Vec<GraphError>>,
}

impl AttachTicket {
    /// Blocks until the request has executed and returns its error list.
    pub fn wait(self) -> Vec<GraphError> {
        match self.pending.wait() {
            Ok(errors) => errors,
            Err(err) => vec![err],
        }
    }
}

enum Msg {
    Submit {
        request: EdgeRequest,
        reply: Resolver<Vec<GraphError>>,
    },
    Completed {
        id: u64,
        permit: Option<Permit>,
    },
    WaitIdle {
        reply: Resolver<()>,
    },
    Stats {
        reply: Resolver<SchedulerStats>,
    },
    Shutdown,
}

/// Handle to the scheduler's coordination thread.
pub struct EdgeScheduler {
    tx: Sender<Msg>,
    worker: Option<JoinHandle<()>>,
}

impl EdgeScheduler {
    /// Starts the dispatcher. `executor` runs each request on its own thread,
    /// started once the endpoints are free and the throttle admits it.
    pub fn start(throttle: Arc<Throttle>, executor: EdgeExecutor) -> Self {
        let (tx, rx) = mpsc::channel();
        let loop_tx = tx.clone();
        let worker = thread::Builder::new()
            .name("rowgraph-scheduler".into())
            .spawn(move || Dispatcher::new(loop_tx, throttle, executor).run(rx))
            .ok();
        Self { tx, worker }
    }

    /// Queues a request.
    pub fn submit(&self, request: EdgeRequest) -> Result<AttachTicket> {
        let (reply, pending) = promise::pair();
        self.send(Msg::Submit { request, reply })?;
        Ok(AttachTicket { pending })
    }

    /// Blocks until nothing is pending or in flight.
    pub fn wait_idle(&self) -> Result<()> {
        let (reply, pending) = promise::pair();
        self.send(Msg::WaitIdle { reply })?;
        pending
            .wait()
            .map_err(|_| GraphError::ShutDown("scheduler"))
    }

    /// Current counters.
    pub fn stats(&self) -> Result<SchedulerStats> {
        let (reply, pending) = promise::pair();
        self.send(Msg::Stats { reply })?;
        pending
            .wait()
            .map_err(|_| GraphError::ShutDown("scheduler"))
    }

    fn send(&self, msg: Msg) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| GraphError::ShutDown("scheduler"))
    }
}

impl Drop for EdgeScheduler {
    fn drop(&mut self) {
        let _ = self.tx.send(Msg::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

type ReplySlot = Arc<Mutex<Option<Resolver<Vec<GraphError>>>>>;

/// Reports a finished request to the dispatcher, returning its permit. Runs
/// on drop so a panicking executor still frees its endpoints.
struct Completion {
    id: u64,
    tx: Sender<Msg>,
    reply: ReplySlot,
    permit: Option<Permit>,
}

impl Completion {
    fn finish(self, errors: Vec<GraphError>) {
        if let Some(reply) = self.reply.lock().take() {
            reply.resolve(errors);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(reply) = self.reply.lock().take() {
            warn!(id = self.id, "scheduler.executor_panicked");
            reply.resolve(vec![GraphError::Cancelled]);
        }
        let _ = self.tx.send(Msg::Completed {
            id: self.id,
            permit: self.permit.take(),
        });
    }
}

struct Queued {
    id: u64,
    request: EdgeRequest,
    reply: Resolver<Vec<GraphError>>,
}

struct Dispatcher {
    tx: Sender<Msg>,
    throttle: Arc<Throttle>,
    executor: EdgeExecutor,
    pending: VecDeque<Queued>,
    in_flight: FxHashMap<u64, (Uid, Uid)>,
    busy: FxHashSet<Uid>,
    idle_waiters: Vec<Resolver<()>>,
    next_id: u64,
    stats: SchedulerStats,
}

impl Dispatcher {
    fn new(tx: Sender<Msg>, throttle: Arc<Throttle>, executor: EdgeExecutor) -> Self {
        Self {
            tx,
            throttle,
            executor,
            pending: VecDeque::new(),
            in_flight: FxHashMap::default(),
            busy: FxHashSet::default(),
            idle_waiters: Vec::new(),
            next_id: 0,
            stats: SchedulerStats::default(),
        }
    }

    fn run(mut self, rx: Receiver<Msg>) {
        while let Ok(msg) = rx.recv() {
            match msg {
                Msg::Submit { request, reply } => {
                    self.next_id += 1;
                    self.pending.push_back(Queued {
                        id: self.next_id,
                        request,
                        reply,
                    });
                    self.dispatch();
                }
                Msg::Completed { id, permit } => {
                    drop(permit);
                    self.complete(id);
                    self.dispatch();
                }
                Msg::WaitIdle { reply } => {
                    if self.is_idle() {
                        reply.resolve(());
                    } else {
                        self.idle_waiters.push(reply);
                    }
                }
                Msg::Stats { reply } => {
                    let mut stats = self.stats;
                    stats.pending = self.pending.len();
                    stats.in_flight = self.in_flight.len();
                    reply.resolve(stats);
                }
                Msg::Shutdown => break,
            }
            if self.is_idle() {
                for waiter in self.idle_waiters.drain(..) {
                    waiter.resolve(());
                }
            }
        }
        if !self.pending.is_empty() {
            warn!(
                dropped = self.pending.len(),
                "scheduler.shutdown.pending_cancelled"
            );
        }
        debug!("scheduler.worker_exit");
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    fn complete(&mut self, id: u64) {
        if let Some((child, parent)) = self.in_flight.remove(&id) {
            self.busy.remove(&child);
            self.busy.remove(&parent);
            self.stats.completed += 1;
        }
    }

    /// Dispatches every queued request whose endpoints are neither in flight
    /// nor wanted by an earlier queued request, keeping per-node FIFO order.
    /// Stops at the first request the throttle cannot admit.
    fn dispatch(&mut self) {
        let mut claimed: FxHashSet<Uid> = FxHashSet::default();
        let mut keep = VecDeque::with_capacity(self.pending.len());
        while let Some(queued) = self.pending.pop_front() {
            let (child, parent) = (queued.request.child, queued.request.parent);
            let blocked = self.busy.contains(&child)
                || self.busy.contains(&parent)
                || claimed.contains(&child)
                || claimed.contains(&parent);
            if blocked {
                claimed.insert(child);
                claimed.insert(parent);
                keep.push_back(queued);
                continue;
            }
            let permit = match self.admit() {
                Ok(Some(permit)) => permit,
                Ok(None) => {
                    keep.push_back(queued);
                    break;
                }
                Err(err) => {
                    queued.reply.resolve(vec![err]);
                    continue;
                }
            };
            self.busy.insert(child);
            self.busy.insert(parent);
            self.in_flight.insert(queued.id, (child, parent));
            self.stats.dispatched += 1;
            self.stats.peak_in_flight = self.stats.peak_in_flight.max(self.in_flight.len());
            self.spawn(queued, permit);
        }
        keep.extend(self.pending.drain(..));
        self.pending = keep;
    }

    /// Takes an attach slot. While requests of ours are running a full class
    /// just defers dispatch to their completion; with none running nothing
    /// would wake the dispatcher, so it waits for the slot.
    fn admit(&self) -> Result<Option<Permit>> {
        if self.in_flight.is_empty() {
            self.throttle.ask(ATTACH_CLASS).map(Some)
        } else {
            self.throttle.try_ask(ATTACH_CLASS)
        }
    }

    fn spawn(&mut self, queued: Queued, permit: Permit) {
        let Queued { id, request, reply } = queued;
        debug!(
            id,
            class = permit.class(),
            child = %request.child,
            parent = %request.parent,
            predicate = %request.predicate,
            "scheduler.dispatch"
        );
        let reply: ReplySlot = Arc::new(Mutex::new(Some(reply)));
        let worker_reply = Arc::clone(&reply);
        let tx = self.tx.clone();
        let executor = Arc::clone(&self.executor);
        let spawned = thread::Builder::new()
            .name(format!("rowgraph-attach-{id}"))
            .spawn(move || {
                let done = Completion {
                    id,
                    tx,
                    reply: worker_reply,
                    permit: Some(permit),
                };
                let errors = executor(&request);
                done.finish(errors);
            });
        if let Err(err) = spawned {
            warn!(id, error = %err, "scheduler.spawn_failed");
            self.complete(id);
            if let Some(reply) = reply.lock().take() {
                reply.resolve(vec![GraphError::Spawn(err.to_string())]);
            }
        }
    }
}
