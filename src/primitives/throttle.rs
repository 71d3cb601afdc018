//! Admission throttle bounding concurrently active tasks per named class.
//!
//! All counters live on a single coordination thread and are only touched
//! through its mailbox. Callers block in [`Throttle::ask`] until admitted and
//! release their slot by dropping the returned [`Permit`].

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};

use rustc_hash::FxHashMap;
use tracing::{debug, info};

use super::promise::{self, Resolver};
use crate::types::{GraphError, Result};

/// Point-in-time view of one task class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSnapshot {
    /// Class name.
    pub class: String,
    /// Maximum concurrently admitted tasks.
    pub ceiling: usize,
    /// Currently admitted tasks.
    pub active: usize,
    /// Tasks queued for admission.
    pub waiting: usize,
}

enum Msg {
    Register { class: String, ceiling: usize },
    Ask { class: String, reply: Resolver<()> },
    TryAsk { class: String, reply: Resolver<bool> },
    Finished { class: String },
    Snapshot { reply: Resolver<Vec<ClassSnapshot>> },
    Shutdown,
}

/// Handle to the throttle's coordination thread.
pub struct Throttle {
    tx: Sender<Msg>,
    worker: Option<JoinHandle<()>>,
}

/// Admission slot; releases itself on drop.
#[must_use = "dropping a permit immediately releases the slot"]
pub struct Permit {
    class: String,
    tx: Sender<Msg>,
}

impl Permit {
    /// Class this permit was issued for.
    pub fn class(&self) -> &str {
        &self.class
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let _ = self.tx.send(Msg::Finished {
            class: std::mem::take(&mut self.class),
        });
    }
}

impl Throttle {
    /// Starts the coordination thread. Classes never registered explicitly
    /// are created on first use with `default_ceiling`.
    pub fn start(default_ceiling: usize) -> Self {
        let (tx, rx) = mpsc::channel();
        let default_ceiling = default_ceiling.max(1);
        let worker = thread::Builder::new()
            .name("rowgraph-throttle".into())
            .spawn(move || run(rx, default_ceiling))
            .ok();
        Self { tx, worker }
    }

    /// Registers `class` or changes its ceiling. Raising a ceiling admits
    /// queued tasks immediately.
    pub fn register(&self, class: &str, ceiling: usize) -> Result<()> {
        self.send(Msg::Register {
            class: class.to_string(),
            ceiling: ceiling.max(1),
        })
    }

    /// Alias of [`Throttle::register`] for callers adjusting a live class.
    pub fn set_ceiling(&self, class: &str, ceiling: usize) -> Result<()> {
        self.register(class, ceiling)
    }

    /// Blocks until a slot in `class` is free.
    pub fn ask(&self, class: &str) -> Result<Permit> {
        let (reply, pending) = promise::pair();
        self.send(Msg::Ask {
            class: class.to_string(),
            reply,
        })?;
        pending
            .wait()
            .map_err(|_| GraphError::ShutDown("throttle"))?;
        Ok(self.permit(class))
    }

    /// Admits only if a slot is free right now.
    pub fn try_ask(&self, class: &str) -> Result<Option<Permit>> {
        let (reply, pending) = promise::pair();
        self.send(Msg::TryAsk {
            class: class.to_string(),
            reply,
        })?;
        let admitted = pending
            .wait()
            .map_err(|_| GraphError::ShutDown("throttle"))?;
        Ok(admitted.then(|| self.permit(class)))
    }

    /// Current state of every known class, sorted by name.
    pub fn snapshot(&self) -> Result<Vec<ClassSnapshot>> {
        let (reply, pending) = promise::pair();
        self.send(Msg::Snapshot { reply })?;
        pending.wait().map_err(|_| GraphError::ShutDown("throttle"))
    }

    fn permit(&self, class: &str) -> Permit {
        Permit {
            class: class.to_string(),
            tx: self.tx.clone(),
        }
    }

    fn send(&self, msg: Msg) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| GraphError::ShutDown("throttle"))
    }
}

impl Drop for Throttle {
    fn drop(&mut self) {
        let _ = self.tx.send(Msg::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

struct ClassState {
    ceiling: usize,
    active: usize,
    waiting: VecDeque<Resolver<()>>,
}

impl ClassState {
    fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            active: 0,
            waiting: VecDeque::new(),
        }
    }

    fn admit_waiting(&mut self) {
        while self.active < self.ceiling {
            let Some(next) = self.waiting.pop_front() else {
                break;
            };
            if next.resolve(()) {
                self.active += 1;
            }
        }
    }
}

fn run(rx: Receiver<Msg>, default_ceiling: usize) {
    let mut classes: FxHashMap<String, ClassState> = FxHashMap::default();
    while let Ok(msg) = rx.recv() {
        match msg {
            Msg::Register { class, ceiling } => {
                let state = classes
                    .entry(class.clone())
                    .or_insert_with(|| ClassState::new(ceiling));
                state.ceiling = ceiling;
                state.admit_waiting();
                info!(class = %class, ceiling, "throttle.register");
            }
            Msg::Ask { class, reply } => {
                let state = classes
                    .entry(class.clone())
                    .or_insert_with(|| ClassState::new(default_ceiling));
                if state.active < state.ceiling && state.waiting.is_empty() {
                    if reply.resolve(()) {
                        state.active += 1;
                    }
                } else {
                    state.waiting.push_back(reply);
                    debug!(
                        class = %class,
                        active = state.active,
                        waiting = state.waiting.len(),
                        "throttle.ask.queued"
                    );
                }
            }
            Msg::TryAsk { class, reply } => {
                let state = classes
                    .entry(class)
                    .or_insert_with(|| ClassState::new(default_ceiling));
                let admit = state.active < state.ceiling && state.waiting.is_empty();
                if reply.resolve(admit) && admit {
                    state.active += 1;
                }
            }
            Msg::Finished { class } => {
                if let Some(state) = classes.get_mut(&class) {
                    state.active = state.active.saturating_sub(1);
                    state.admit_waiting();
                }
            }
            Msg::Snapshot { reply } => {
                let mut snap: Vec<ClassSnapshot> = classes
                    .iter()
                    .map(|(class, state)| ClassSnapshot {
                        class: class.clone(),
                        ceiling: state.ceiling,
                        active: state.active,
                        waiting: state.waiting.len(),
                    })
                    .collect();
                snap.sort_by(|a, b| a.class.cmp(&b.class));
                reply.resolve(snap);
            }
            Msg::Shutdown => break,
        }
    }
    debug!("throttle.worker_exit");
}
