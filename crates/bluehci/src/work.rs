//! Deferred work queue
//!
//! Timers (limited advertising expiry, RPA rotation) and follow-up work that
//! may block on the controller (restarting a persistent advertising set) run
//! on a dedicated worker thread, never in the dispatch context.
//!
//! Tasks are keyed: scheduling a key that is already pending replaces the
//! old task, and cancelling is best effort. A task that was already picked
//! by the worker still runs, so every task must re-check the state of the
//! object it acts on.

use log::{debug, trace};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Identity of a deferred task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkKey {
    /// Limited advertising expiry for an advertising handle
    AdvTimeout(u8),
    /// Restart of a persistent advertising set
    AdvRestart(u8),
    /// Removal of a torn down advertising set from the controller
    AdvRemove(u8),
    /// Resume paused persistent sets once a connection slot is free
    AdvResume,
    /// Resolvable private address rotation
    RpaRotate,
}

type Task = Box<dyn FnOnce() + Send>;

struct State {
    tasks: HashMap<WorkKey, (Instant, Task)>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Single threaded deferred work queue
pub struct Scheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pending: Vec<WorkKey> = self.shared.lock().tasks.keys().copied().collect();
        f.debug_struct("Scheduler").field("pending", &pending).finish()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                tasks: HashMap::new(),
                shutdown: false,
            }),
            wakeup: Condvar::new(),
        });

        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("bluehci-work".into())
            .spawn(move || run_worker(&worker_shared))
            .ok();
        if worker.is_none() {
            log::error!("failed to spawn deferred work thread");
        }

        Self {
            shared,
            worker: Mutex::new(worker),
        }
    }

    /// Run `task` after `delay`, replacing any pending task with the same key
    pub fn schedule<F>(&self, key: WorkKey, delay: Duration, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.lock();
        if state.tasks.insert(key, (Instant::now() + delay, Box::new(task))).is_some() {
            trace!("rescheduled {:?}", key);
        }
        self.shared.wakeup.notify_one();
    }

    /// Drop a pending task; returns whether one was pending
    pub fn cancel(&self, key: WorkKey) -> bool {
        self.shared.lock().tasks.remove(&key).is_some()
    }

    pub fn is_pending(&self, key: WorkKey) -> bool {
        self.shared.lock().tasks.contains_key(&key)
    }

    /// Stop the worker; pending tasks are dropped
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            state.tasks.clear();
        }
        self.shared.wakeup.notify_all();

        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            // A task may drop the last handle to us from the worker itself
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(shared: &Shared) {
    let mut state = shared.lock();
    loop {
        if state.shutdown {
            debug!("deferred work thread exiting");
            return;
        }

        let now = Instant::now();
        let next = state.tasks.iter().min_by_key(|(_, (due, _))| *due).map(|(key, (due, _))| (*key, *due));

        match next {
            None => {
                state = shared.wakeup.wait(state).unwrap_or_else(|e| e.into_inner());
            }
            Some((_, due)) if due > now => {
                state = shared
                    .wakeup
                    .wait_timeout(state, due - now)
                    .unwrap_or_else(|e| e.into_inner())
                    .0;
            }
            Some((key, _)) => {
                if let Some((_, task)) = state.tasks.remove(&key) {
                    drop(state);
                    trace!("running deferred {:?}", key);
                    task();
                    state = shared.lock();
                }
            }
        }
    }
}
