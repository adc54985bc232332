//! Credit based flow control toward the controller
//!
//! The controller advertises how many commands and how many ACL/ISO data
//! packets it can buffer. Each of those capacities is modelled as a
//! [`CreditPool`]: a sender takes one credit per packet and the controller
//! hands credits back through Command Complete/Status and Number Of
//! Completed Packets events.

use crate::error::{HciError, Result};
use log::{trace, warn};
use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct PoolState {
    available: usize,
    ceiling: usize,
    waiters: usize,
}

/// A counting permit pool with a controller-advertised ceiling
#[derive(Debug)]
pub struct CreditPool {
    name: &'static str,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl CreditPool {
    /// Create a pool that starts full
    pub fn new(name: &'static str, ceiling: usize) -> Self {
        Self {
            name,
            state: Mutex::new(PoolState {
                available: ceiling,
                ceiling,
                waiters: 0,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Credits currently available
    pub fn available(&self) -> usize {
        self.lock().available
    }

    /// Controller-advertised ceiling
    pub fn ceiling(&self) -> usize {
        self.lock().ceiling
    }

    /// Number of callers currently suspended in [`acquire`](Self::acquire)
    pub fn waiters(&self) -> usize {
        self.lock().waiters
    }

    /// Set a new ceiling and refill the pool to it
    pub fn reset(&self, ceiling: usize) {
        let mut state = self.lock();
        state.ceiling = ceiling;
        state.available = ceiling;
        trace!("{} credits reset to {}", self.name, ceiling);
        self.available.notify_all();
    }

    /// Take a credit if one is available, without blocking
    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        if state.available > 0 {
            state.available -= 1;
            true
        } else {
            false
        }
    }

    /// Take a credit, waiting at most `timeout` (forever if `None`)
    ///
    /// `opcode` is only used to label the timeout error.
    pub fn acquire(&self, timeout: Option<Duration>, opcode: u16) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        state.waiters += 1;

        while state.available == 0 {
            state = match deadline {
                None => self.available.wait(state).unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.waiters -= 1;
                        return Err(HciError::Timeout(opcode));
                    }
                    self.available
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }

        state.waiters -= 1;
        state.available -= 1;
        Ok(())
    }

    /// Return `count` credits, clamped to the ceiling
    ///
    /// Returns the number of credits actually added.
    pub fn release(&self, count: usize) -> usize {
        let mut state = self.lock();
        let room = state.ceiling - state.available;
        let added = count.min(room);
        if added < count {
            warn!(
                "{} credit release of {} clamped to ceiling {} ({} available)",
                self.name, count, state.ceiling, state.available
            );
        }
        state.available += added;
        drop(state);

        for _ in 0..added {
            self.available.notify_one();
        }
        added
    }
}

/// Traffic class of a data connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkClass {
    Acl,
    Iso,
}

/// All credit pools of a controller
#[derive(Debug)]
pub struct FlowControl {
    commands: CreditPool,
    acl: CreditPool,
    iso: CreditPool,
    /// Packets in flight per registered connection handle
    in_flight: Mutex<HashMap<u16, (LinkClass, usize)>>,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowControl {
    /// One command credit until the controller says otherwise, no data credits
    pub fn new() -> Self {
        Self {
            commands: CreditPool::new("command", 1),
            acl: CreditPool::new("acl", 0),
            iso: CreditPool::new("iso", 0),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn commands(&self) -> &CreditPool {
        &self.commands
    }

    pub fn pool(&self, class: LinkClass) -> &CreditPool {
        match class {
            LinkClass::Acl => &self.acl,
            LinkClass::Iso => &self.iso,
        }
    }

    pub fn acquire_command_credit(&self, timeout: Option<Duration>, opcode: u16) -> Result<()> {
        self.commands.acquire(timeout, opcode)
    }

    pub fn release_command_credits(&self, count: usize) -> usize {
        self.commands.release(count)
    }

    /// Restore the single outstanding-command credit after a controller reset
    pub fn reset_commands(&self) {
        self.commands.reset(1);
    }

    /// Start tracking a connection handle
    pub fn register_link(&self, handle: u16, class: LinkClass) {
        let mut links = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        links.insert(handle, (class, 0));
    }

    /// Stop tracking a connection; its in-flight packets are returned to the pool
    pub fn unregister_link(&self, handle: u16) {
        let removed = {
            let mut links = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            links.remove(&handle)
        };
        if let Some((class, pending)) = removed {
            if pending > 0 {
                self.pool(class).release(pending);
            }
        }
    }

    pub fn link_class(&self, handle: u16) -> Option<LinkClass> {
        let links = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        links.get(&handle).map(|(class, _)| *class)
    }

    /// Take a data credit for a registered connection
    pub fn acquire_data_credit(&self, handle: u16, timeout: Option<Duration>) -> Result<LinkClass> {
        let class = self
            .link_class(handle)
            .ok_or(HciError::Precondition("unknown connection handle"))?;
        self.pool(class).acquire(timeout, 0)?;

        let mut links = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        match links.get_mut(&handle) {
            Some((_, pending)) => *pending += 1,
            None => {
                // Disconnected while we were waiting
                drop(links);
                self.pool(class).release(1);
                return Err(HciError::Precondition("connection closed"));
            }
        }
        Ok(class)
    }

    /// Return a data credit taken for `handle` that was never sent
    pub fn cancel_data_credit(&self, handle: u16) {
        let class = {
            let mut links = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match links.get_mut(&handle) {
                Some((class, pending)) if *pending > 0 => {
                    *pending -= 1;
                    *class
                }
                _ => return,
            }
        };
        self.pool(class).release(1);
    }

    /// Apply one Number Of Completed Packets entry
    ///
    /// Only packets actually in flight on `handle` are returned to its pool.
    pub fn release_data_credits(&self, handle: u16, count: usize) -> usize {
        let (class, completed) = {
            let mut links = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match links.get_mut(&handle) {
                Some((class, pending)) => {
                    if count > *pending {
                        warn!(
                            "handle 0x{:04x}: {} packets completed but {} in flight",
                            handle, count, pending
                        );
                    }
                    let completed = count.min(*pending);
                    *pending -= completed;
                    (*class, completed)
                }
                None => {
                    warn!("completed packets for unknown handle 0x{:04x}", handle);
                    return 0;
                }
            }
        };
        if completed == 0 {
            return 0;
        }
        self.pool(class).release(completed)
    }
}
