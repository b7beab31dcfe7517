//! Blocking wait for the scheduler thread while no vCPU can make progress (`halt_cond`).

use std::sync::{Condvar, Mutex, PoisonError};

/// Wake counter + condition variable.
///
/// Anything that can make a vCPU runnable must first change that state and then call
/// [`notify`](IdleCoordinator::notify). The waiter evaluates its idle predicate while holding the
/// coordinator lock, so a notification can't slip in between the check and the wait.
#[derive(Debug, Default)]
pub struct IdleCoordinator {
    epoch: Mutex<u64>,
    cond: Condvar,
}

impl IdleCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        *epoch = epoch.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Block while `idle()` holds. `on_idle` runs (under the lock) each time the predicate is
    /// observed true, before blocking.
    ///
    /// Returns the number of times the thread actually blocked.
    pub fn wait_while(&self, mut idle: impl FnMut() -> bool, mut on_idle: impl FnMut()) -> usize {
        let mut blocked = 0;
        let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        while idle() {
            on_idle();
            let seen = *epoch;
            while *epoch == seen {
                epoch = self
                    .cond
                    .wait(epoch)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            blocked += 1;
        }
        blocked
    }
}
