//! One-shot startup rendezvous between the external driver and the emulator thread.

#[cfg(all(feature = "loom", test))]
use loom::sync::{Condvar, Mutex, MutexGuard};
#[cfg(not(all(feature = "loom", test)))]
use std::sync::{Condvar, Mutex, MutexGuard};

use std::fmt;
use std::sync::PoisonError;

#[derive(Debug, Default)]
struct Arrivals {
    driver: bool,
    emulator: bool,
}

impl Arrivals {
    fn complete(&self) -> bool {
        self.driver && self.emulator
    }
}

/// Each party announces readiness and then waits for the other. Either side may arrive first.
pub struct StartupHandshake {
    arrivals: Mutex<Arrivals>,
    cond: Condvar,
}

impl fmt::Debug for StartupHandshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartupHandshake")
            .field("complete", &self.is_complete())
            .finish()
    }
}

impl Default for StartupHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl StartupHandshake {
    pub fn new() -> Self {
        Self {
            arrivals: Mutex::new(Arrivals::default()),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Arrivals> {
        self.arrivals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn driver_ready_and_wait(&self) {
        self.arrive(|arrivals| arrivals.driver = true);
        tracing::debug!("driver passed the startup handshake");
    }

    pub fn emulator_ready_and_wait(&self) {
        self.arrive(|arrivals| arrivals.emulator = true);
        tracing::debug!("emulator passed the startup handshake");
    }

    pub fn is_complete(&self) -> bool {
        self.lock().complete()
    }

    fn arrive(&self, mark: impl FnOnce(&mut Arrivals)) {
        let mut arrivals = self.lock();
        mark(&mut arrivals);
        self.cond.notify_all();
        while !arrivals.complete() {
            arrivals = self
                .cond
                .wait(arrivals)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}
