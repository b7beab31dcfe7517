//! Step channel: the steady-state single-instruction handover between driver and emulator.
//!
//! The driver bumps `requested` and waits for `completed` to catch up; the emulator retires one
//! instruction, publishes an [`InsnReport`] and bumps `completed`. Both counters live under the
//! gateway lock; mirrors in atomics let the scheduler's idle check ask "is a step pending?"
//! without touching that lock.

#[cfg(all(feature = "loom", test))]
use loom::sync::atomic::{AtomicBool, AtomicU64};
#[cfg(all(feature = "loom", test))]
use loom::sync::{Condvar, Mutex, MutexGuard};
#[cfg(not(all(feature = "loom", test)))]
use std::sync::atomic::{AtomicBool, AtomicU64};
#[cfg(not(all(feature = "loom", test)))]
use std::sync::{Condvar, Mutex, MutexGuard};

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};

use crate::error::LockstepError;
use crate::report::InsnReport;

/// Called with the gateway lock held whenever a new step is requested. Must not call back into
/// the gateway.
pub type WakeHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Default)]
struct StepState {
    requested: u64,
    completed: u64,
    last: InsnReport,
    open: bool,
    closed: bool,
}

pub struct StepGateway {
    state: Mutex<StepState>,
    cond: Condvar,
    requested: AtomicU64,
    completed: AtomicU64,
    closed: AtomicBool,
    wake: Mutex<Option<WakeHook>>,
}

impl fmt::Debug for StepGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepGateway")
            .field("requested", &self.requested.load(Ordering::Acquire))
            .field("completed", &self.completed.load(Ordering::Acquire))
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Default for StepGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl StepGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StepState::default()),
            cond: Condvar::new(),
            requested: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            wake: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StepState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, StepState>) -> MutexGuard<'a, StepState> {
        self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    /// Install the emulator-side wake-up (usually "notify the scheduler's idle coordinator").
    pub fn set_wake_hook(&self, hook: WakeHook) {
        *self.wake.lock().unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    fn wake_emulator(&self) {
        let hook = self
            .wake
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    /// Driver side: request exactly one instruction and block until the emulator retires it.
    ///
    /// The resulting program counter is left in [`last_pc`](Self::last_pc). Blocks until the
    /// emulator has come online. Returns [`LockstepError::Closed`] if the emulator shuts down
    /// cleanly first; a crashed emulator leaves the caller blocked.
    pub fn step(&self) -> Result<(), LockstepError> {
        let mut state = self.lock();
        while !state.open && !state.closed {
            state = self.wait(state);
        }
        if state.closed {
            return Err(LockstepError::Closed);
        }

        state.requested += 1;
        let target = state.requested;
        self.requested.store(target, Ordering::Release);
        tracing::trace!(step = target, "driver requested a step");
        self.wake_emulator();

        while state.completed < target && !state.closed {
            state = self.wait(state);
        }
        if state.completed < target {
            return Err(LockstepError::Closed);
        }
        tracing::trace!(step = target, pc = format_args!("{:#x}", state.last.pc_after), "step done");
        Ok(())
    }

    /// Lock-free check used by the scheduler: has the driver asked for an instruction that has
    /// not been retired yet?
    pub fn step_pending(&self) -> bool {
        self.requested.load(Ordering::Acquire) > self.completed.load(Ordering::Acquire)
    }

    /// Emulator side: publish the retired instruction and release the driver.
    ///
    /// Returns `false` (and publishes nothing) when no step was outstanding.
    pub fn complete_step(&self, report: InsnReport) -> bool {
        let mut state = self.lock();
        if state.completed >= state.requested {
            tracing::warn!(?report, "instruction retired without an outstanding step");
            return false;
        }
        state.last = report;
        state.completed += 1;
        self.completed.store(state.completed, Ordering::Release);
        self.cond.notify_all();
        true
    }

    /// The emulator's vCPU thread is up; `step()` may proceed (`cosim_thread_go`).
    pub fn open(&self) {
        let mut state = self.lock();
        state.open = true;
        self.cond.notify_all();
        tracing::debug!("lockstep step channel open");
    }

    /// Block until the emulator has opened the channel.
    pub fn wait_open(&self) -> Result<(), LockstepError> {
        let mut state = self.lock();
        while !state.open && !state.closed {
            state = self.wait(state);
        }
        if state.open {
            Ok(())
        } else {
            Err(LockstepError::Closed)
        }
    }

    /// Emulator shutdown: fail the outstanding and all future steps.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        self.closed.store(true, Ordering::Release);
        self.cond.notify_all();
        tracing::debug!(completed = state.completed, "lockstep step channel closed");
    }

    pub fn is_running(&self) -> bool {
        let state = self.lock();
        state.open && !state.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn last_report(&self) -> InsnReport {
        self.lock().last
    }

    pub fn last_pc(&self) -> u64 {
        self.last_report().pc_after
    }

    /// Number of steps the emulator has retired.
    pub fn completed_steps(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }
}
