//! Virtual clock abstraction with a single deadline slot.
//!
//! The kick timer only ever needs one pending deadline, so the clock models one timer
//! (`timer_new_ns` + `timer_mod` + `timer_del` + `timer_pending`) rather than a general queue.
//!
//! Two implementations are provided:
//! - [`ManualClock`]: time only moves when the owner calls [`ManualClock::advance`]; due callbacks
//!   run synchronously on the caller's thread. Used by tests.
//! - [`HostClock`]: nanoseconds since construction on the host monotonic clock, with callbacks
//!   delivered from a dedicated dispatch thread.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

pub trait VirtualClock: Send + Sync {
    /// Current virtual time in nanoseconds.
    fn now_ns(&self) -> u64;

    /// Arm (or re-arm) the deadline slot. Replaces any pending deadline.
    fn schedule_at(&self, deadline_ns: u64, callback: TimerCallback);

    /// Drop the pending deadline, if any.
    fn cancel_scheduled(&self);

    fn is_scheduled(&self) -> bool;
}

struct Pending {
    deadline_ns: u64,
    callback: TimerCallback,
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("deadline_ns", &self.deadline_ns)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct ManualState {
    now_ns: u64,
    pending: Option<Pending>,
}

/// Deterministic clock driven by explicit [`advance`](ManualClock::advance) calls.
#[derive(Debug, Default)]
pub struct ManualClock {
    state: Mutex<ManualState>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Move time forward by `delta_ns`, firing the deadline if it becomes due.
    ///
    /// A callback that re-arms the slot for a time still in the past fires again, so a large
    /// advance delivers every intermediate expiry.
    pub fn advance(&self, delta_ns: u64) {
        let target = {
            let mut state = self.lock();
            state.now_ns = state.now_ns.saturating_add(delta_ns);
            state.now_ns
        };

        loop {
            let callback = {
                let mut state = self.lock();
                match &state.pending {
                    Some(pending) if pending.deadline_ns <= target => {
                        state.pending.take().map(|pending| pending.callback)
                    }
                    _ => None,
                }
            };
            let Some(callback) = callback else {
                return;
            };
            // Never hold the state lock across the callback: it usually re-arms the slot.
            callback();
        }
    }

    pub fn pending_deadline(&self) -> Option<u64> {
        self.lock().pending.as_ref().map(|pending| pending.deadline_ns)
    }
}

impl VirtualClock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.lock().now_ns
    }

    fn schedule_at(&self, deadline_ns: u64, callback: TimerCallback) {
        self.lock().pending = Some(Pending {
            deadline_ns,
            callback,
        });
    }

    fn cancel_scheduled(&self) {
        self.lock().pending = None;
    }

    fn is_scheduled(&self) -> bool {
        self.lock().pending.is_some()
    }
}

#[derive(Debug, Default)]
struct HostState {
    pending: Option<Pending>,
    shutdown: bool,
}

#[derive(Debug)]
struct HostShared {
    epoch: Instant,
    state: Mutex<HostState>,
    cond: Condvar,
}

impl HostShared {
    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_ns(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn dispatch(&self) {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return;
            }
            let Some(deadline_ns) = state.pending.as_ref().map(|p| p.deadline_ns) else {
                state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
                continue;
            };

            let now = self.now_ns();
            if deadline_ns > now {
                let timeout = Duration::from_nanos(deadline_ns - now);
                state = self
                    .cond
                    .wait_timeout(state, timeout)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
                continue;
            }

            let Some(pending) = state.pending.take() else {
                continue;
            };
            drop(state);
            (pending.callback)();
            state = self.lock();
        }
    }
}

/// Host-monotonic virtual clock with its own dispatch thread.
#[derive(Debug)]
pub struct HostClock {
    shared: Arc<HostShared>,
    thread: Option<JoinHandle<()>>,
}

impl HostClock {
    pub fn new() -> std::io::Result<Self> {
        let shared = Arc::new(HostShared {
            epoch: Instant::now(),
            state: Mutex::new(HostState::default()),
            cond: Condvar::new(),
        });
        let dispatch = shared.clone();
        let thread = std::thread::Builder::new()
            .name("cosim-clock".to_string())
            .spawn(move || dispatch.dispatch())?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }
}

impl VirtualClock for HostClock {
    fn now_ns(&self) -> u64 {
        self.shared.now_ns()
    }

    fn schedule_at(&self, deadline_ns: u64, callback: TimerCallback) {
        self.shared.lock().pending = Some(Pending {
            deadline_ns,
            callback,
        });
        self.shared.cond.notify_all();
    }

    fn cancel_scheduled(&self) {
        self.shared.lock().pending = None;
        self.shared.cond.notify_all();
    }

    fn is_scheduled(&self) -> bool {
        self.shared.lock().pending.is_some()
    }
}

impl Drop for HostClock {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.cond.notify_all();
        if let Some(thread) = self.thread.take() {
            // The dispatch thread may be the one dropping the last reference (from a callback);
            // joining ourselves would deadlock.
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn manual_clock_fires_only_when_due() {
        let clock = ManualClock::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        clock.schedule_at(
            100,
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        clock.advance(99);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(clock.is_scheduled());

        clock.advance(1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!clock.is_scheduled());
        assert_eq!(clock.now_ns(), 100);
    }

    #[test]
    fn manual_clock_cancel_drops_deadline() {
        let clock = ManualClock::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        clock.schedule_at(
            10,
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        clock.cancel_scheduled();
        clock.cancel_scheduled();
        clock.advance(1_000);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn host_clock_delivers_on_dispatch_thread() {
        let clock = HostClock::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let deadline = clock.now_ns() + 1_000_000;
        clock.schedule_at(
            deadline,
            Arc::new(move || {
                let _ = tx.lock().unwrap().send(std::thread::current().name().map(String::from));
            }),
        );

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("cosim-clock"));
        assert!(!clock.is_scheduled());
    }
}
