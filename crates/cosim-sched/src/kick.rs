//! vCPU kick timer.
//!
//! The kick timer moves single-threaded vCPU emulation on to the next vCPU. While more than one
//! vCPU is live and not everything is idle, a recurring deadline forces an exit request on the
//! vCPU currently recorded as running, so the scheduler can move on.
//!
//! The timer is removed while all vCPUs are idle and restarted once idleness is over.

use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::clock::VirtualClock;
use crate::cpu::CpuIndex;
use crate::roster::Roster;

const NO_CPU: u64 = 0;

/// The "currently executing vCPU" slot shared with the kick path (`rr_current_cpu`).
///
/// Stores an index rather than a pointer: the kick resolves it through the roster, so a vCPU
/// destroyed between the read and the kick simply isn't found.
#[derive(Debug, Default)]
pub struct CurrentCpu(AtomicU64);

impl CurrentCpu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<CpuIndex> {
        match self.0.load(Ordering::Acquire) {
            NO_CPU => None,
            // Encoded as index + 1 and written only from a `CpuIndex`.
            encoded => CpuIndex::try_from(encoded - 1).ok(),
        }
    }

    /// Record `cpu` as running, with a full barrier, before the scheduler evaluates `can_run`.
    pub fn set(&self, cpu: CpuIndex) {
        self.0.store(u64::from(cpu) + 1, Ordering::SeqCst);
    }

    /// Clear the slot. No barrier needed: a spurious kick of the next vCPU is harmless.
    pub fn clear(&self) {
        self.0.store(NO_CPU, Ordering::Release);
    }
}

/// Force the recorded vCPU to exit its slice (`rr_kick_next_cpu`).
///
/// Re-reads the slot after each kick and retries until it observes a stable value, so a vCPU
/// switch racing with the kick is never missed.
pub fn kick_current_cpu(current: &CurrentCpu, roster: &Roster) {
    loop {
        let cpu = current.get();
        if let Some(index) = cpu {
            if let Some(vcpu) = roster.get(index) {
                vcpu.kick();
            }
        }
        // Finish kicking this vCPU before reading again.
        fence(Ordering::SeqCst);
        if cpu == current.get() {
            return;
        }
    }
}

/// Kick every vCPU (`rr_kick_vcpu_thread`).
pub fn kick_all_cpus(roster: &Roster) {
    roster.for_each_cpu(|cpu| cpu.kick());
}

/// Arm bookkeeping shared by the timer and its expiry callback.
#[derive(Debug, Default)]
struct ArmState {
    armed: bool,
    /// Bumped on every disarm. A callback scheduled under an older epoch must not re-arm.
    epoch: u64,
}

struct KickShared {
    clock: Arc<dyn VirtualClock>,
    period_ns: u64,
    current: Arc<CurrentCpu>,
    roster: Arc<Roster>,
    state: Mutex<ArmState>,
}

impl KickShared {
    fn lock(&self) -> MutexGuard<'_, ArmState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put the next deadline in the clock slot. Callers hold the arm state lock.
    fn schedule_next(self: &Arc<Self>, epoch: u64) {
        let deadline = self.clock.now_ns().saturating_add(self.period_ns);
        // Weak handle: the clock owns the callback, so a strong one would form a cycle.
        let weak: Weak<KickShared> = Arc::downgrade(self);
        self.clock.schedule_at(
            deadline,
            Arc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_fire(epoch);
                }
            }),
        );
    }

    /// Timer expiry: re-arm first, then kick whoever is running.
    ///
    /// An expiry that raced with `disarm` finds a newer epoch and does neither.
    fn on_fire(self: &Arc<Self>, epoch: u64) {
        {
            let state = self.lock();
            if !state.armed || state.epoch != epoch {
                tracing::trace!(epoch, "stale kick timer expiry dropped");
                return;
            }
            self.schedule_next(epoch);
        }
        tracing::trace!(cpu = ?self.current.get(), "kick timer fired");
        kick_current_cpu(&self.current, &self.roster);
    }
}

pub struct KickTimer {
    shared: Arc<KickShared>,
}

impl KickTimer {
    pub fn new(
        clock: Arc<dyn VirtualClock>,
        period_ns: u64,
        current: Arc<CurrentCpu>,
        roster: Arc<Roster>,
    ) -> Self {
        Self {
            shared: Arc::new(KickShared {
                clock,
                period_ns,
                current,
                roster,
                state: Mutex::new(ArmState::default()),
            }),
        }
    }

    pub fn period_ns(&self) -> u64 {
        self.shared.period_ns
    }

    pub fn is_armed(&self) -> bool {
        self.shared.lock().armed
    }

    /// Arm the timer at `now + period`. No-op if already armed.
    ///
    /// Returns `true` if this call armed it.
    pub fn arm(&self) -> bool {
        let mut state = self.shared.lock();
        if state.armed {
            return false;
        }
        state.armed = true;
        self.shared.schedule_next(state.epoch);
        true
    }

    /// Cancel the pending deadline and invalidate any expiry already in flight.
    ///
    /// Returns `true` if the timer was armed.
    pub fn disarm(&self) -> bool {
        let mut state = self.shared.lock();
        if !state.armed {
            return false;
        }
        state.armed = false;
        state.epoch = state.epoch.wrapping_add(1);
        self.shared.clock.cancel_scheduled();
        true
    }
}
