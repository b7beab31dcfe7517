//! Scheduler decision events.
//!
//! Every event is also emitted through `tracing` at `trace` level; a [`SchedTrace`] sink is only
//! needed when a caller wants to inspect the exact sequence (tests, lockstep diagnostics).

use std::sync::{Arc, Mutex, PoisonError};

use crate::cpu::CpuIndex;
use crate::scheduler::SliceExit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedEvent {
    /// A runnable vCPU was chosen.
    Select(CpuIndex),
    Run { cpu: CpuIndex, budget: u64 },
    Exit { cpu: CpuIndex, exit: SliceExit },
    /// The scheduler thread is about to block because every vCPU is idle.
    IdleWait,
    /// The scheduler thread woke up from an idle wait.
    Wake,
    KickArmed,
    KickDisarmed,
    /// An unplugged vCPU was destroyed by the sweep.
    Unplugged(CpuIndex),
}

pub trait SchedTrace: Send {
    fn record(&mut self, event: SchedEvent);
}

impl SchedTrace for () {
    fn record(&mut self, _event: SchedEvent) {}
}

/// Cloneable in-memory event log.
#[derive(Debug, Clone, Default)]
pub struct RecordingTrace {
    events: Arc<Mutex<Vec<SchedEvent>>>,
}

impl RecordingTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SchedEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn take(&self) -> Vec<SchedEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl SchedTrace for RecordingTrace {
    fn record(&mut self, event: SchedEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
