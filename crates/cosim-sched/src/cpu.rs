//! Per-vCPU execution context shared between the scheduler thread and the rest of the process.
//!
//! Everything the kick timer or another thread may touch is an atomic or sits behind the work
//! queue lock; the architectural state of the core lives with the machine collaborator.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Identifier of a vCPU. Assigned by the [`Roster`](crate::Roster) and never reused.
pub type CpuIndex = u32;

/// Deferred work executed on the scheduler thread on behalf of one vCPU (`run_on_cpu`).
pub type WorkItem = Box<dyn FnOnce(&Vcpu) + Send>;

/// Cooperative cancellation token for an in-flight slice.
///
/// Setting the token never interrupts a slice directly: the slice primitive polls it at its own
/// checkpoints and returns control to the scheduler when it observes the request.
#[derive(Debug, Default)]
pub struct ExitRequest(AtomicBool);

impl ExitRequest {
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Consume a pending request. Returns whether one was pending.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One virtual core as seen by the scheduler.
pub struct Vcpu {
    index: CpuIndex,
    pc: AtomicU64,
    /// Pending stop request (`cpu->stop`). Processed on the scheduler thread.
    stop: AtomicBool,
    /// The core is paused (`cpu->stopped`).
    stopped: AtomicBool,
    /// The core is waiting for an interrupt/work item (`cpu->halted`).
    halted: AtomicBool,
    unplug: AtomicBool,
    exit_request: ExitRequest,
    work: Mutex<VecDeque<WorkItem>>,
}

impl Vcpu {
    /// Create a context in the stopped state; the machine start releases it.
    pub(crate) fn new(index: CpuIndex, reset_pc: u64) -> Self {
        Self {
            index,
            pc: AtomicU64::new(reset_pc),
            stop: AtomicBool::new(false),
            stopped: AtomicBool::new(true),
            halted: AtomicBool::new(false),
            unplug: AtomicBool::new(false),
            exit_request: ExitRequest::default(),
            work: Mutex::new(VecDeque::new()),
        }
    }

    pub fn index(&self) -> CpuIndex {
        self.index
    }

    pub fn pc(&self) -> u64 {
        self.pc.load(Ordering::Acquire)
    }

    /// Publish the program counter after a slice. Only the scheduler thread writes it.
    pub fn set_pc(&self, pc: u64) {
        self.pc.store(pc, Ordering::Release);
    }

    pub fn exit_request(&self) -> &ExitRequest {
        &self.exit_request
    }

    /// Ask the core to leave its current slice at the next checkpoint (`cpu_exit`).
    pub fn kick(&self) {
        self.exit_request.request();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.kick();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn set_halted(&self, halted: bool) {
        self.halted.store(halted, Ordering::Release);
    }

    pub fn is_unplugging(&self) -> bool {
        self.unplug.load(Ordering::Acquire)
    }

    pub(crate) fn mark_unplug(&self) {
        self.unplug.store(true, Ordering::Release);
        self.request_stop();
    }

    /// Clear both the stop request and the stopped state (`cpu_resume`).
    pub(crate) fn resume(&self) {
        self.stop.store(false, Ordering::Release);
        self.stopped.store(false, Ordering::Release);
    }

    /// Turn a pending stop request into the stopped state. Returns `true` if a request was pending.
    pub(crate) fn acknowledge_stop(&self) -> bool {
        if self.stop.swap(false, Ordering::AcqRel) {
            self.stopped.store(true, Ordering::Release);
            return true;
        }
        false
    }

    pub fn work_list_empty(&self) -> bool {
        self.work.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }

    pub(crate) fn push_work(&self, item: WorkItem) {
        self.work
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(item);
        self.kick();
    }

    /// Run every queued work item. The queue lock is not held while an item runs, so items may
    /// queue further work.
    pub(crate) fn drain_work(&self) -> usize {
        let mut ran = 0;
        loop {
            let item = self
                .work
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            let Some(item) = item else {
                return ran;
            };
            item(self);
            ran += 1;
        }
    }
}

impl fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vcpu")
            .field("index", &self.index)
            .field("pc", &format_args!("{:#x}", self.pc()))
            .field("stop", &self.stop_requested())
            .field("stopped", &self.is_stopped())
            .field("halted", &self.is_halted())
            .field("unplug", &self.is_unplugging())
            .field("exit_request", &self.exit_request.is_requested())
            .finish()
    }
}
