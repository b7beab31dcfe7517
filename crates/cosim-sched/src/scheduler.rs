//! The round-robin scheduler loop and the cross-thread handle used to steer it.
//!
//! In the single-threaded case each vCPU is simulated in turn. Per outer iteration the loop:
//! 1. recomputes the slice budget from the live vCPU count,
//! 2. runs vCPUs in roster order until it reaches the end of the roster, a vCPU with pending
//!    work or an exit request, or a slice exit that needs special handling,
//! 3. blocks while every vCPU is idle (kick timer disarmed meanwhile), then drains per-vCPU
//!    work,
//! 4. destroys unplugged vCPUs that can no longer run.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::clock::VirtualClock;
use crate::config::SchedulerConfig;
use crate::cpu::{CpuIndex, Vcpu, WorkItem};
use crate::error::SchedError;
use crate::idle::IdleCoordinator;
use crate::kick::{kick_all_cpus, CurrentCpu, KickTimer};
use crate::roster::{CpuCountCache, Roster};
use crate::trace::{SchedEvent, SchedTrace};

/// Why a slice returned control to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceExit {
    /// Budget exhausted, exit request observed, or the vCPU halted.
    Normal,
    /// Breakpoint/watchpoint hit; the guest debug stub takes over.
    DebugTrap,
    /// One instruction completed under lockstep co-simulation.
    LockstepTrap,
    /// The instruction must be re-executed exclusively.
    AtomicRetry,
}

/// The machine-side collaborator: executes slices and owns architectural state.
///
/// Stop/stopped/unplug bookkeeping is handled by the scheduler itself; `can_run` only answers
/// whether the core's own state lets it execute (e.g. it isn't halted).
pub trait Machine {
    fn can_run(&self, cpu: &Vcpu) -> bool {
        !cpu.is_halted()
    }

    /// Execute at most `budget` instructions. Must poll [`Vcpu::exit_request`] at its
    /// checkpoints and consume the request when it stops because of it.
    fn execute_slice(&mut self, cpu: &Vcpu, budget: u64) -> SliceExit;

    fn handle_debug(&mut self, cpu: &Vcpu) {
        tracing::debug!(cpu = cpu.index(), "debug trap without a debug stub; ignoring");
    }

    fn handle_lockstep(&mut self, cpu: &Vcpu);

    /// Re-execute the pending instruction with exclusive access to the machine.
    fn exec_step_atomic(&mut self, cpu: &Vcpu);

    fn destroy_cpu(&mut self, cpu: &Vcpu);
}

#[derive(Debug)]
struct SchedShared {
    roster: Arc<Roster>,
    current: Arc<CurrentCpu>,
    idle: IdleCoordinator,
    started: AtomicBool,
    shutdown: AtomicBool,
}

impl SchedShared {
    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Cloneable, thread-safe control surface for a running scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    shared: Arc<SchedShared>,
}

impl Default for SchedulerHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerHandle {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SchedShared {
                roster: Arc::new(Roster::new()),
                current: Arc::new(CurrentCpu::new()),
                idle: IdleCoordinator::new(),
                started: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    pub fn roster(&self) -> &Roster {
        &self.shared.roster
    }

    /// The vCPU whose slice is in flight, if any.
    pub fn current_cpu(&self) -> Option<CpuIndex> {
        self.shared.current.get()
    }

    /// Hot-plug a vCPU. It starts running immediately if the machine has been started.
    pub fn add_cpu(&self, reset_pc: u64) -> Arc<Vcpu> {
        let cpu = self.shared.roster.add(reset_pc);
        if self.shared.started.load(Ordering::Acquire) {
            cpu.resume();
        }
        tracing::debug!(cpu = cpu.index(), "vCPU plugged");
        self.notify();
        cpu
    }

    /// Release every vCPU from the stopped state (machine start / resume).
    pub fn start(&self) {
        self.shared.started.store(true, Ordering::Release);
        self.shared.roster.for_each_cpu(|cpu| cpu.resume());
        tracing::info!(cpus = self.shared.roster.len(), "machine started");
        self.notify();
    }

    /// Ask every vCPU to stop. Takes effect at the scheduler's next idle check.
    pub fn pause(&self) {
        self.shared.started.store(false, Ordering::Release);
        self.shared.roster.for_each_cpu(|cpu| cpu.request_stop());
        self.notify();
    }

    /// Mark a vCPU for removal. It is destroyed once it can no longer run and has drained its
    /// work.
    pub fn request_unplug(&self, index: CpuIndex) -> Result<(), SchedError> {
        let cpu = self
            .shared
            .roster
            .get(index)
            .ok_or(SchedError::UnknownCpu(index))?;
        cpu.mark_unplug();
        tracing::debug!(cpu = index, "vCPU unplug requested");
        self.notify();
        Ok(())
    }

    /// Queue `work` to run on the scheduler thread on behalf of `index` (`run_on_cpu`).
    pub fn queue_work(&self, index: CpuIndex, work: WorkItem) -> Result<(), SchedError> {
        let cpu = self
            .shared
            .roster
            .get(index)
            .ok_or(SchedError::UnknownCpu(index))?;
        cpu.push_work(work);
        self.notify();
        Ok(())
    }

    /// Bring a halted vCPU back to life (interrupt delivery).
    pub fn wake_cpu(&self, index: CpuIndex) -> Result<(), SchedError> {
        self.queue_work(index, Box::new(|cpu: &Vcpu| cpu.set_halted(false)))
    }

    pub fn kick_all(&self) {
        kick_all_cpus(&self.shared.roster);
    }

    /// Wake the scheduler thread so it re-evaluates idleness (`qemu_cpu_kick` on `halt_cond`).
    pub fn notify(&self) {
        self.shared.idle.notify();
    }

    pub fn request_shutdown(&self) {
        if !self.shared.shutdown.swap(true, Ordering::AcqRel) {
            tracing::info!("scheduler shutdown requested");
        }
        self.kick_all();
        self.notify();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shared.shutdown_requested()
    }
}

pub struct Scheduler<M> {
    machine: M,
    config: SchedulerConfig,
    shared: Arc<SchedShared>,
    kick: KickTimer,
    count_cache: CpuCountCache,
    trace: Box<dyn SchedTrace>,
}

impl<M: fmt::Debug> fmt::Debug for Scheduler<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("machine", &self.machine)
            .field("config", &self.config)
            .field("kick_armed", &self.kick.is_armed())
            .finish_non_exhaustive()
    }
}

impl<M: Machine> Scheduler<M> {
    pub fn new(
        handle: &SchedulerHandle,
        machine: M,
        config: SchedulerConfig,
        clock: Arc<dyn VirtualClock>,
    ) -> Self {
        let shared = handle.shared.clone();
        let kick = KickTimer::new(
            clock,
            config.kick_period_ns,
            shared.current.clone(),
            shared.roster.clone(),
        );
        Self {
            machine,
            config,
            shared,
            kick,
            count_cache: CpuCountCache::new(),
            trace: Box::new(()),
        }
    }

    pub fn with_trace(mut self, trace: impl SchedTrace + 'static) -> Self {
        self.trace = Box::new(trace);
        self
    }

    pub fn machine(&self) -> &M {
        &self.machine
    }

    pub fn into_machine(self) -> M {
        self.machine
    }

    pub fn kick_timer(&self) -> &KickTimer {
        &self.kick
    }

    /// Run the scheduler on a dedicated thread shared by all vCPUs.
    pub fn spawn(mut self) -> std::io::Result<JoinHandle<Result<M, SchedError>>>
    where
        M: Send + 'static,
    {
        std::thread::Builder::new()
            .name("all-vcpus-rr".to_string())
            .spawn(move || {
                self.run()?;
                Ok(self.machine)
            })
    }

    /// The scheduler loop. Returns only once shutdown has been requested through the handle.
    pub fn run(&mut self) -> Result<(), SchedError> {
        if self.shared.roster.is_empty() {
            return Err(SchedError::NoCpus);
        }
        tracing::info!(
            cpus = self.shared.roster.len(),
            lockstep = self.config.lockstep,
            "vCPU scheduler thread running"
        );

        self.wait_for_start();
        if self.shared.shutdown_requested() {
            self.kick.disarm();
            return Ok(());
        }

        self.start_kick_timer();

        // Process any pending work before the first slice.
        self.shared
            .roster
            .for_each_cpu(|cpu| wait_io_event_common(cpu));
        let mut cpu = self.shared.roster.first();

        while !self.shared.shutdown_requested() {
            let cpu_count = self.count_cache.count(&self.shared.roster);
            let budget = self.config.slice_budget_for(cpu_count);

            if cpu.is_none() {
                cpu = self.shared.roster.first();
            }
            cpu = self.run_cpus(cpu, budget);

            self.shared.current.clear();
            if let Some(cpu) = &cpu {
                cpu.exit_request().take();
            }

            self.wait_io_event();
            self.deal_with_unplugged_cpus();
        }

        self.kick.disarm();
        tracing::info!("vCPU scheduler thread exiting");
        Ok(())
    }

    /// Wait for the initial kick-off after machine start, servicing queued work meanwhile.
    fn wait_for_start(&mut self) {
        let shared = &self.shared;
        let first_stopped = || {
            shared
                .roster
                .first()
                .map_or(true, |cpu| cpu.is_stopped())
        };
        while !shared.shutdown_requested() && first_stopped() {
            shared.idle.wait_while(
                || {
                    !shared.shutdown_requested()
                        && first_stopped()
                        && shared.roster.snapshot().iter().all(|c| c.work_list_empty())
                },
                || {},
            );
            shared.roster.for_each_cpu(|cpu| wait_io_event_common(cpu));
        }
    }

    /// Inner round-robin pass. Returns where the next pass should resume; `None` means "from the
    /// roster head".
    fn run_cpus(&mut self, start: Option<Arc<Vcpu>>, budget: u64) -> Option<Arc<Vcpu>> {
        let mut cursor = start;
        while let Some(cpu) = cursor {
            if !cpu.work_list_empty() || cpu.exit_request().is_requested() {
                return Some(cpu);
            }

            // Record the running vCPU before evaluating `can_run`, so a kick that lands in
            // between is not lost.
            self.shared.current.set(cpu.index());

            if cpu_can_run(&self.machine, &cpu) {
                self.record(SchedEvent::Select(cpu.index()));
                self.record(SchedEvent::Run {
                    cpu: cpu.index(),
                    budget,
                });
                let exit = self.machine.execute_slice(&cpu, budget);
                self.record(SchedEvent::Exit {
                    cpu: cpu.index(),
                    exit,
                });

                match exit {
                    SliceExit::Normal => {}
                    SliceExit::DebugTrap => {
                        self.machine.handle_debug(&cpu);
                        return None;
                    }
                    SliceExit::LockstepTrap => {
                        self.machine.handle_lockstep(&cpu);
                        return None;
                    }
                    SliceExit::AtomicRetry => {
                        self.machine.exec_step_atomic(&cpu);
                        return None;
                    }
                }
            } else if cpu.stop_requested() {
                if cpu.is_unplugging() {
                    return self.shared.roster.next_after(cpu.index());
                }
                return Some(cpu);
            }

            cursor = self.shared.roster.next_after(cpu.index());
        }
        None
    }

    /// Idle handling (`rr_wait_io_event`): block while every vCPU is idle, then service work.
    fn wait_io_event(&mut self) {
        let Self {
            machine,
            shared,
            kick,
            trace,
            ..
        } = self;
        let machine: &M = machine;

        let blocked = shared.idle.wait_while(
            || !shared.shutdown_requested() && all_cpus_idle(machine, &shared.roster),
            || {
                if kick.disarm() {
                    emit(trace.as_mut(), SchedEvent::KickDisarmed);
                }
                emit(trace.as_mut(), SchedEvent::IdleWait);
            },
        );
        if blocked > 0 {
            self.record(SchedEvent::Wake);
        }

        if !self.shared.shutdown_requested() {
            self.start_kick_timer();
        }
        self.shared
            .roster
            .for_each_cpu(|cpu| wait_io_event_common(cpu));
    }

    /// Destroy vCPUs that have been unplugged and have finished running.
    fn deal_with_unplugged_cpus(&mut self) {
        for cpu in self.shared.roster.snapshot() {
            if !cpu.is_unplugging() || cpu_can_run(&self.machine, &cpu) || !cpu.work_list_empty()
            {
                continue;
            }
            if self.shared.roster.remove(cpu.index()).is_none() {
                continue;
            }
            self.machine.destroy_cpu(&cpu);
            tracing::debug!(cpu = cpu.index(), "unplugged vCPU destroyed");
            self.record(SchedEvent::Unplugged(cpu.index()));
        }
    }

    /// Arm the kick timer when there is someone to kick over to; drop it otherwise.
    fn start_kick_timer(&mut self) {
        let cpu_count = self.count_cache.count(&self.shared.roster);
        if cpu_count >= 2 {
            if self.kick.arm() {
                self.record(SchedEvent::KickArmed);
            }
        } else if self.kick.disarm() {
            self.record(SchedEvent::KickDisarmed);
        }
    }

    fn record(&mut self, event: SchedEvent) {
        emit(self.trace.as_mut(), event);
    }
}

fn emit(trace: &mut dyn SchedTrace, event: SchedEvent) {
    tracing::trace!(?event, "sched");
    trace.record(event);
}

fn cpu_can_run<M: Machine>(machine: &M, cpu: &Vcpu) -> bool {
    !cpu.stop_requested() && !cpu.is_stopped() && machine.can_run(cpu)
}

fn cpu_is_idle<M: Machine>(machine: &M, cpu: &Vcpu) -> bool {
    if cpu.stop_requested() || !cpu.work_list_empty() {
        return false;
    }
    if cpu.is_stopped() {
        return true;
    }
    !machine.can_run(cpu)
}

fn all_cpus_idle<M: Machine>(machine: &M, roster: &Roster) -> bool {
    roster
        .snapshot()
        .iter()
        .all(|cpu| cpu_is_idle(machine, cpu))
}

/// Per-vCPU housekeeping after an idle check: acknowledge stop requests, run queued work.
fn wait_io_event_common(cpu: &Vcpu) {
    if cpu.acknowledge_stop() {
        tracing::debug!(cpu = cpu.index(), "vCPU stopped");
    }
    let ran = cpu.drain_work();
    if ran > 0 {
        tracing::trace!(cpu = cpu.index(), ran, "processed queued vCPU work");
    }
}
