use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use cosim_lockstep::{InsnReport, LockstepSession};
use cosim_sched::{CpuIndex, Machine, SchedulerHandle, SliceExit, Vcpu};

use crate::isa::{word_address, GuestImage, Insn, INSN_BYTES};
use crate::observer::{HartState, InsnEvent, InsnObserver};

#[derive(Debug, Clone, Copy, Default)]
struct Hart {
    state: HartState,
    /// Executed `HALT` (or ran off the image); never runs again.
    finished: bool,
}

enum Outcome {
    Retired,
    Debug,
    AtomicRetry,
    /// Nothing retired; the hart is finished.
    Faulted,
}

/// The reference machine: executes guest slices for the round-robin scheduler.
///
/// Under lockstep (a session is attached) a vCPU only runs while the driver has a step
/// outstanding, every slice is one instruction, and whichever handler retires that instruction
/// completes the step.
pub struct RefMachine {
    image: Arc<GuestImage>,
    handle: SchedulerHandle,
    harts: BTreeMap<CpuIndex, Hart>,
    /// The single shared memory word `AMOADD` operates on.
    memory: u64,
    retired: u64,
    debug_traps: Vec<(CpuIndex, u64)>,
    observers: Vec<Box<dyn InsnObserver>>,
    session: Option<Arc<LockstepSession>>,
    last_report: Option<InsnReport>,
}

impl fmt::Debug for RefMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefMachine")
            .field("harts", &self.harts)
            .field("memory", &self.memory)
            .field("retired", &self.retired)
            .field("lockstep", &self.session.is_some())
            .finish_non_exhaustive()
    }
}

impl RefMachine {
    pub fn new(image: Arc<GuestImage>, handle: SchedulerHandle) -> Self {
        Self {
            image,
            handle,
            harts: BTreeMap::new(),
            memory: 0,
            retired: 0,
            debug_traps: Vec::new(),
            observers: Vec::new(),
            session: None,
            last_report: None,
        }
    }

    pub fn with_lockstep(mut self, session: Arc<LockstepSession>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn add_observer(&mut self, observer: Box<dyn InsnObserver>) {
        self.observers.push(observer);
    }

    pub fn retired(&self) -> u64 {
        self.retired
    }

    pub fn memory(&self) -> u64 {
        self.memory
    }

    pub fn debug_traps(&self) -> &[(CpuIndex, u64)] {
        &self.debug_traps
    }

    pub fn hart_state(&self, cpu: CpuIndex) -> Option<HartState> {
        self.harts.get(&cpu).map(|hart| hart.state)
    }

    fn hart(&mut self, cpu: &Vcpu) -> &mut Hart {
        self.harts.entry(cpu.index()).or_insert_with(|| Hart {
            state: HartState {
                pc: cpu.pc(),
                acc: 0,
            },
            finished: false,
        })
    }

    fn is_finished(&self, cpu: &Vcpu) -> bool {
        self.harts
            .get(&cpu.index())
            .map_or(false, |hart| hart.finished)
    }

    /// Execute the instruction at the hart's PC. Outside `exclusive` mode `AMOADD` asks for a
    /// retry; `EBREAK` always traps.
    fn execute_one(&mut self, cpu: &Vcpu, exclusive: bool) -> Outcome {
        let before = self.hart(cpu).state;
        let Some(insn) = self.image.fetch(before.pc) else {
            tracing::warn!(
                cpu = cpu.index(),
                pc = format_args!("{:#x}", before.pc),
                "fetch outside the guest image; stopping vCPU"
            );
            // No report: an outstanding step goes to the next runnable vCPU, or fails as
            // closed once every vCPU has finished.
            self.finish(cpu);
            return Outcome::Faulted;
        };

        match insn {
            Insn::Ebreak => return Outcome::Debug,
            Insn::AmoAdd(_) if !exclusive => return Outcome::AtomicRetry,
            _ => {}
        }

        let mut after = before;
        after.pc = before.pc + INSN_BYTES;
        match insn {
            Insn::Nop | Insn::Ebreak => {}
            Insn::Addi(imm) => after.acc = before.acc.wrapping_add(u64::from(imm)),
            Insn::Jmp(target) => after.pc = word_address(target),
            Insn::Wfi => cpu.set_halted(true),
            Insn::AmoAdd(imm) => {
                self.memory = self.memory.wrapping_add(u64::from(imm));
                after.acc = self.memory;
            }
            Insn::Halt => self.finish(cpu),
        }
        self.retire(cpu, insn, before, after);
        Outcome::Retired
    }

    fn retire(&mut self, cpu: &Vcpu, insn: Insn, before: HartState, after: HartState) {
        let event = InsnEvent {
            cpu: cpu.index(),
            insn,
            state: before,
        };
        for observer in &mut self.observers {
            observer.before_insn(&event);
        }

        self.hart(cpu).state = after;
        cpu.set_pc(after.pc);
        self.retired += 1;
        self.last_report = Some(InsnReport {
            cpu_index: cpu.index(),
            pc_before: before.pc,
            pc_after: after.pc,
        });

        let event = InsnEvent {
            state: after,
            ..event
        };
        for observer in &mut self.observers {
            observer.after_insn(&event);
        }
    }

    fn finish(&mut self, cpu: &Vcpu) {
        self.hart(cpu).finished = true;
        cpu.set_halted(true);
        tracing::debug!(cpu = cpu.index(), "vCPU halted for good");

        let all_finished = self
            .handle
            .roster()
            .snapshot()
            .iter()
            .all(|cpu| self.is_finished(cpu));
        if all_finished {
            tracing::info!("all vCPUs halted");
            self.handle.request_shutdown();
        }
    }

    /// Hand the instruction just retired to the waiting driver.
    fn complete_step(&mut self) {
        let (Some(session), Some(report)) = (&self.session, self.last_report.take()) else {
            return;
        };
        if session.gateway().complete_step(report) {
            tracing::debug!(
                cpu = report.cpu_index,
                pc = format_args!("{:#x}", report.pc_after),
                "lockstep step completed"
            );
        }
    }
}

impl Machine for RefMachine {
    fn can_run(&self, cpu: &Vcpu) -> bool {
        if cpu.is_halted() || self.is_finished(cpu) {
            return false;
        }
        match &self.session {
            Some(session) => session.gateway().step_pending(),
            None => true,
        }
    }

    fn execute_slice(&mut self, cpu: &Vcpu, budget: u64) -> SliceExit {
        let mut executed = 0;
        while executed < budget {
            if cpu.exit_request().take() || !self.can_run(cpu) {
                break;
            }
            match self.execute_one(cpu, false) {
                Outcome::Retired => {}
                Outcome::Debug => return SliceExit::DebugTrap,
                Outcome::AtomicRetry => return SliceExit::AtomicRetry,
                Outcome::Faulted => break,
            }
            executed += 1;
            if self.session.is_some() {
                return SliceExit::LockstepTrap;
            }
        }
        SliceExit::Normal
    }

    /// No debugger is ever attached: record the breakpoint and step past it.
    fn handle_debug(&mut self, cpu: &Vcpu) {
        let before = self.hart(cpu).state;
        tracing::debug!(
            cpu = cpu.index(),
            pc = format_args!("{:#x}", before.pc),
            "guest breakpoint"
        );
        self.debug_traps.push((cpu.index(), before.pc));
        let after = HartState {
            pc: before.pc + INSN_BYTES,
            ..before
        };
        self.retire(cpu, Insn::Ebreak, before, after);
        self.complete_step();
    }

    fn handle_lockstep(&mut self, _cpu: &Vcpu) {
        self.complete_step();
    }

    fn exec_step_atomic(&mut self, cpu: &Vcpu) {
        match self.execute_one(cpu, true) {
            Outcome::Debug => self.handle_debug(cpu),
            Outcome::Faulted => {}
            Outcome::Retired | Outcome::AtomicRetry => self.complete_step(),
        }
    }

    fn destroy_cpu(&mut self, cpu: &Vcpu) {
        self.harts.remove(&cpu.index());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(insns: impl IntoIterator<Item = Insn>, cpus: usize) -> (SchedulerHandle, RefMachine) {
        let handle = SchedulerHandle::new();
        for _ in 0..cpus {
            handle.add_cpu(crate::RESET_PC);
        }
        handle.start();
        let image = Arc::new(GuestImage::from_insns(insns));
        let machine = RefMachine::new(image, handle.clone());
        (handle, machine)
    }

    #[test]
    fn slice_runs_until_halt() {
        let (handle, mut machine) = machine([Insn::Addi(2), Insn::Addi(3), Insn::Halt], 1);
        let cpu = handle.roster().get(0).unwrap();

        assert_eq!(machine.execute_slice(&cpu, u64::MAX), SliceExit::Normal);
        assert_eq!(machine.retired(), 3);
        assert_eq!(machine.hart_state(0).unwrap().acc, 5);
        assert!(!machine.can_run(&cpu));
        assert!(handle.is_shutdown_requested());
    }

    #[test]
    fn slice_respects_budget_and_exit_request() {
        let (handle, mut machine) = machine([Insn::Addi(1), Insn::Jmp(0)], 1);
        let cpu = handle.roster().get(0).unwrap();

        machine.execute_slice(&cpu, 3);
        assert_eq!(machine.retired(), 3);

        cpu.kick();
        machine.execute_slice(&cpu, 100);
        assert_eq!(machine.retired(), 3);
        assert!(!cpu.exit_request().is_requested());
    }

    #[test]
    fn wfi_halts_until_woken() {
        let (handle, mut machine) = machine([Insn::Wfi, Insn::Halt], 1);
        let cpu = handle.roster().get(0).unwrap();

        machine.execute_slice(&cpu, 10);
        assert_eq!(machine.retired(), 1);
        assert!(!machine.can_run(&cpu));

        cpu.set_halted(false);
        assert!(machine.can_run(&cpu));
    }

    #[test]
    fn atomic_retry_then_exclusive_step() {
        let (handle, mut machine) = machine([Insn::AmoAdd(7), Insn::Halt], 1);
        let cpu = handle.roster().get(0).unwrap();

        assert_eq!(machine.execute_slice(&cpu, 10), SliceExit::AtomicRetry);
        assert_eq!(machine.retired(), 0);
        machine.exec_step_atomic(&cpu);
        assert_eq!(machine.memory(), 7);
        assert_eq!(machine.hart_state(0).unwrap().acc, 7);
        assert_eq!(cpu.pc(), crate::RESET_PC + 4);
    }

    #[test]
    fn breakpoint_is_recorded_and_skipped() {
        let (handle, mut machine) = machine([Insn::Ebreak, Insn::Halt], 1);
        let cpu = handle.roster().get(0).unwrap();

        assert_eq!(machine.execute_slice(&cpu, 10), SliceExit::DebugTrap);
        machine.handle_debug(&cpu);
        assert_eq!(machine.debug_traps(), &[(0, crate::RESET_PC)]);
        assert_eq!(cpu.pc(), crate::RESET_PC + 4);
    }

    #[test]
    fn lockstep_runs_only_with_a_pending_step() {
        let (handle, machine) = machine([Insn::Addi(1), Insn::Halt], 1);
        let session = Arc::new(LockstepSession::new());
        let mut machine = machine.with_lockstep(session.clone());
        let cpu = handle.roster().get(0).unwrap();

        assert!(!machine.can_run(&cpu));
        assert_eq!(machine.execute_slice(&cpu, 1), SliceExit::Normal);
        assert_eq!(machine.retired(), 0);
    }

    #[test]
    fn shutdown_waits_for_every_cpu() {
        let (handle, mut machine) = machine([Insn::Halt], 2);
        let cpu0 = handle.roster().get(0).unwrap();
        let cpu1 = handle.roster().get(1).unwrap();

        machine.execute_slice(&cpu0, 1);
        assert!(!handle.is_shutdown_requested());
        machine.execute_slice(&cpu1, 1);
        assert!(handle.is_shutdown_requested());
    }

    #[test]
    fn running_off_the_image_retires_nothing_and_reports_nothing() {
        let (handle, machine) = machine([Insn::Addi(1)], 1);
        let session = Arc::new(LockstepSession::new());
        let mut machine = machine.with_lockstep(session.clone());
        let cpu = handle.roster().get(0).unwrap();
        session.gateway().open();

        let driver = {
            let session = session.clone();
            std::thread::spawn(move || (session.gateway().step(), session.gateway().step()))
        };
        let mut exits = Vec::new();
        while exits.len() < 2 {
            if session.gateway().step_pending() {
                let exit = machine.execute_slice(&cpu, 1);
                if exit == SliceExit::LockstepTrap {
                    machine.handle_lockstep(&cpu);
                }
                exits.push(exit);
            } else {
                std::thread::yield_now();
            }
        }
        assert_eq!(exits, vec![SliceExit::LockstepTrap, SliceExit::Normal]);
        assert_eq!(machine.retired(), 1);
        assert!(handle.is_shutdown_requested());
        assert_eq!(session.gateway().completed_steps(), 1);

        session.gateway().close();
        let (first, second) = driver.join().unwrap();
        assert_eq!(first, Ok(()));
        assert_eq!(second, Err(cosim_lockstep::LockstepError::Closed));
    }
}
