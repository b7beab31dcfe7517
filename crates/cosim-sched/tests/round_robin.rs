use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use cosim_sched::{
    CpuIndex, Machine, ManualClock, RecordingTrace, SchedEvent, SchedTrace, Scheduler,
    SchedulerConfig, SchedulerHandle, SliceExit, Vcpu, VirtualClock,
};
use pretty_assertions::assert_eq;

/// Runs one instruction per slice; optionally halts after each slice and shuts the machine down
/// after a fixed number of slices.
struct CountingMachine {
    handle: SchedulerHandle,
    slices: usize,
    shutdown_after: Option<usize>,
    halt_after_slice: bool,
    destroyed: Vec<CpuIndex>,
}

impl CountingMachine {
    fn new(handle: &SchedulerHandle) -> Self {
        Self {
            handle: handle.clone(),
            slices: 0,
            shutdown_after: None,
            halt_after_slice: false,
            destroyed: Vec::new(),
        }
    }
}

impl Machine for CountingMachine {
    fn execute_slice(&mut self, cpu: &Vcpu, _budget: u64) -> SliceExit {
        self.slices += 1;
        cpu.set_pc(cpu.pc() + 4);
        if self.halt_after_slice {
            cpu.set_halted(true);
        }
        if self.shutdown_after == Some(self.slices) {
            self.handle.request_shutdown();
        }
        cpu.exit_request().take();
        SliceExit::Normal
    }

    fn handle_lockstep(&mut self, _cpu: &Vcpu) {}

    fn exec_step_atomic(&mut self, _cpu: &Vcpu) {}

    fn destroy_cpu(&mut self, cpu: &Vcpu) {
        assert!(
            cpu.stop_requested() || cpu.is_stopped() || !self.can_run(cpu),
            "destroyed a runnable vCPU"
        );
        self.destroyed.push(cpu.index());
    }
}

fn selects(events: &[SchedEvent]) -> Vec<CpuIndex> {
    events
        .iter()
        .filter_map(|event| match event {
            SchedEvent::Select(cpu) => Some(*cpu),
            _ => None,
        })
        .collect()
}

fn wait_for(trace: &RecordingTrace, what: &str, cond: impl Fn(&[SchedEvent]) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond(&trace.events()) {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn each_pass_visits_every_runnable_cpu_once_in_roster_order() {
    let handle = SchedulerHandle::new();
    for _ in 0..4 {
        handle.add_cpu(0x8000_0000);
    }
    handle.start();

    let mut machine = CountingMachine::new(&handle);
    machine.shutdown_after = Some(20);
    let trace = RecordingTrace::new();
    let mut sched = Scheduler::new(
        &handle,
        machine,
        SchedulerConfig::default(),
        Arc::new(ManualClock::new()),
    )
    .with_trace(trace.clone());

    sched.run().unwrap();

    let expected: Vec<CpuIndex> = (0..5).flat_map(|_| 0..4).collect();
    assert_eq!(selects(&trace.events()), expected);
    for cpu in handle.roster().snapshot() {
        assert_eq!(cpu.pc(), 0x8000_0000 + 5 * 4);
    }
}

#[test]
fn stopped_and_unplugged_cpu_is_swept_after_the_pass() {
    let handle = SchedulerHandle::new();
    for _ in 0..3 {
        handle.add_cpu(0);
    }
    handle.start();
    handle.request_unplug(2).unwrap();

    let mut machine = CountingMachine::new(&handle);
    machine.shutdown_after = Some(2);
    let trace = RecordingTrace::new();
    let mut sched = Scheduler::new(
        &handle,
        machine,
        SchedulerConfig::lockstep(),
        Arc::new(ManualClock::new()),
    )
    .with_trace(trace.clone());
    let generation = handle.roster().generation();

    sched.run().unwrap();

    assert_eq!(
        trace.events(),
        vec![
            SchedEvent::KickArmed,
            SchedEvent::Select(0),
            SchedEvent::Run { cpu: 0, budget: 1 },
            SchedEvent::Exit {
                cpu: 0,
                exit: SliceExit::Normal
            },
            SchedEvent::Select(1),
            SchedEvent::Run { cpu: 1, budget: 1 },
            SchedEvent::Exit {
                cpu: 1,
                exit: SliceExit::Normal
            },
            SchedEvent::Unplugged(2),
        ]
    );
    assert_eq!(handle.roster().generation(), generation + 1);
    assert_eq!(handle.roster().len(), 2);
    assert_eq!(sched.machine().destroyed, vec![2]);
}

#[test]
fn idle_wait_disarms_kick_and_wake_rearms_once() {
    let handle = SchedulerHandle::new();
    for _ in 0..2 {
        let cpu = handle.add_cpu(0);
        cpu.set_halted(true);
    }
    handle.start();

    let clock = Arc::new(ManualClock::new());
    let mut machine = CountingMachine::new(&handle);
    machine.halt_after_slice = true;
    let trace = RecordingTrace::new();
    let dyn_clock: Arc<dyn VirtualClock> = clock.clone();
    let sched = Scheduler::new(&handle, machine, SchedulerConfig::default(), dyn_clock)
        .with_trace(trace.clone());
    let thread = sched.spawn().unwrap();

    wait_for(&trace, "first idle wait", |events| {
        events.contains(&SchedEvent::IdleWait)
    });
    assert!(!clock.is_scheduled());

    handle.wake_cpu(0).unwrap();
    let idle_waits = |events: &[SchedEvent]| {
        events
            .iter()
            .filter(|event| **event == SchedEvent::IdleWait)
            .count()
    };
    wait_for(&trace, "second idle wait", |events| idle_waits(events) == 2);
    assert!(!clock.is_scheduled());

    handle.request_shutdown();
    let machine = thread.join().unwrap().unwrap();
    assert_eq!(machine.slices, 1);

    assert_eq!(
        trace.events(),
        vec![
            SchedEvent::KickArmed,
            SchedEvent::KickDisarmed,
            SchedEvent::IdleWait,
            SchedEvent::Wake,
            SchedEvent::KickArmed,
            SchedEvent::Select(0),
            SchedEvent::Run {
                cpu: 0,
                budget: u64::MAX
            },
            SchedEvent::Exit {
                cpu: 0,
                exit: SliceExit::Normal
            },
            SchedEvent::KickDisarmed,
            SchedEvent::IdleWait,
            SchedEvent::Wake,
        ]
    );
}

#[test]
fn cpu_unplugged_mid_run_never_runs_again() {
    struct UnplugOnFirstSlice {
        inner: CountingMachine,
        ran: Vec<CpuIndex>,
    }

    impl Machine for UnplugOnFirstSlice {
        fn execute_slice(&mut self, cpu: &Vcpu, budget: u64) -> SliceExit {
            self.ran.push(cpu.index());
            if self.ran.len() == 2 {
                self.inner.handle.request_unplug(1).unwrap();
            }
            self.inner.execute_slice(cpu, budget)
        }

        fn handle_lockstep(&mut self, _cpu: &Vcpu) {}

        fn exec_step_atomic(&mut self, _cpu: &Vcpu) {}

        fn destroy_cpu(&mut self, cpu: &Vcpu) {
            self.inner.destroy_cpu(cpu);
        }
    }

    let handle = SchedulerHandle::new();
    for _ in 0..3 {
        handle.add_cpu(0);
    }
    handle.start();

    let mut inner = CountingMachine::new(&handle);
    inner.shutdown_after = Some(8);
    let machine = UnplugOnFirstSlice {
        inner,
        ran: Vec::new(),
    };
    let mut sched = Scheduler::new(
        &handle,
        machine,
        SchedulerConfig::default(),
        Arc::new(ManualClock::new()),
    );
    sched.run().unwrap();

    let machine = sched.into_machine();
    assert_eq!(machine.inner.destroyed, vec![1]);
    assert_eq!(machine.ran, vec![0, 1, 2, 0, 2, 0, 2, 0]);
    assert!(handle.roster().get(1).is_none());
}

#[test]
fn work_queued_from_another_thread_runs_on_the_scheduler_thread() {
    let handle = SchedulerHandle::new();
    let cpu = handle.add_cpu(0);
    cpu.set_halted(true);
    handle.start();

    let sched = Scheduler::new(
        &handle,
        CountingMachine::new(&handle),
        SchedulerConfig::default(),
        Arc::new(ManualClock::new()),
    );
    let thread = sched.spawn().unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    handle
        .queue_work(
            0,
            Box::new(move |cpu: &Vcpu| {
                let name = thread::current().name().map(String::from);
                let _ = tx.send((cpu.index(), name));
            }),
        )
        .unwrap();
    let (index, name) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(index, 0);
    assert_eq!(name.as_deref(), Some("all-vcpus-rr"));

    handle.request_shutdown();
    let machine = thread.join().unwrap().unwrap();
    assert_eq!(machine.slices, 0);
}

/// Counts selections and idle waits only, so a machine that never idles stays cheap to watch.
#[derive(Clone, Default)]
struct PassCounter(Arc<Mutex<(usize, usize)>>);

impl PassCounter {
    fn selects(&self) -> usize {
        self.0.lock().unwrap().0
    }

    fn idle_waits(&self) -> usize {
        self.0.lock().unwrap().1
    }

    fn wait_until(&self, what: &str, cond: impl Fn(&Self) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond(self) {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl SchedTrace for PassCounter {
    fn record(&mut self, event: SchedEvent) {
        let mut counts = self.0.lock().unwrap();
        match event {
            SchedEvent::Select(_) => counts.0 += 1,
            SchedEvent::IdleWait => counts.1 += 1,
            _ => {}
        }
    }
}

#[test]
fn paused_machine_parks_until_started_again() {
    let handle = SchedulerHandle::new();
    handle.add_cpu(0);
    handle.add_cpu(0);
    handle.start();

    let counter = PassCounter::default();
    let sched = Scheduler::new(
        &handle,
        CountingMachine::new(&handle),
        SchedulerConfig::default(),
        Arc::new(ManualClock::new()),
    )
    .with_trace(counter.clone());
    let thread = sched.spawn().unwrap();

    counter.wait_until("first selections", |c| c.selects() > 10);
    assert_eq!(counter.idle_waits(), 0);

    handle.pause();
    counter.wait_until("idle wait after pause", |c| c.idle_waits() == 1);
    let paused_at = counter.selects();
    thread::sleep(Duration::from_millis(20));
    assert_eq!(counter.selects(), paused_at);
    assert!(handle.roster().snapshot().iter().all(|cpu| cpu.is_stopped()));

    handle.start();
    counter.wait_until("selections after resume", |c| c.selects() > paused_at + 10);

    handle.request_shutdown();
    thread.join().unwrap().unwrap();
}

/// Never gives up the CPU on its own: a slice only ends when the exit request arrives.
struct SpinningMachine {
    handle: SchedulerHandle,
    slices: usize,
    shutdown_after: usize,
}

impl Machine for SpinningMachine {
    fn execute_slice(&mut self, cpu: &Vcpu, _budget: u64) -> SliceExit {
        self.slices += 1;
        if self.slices == self.shutdown_after {
            self.handle.request_shutdown();
        }
        while !cpu.exit_request().take() {
            thread::yield_now();
        }
        SliceExit::Normal
    }

    fn handle_lockstep(&mut self, _cpu: &Vcpu) {}

    fn exec_step_atomic(&mut self, _cpu: &Vcpu) {}

    fn destroy_cpu(&mut self, _cpu: &Vcpu) {}
}

#[test]
fn kick_timer_moves_execution_to_the_next_cpu_every_period() {
    let handle = SchedulerHandle::new();
    handle.add_cpu(0);
    handle.add_cpu(0);
    handle.start();

    let config = SchedulerConfig::default();
    let period = config.kick_period_ns;
    let clock = Arc::new(ManualClock::new());
    let machine = SpinningMachine {
        handle: handle.clone(),
        slices: 0,
        shutdown_after: 8,
    };
    let trace = RecordingTrace::new();
    let dyn_clock: Arc<dyn VirtualClock> = clock.clone();
    let sched = Scheduler::new(&handle, machine, config, dyn_clock).with_trace(trace.clone());
    let vcpu_thread = sched.spawn().unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while !handle.is_shutdown_requested() {
        assert!(Instant::now() < deadline, "slices never ended");
        clock.advance(period);
        thread::sleep(Duration::from_millis(2));
    }
    let machine = vcpu_thread.join().unwrap().unwrap();
    assert_eq!(machine.slices, 8);

    let events = trace.events();
    assert_eq!(selects(&events), vec![0, 1, 0, 1, 0, 1, 0, 1]);
    assert!(events.iter().all(|event| match event {
        SchedEvent::Run { budget, .. } => *budget == u64::MAX,
        SchedEvent::Exit { exit, .. } => *exit == SliceExit::Normal,
        _ => true,
    }));
}
