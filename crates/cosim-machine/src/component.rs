//! The reference machine packaged as an [`EmulatorComponent`].

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use cosim_lockstep::{ComponentError, EmulatorComponent, LockstepError, LockstepSession};
use cosim_sched::{HostClock, Scheduler, SchedulerConfig, SchedulerHandle};

use crate::isa::{GuestImage, RESET_PC};
use crate::machine::RefMachine;
use crate::observer::observer_for_plugin;

pub const COMPONENT_NAME: &str = "refmachine";

/// Emulator command line, in the single-dash style launchers pass it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatorArgs {
    pub bios: PathBuf,
    pub smp: u32,
    pub plugins: Vec<String>,
    pub one_insn_per_tb: bool,
    pub log_prefix: Option<String>,
    pub cosim: bool,
}

impl EmulatorArgs {
    /// Parse `argv`, where `argv[0]` is the program name.
    pub fn parse(argv: &[String]) -> Result<Self, ComponentError> {
        let mut bios = None;
        let mut smp = 1;
        let mut plugins = Vec::new();
        let mut one_insn_per_tb = false;
        let mut log_prefix = None;
        let mut cosim = false;

        let mut args = argv.iter().skip(1);
        while let Some(arg) = args.next() {
            let mut value = || {
                args.next()
                    .ok_or_else(|| init_error(format!("option {arg} needs a value")))
            };
            match arg.as_str() {
                "-nographic" => {}
                "-cosim" => cosim = true,
                "-accel" => one_insn_per_tb = parse_accel(value()?)?,
                "-d" => log_prefix = parse_log_items(value()?),
                "-plugin" => plugins.push(value()?.clone()),
                "-machine" => {
                    let machine = value()?;
                    if machine != "virt" {
                        return Err(init_error(format!("unsupported machine {machine:?}")));
                    }
                }
                "-bios" => bios = Some(PathBuf::from(value()?)),
                "-smp" => {
                    let raw = value()?;
                    smp = raw
                        .parse()
                        .ok()
                        .filter(|&n: &u32| n > 0)
                        .ok_or_else(|| init_error(format!("invalid -smp value {raw:?}")))?;
                }
                other => return Err(init_error(format!("unknown option {other:?}"))),
            }
        }

        Ok(Self {
            bios: bios.ok_or_else(|| init_error("no guest image given (-bios)".to_string()))?,
            smp,
            plugins,
            one_insn_per_tb,
            log_prefix,
            cosim,
        })
    }
}

fn init_error(message: String) -> ComponentError {
    ComponentError::Init(message)
}

/// `tcg[,one-insn-per-tb=on|off][,thread=single]`. Returns the one-insn-per-tb setting.
fn parse_accel(accel: &str) -> Result<bool, ComponentError> {
    let mut parts = accel.split(',');
    if parts.next() != Some("tcg") {
        return Err(init_error(format!("unsupported accelerator {accel:?}")));
    }
    let mut one_insn_per_tb = false;
    for part in parts {
        match part.split_once('=') {
            Some(("one-insn-per-tb", "on")) => one_insn_per_tb = true,
            Some(("one-insn-per-tb", "off")) => one_insn_per_tb = false,
            Some(("thread", "single")) => {}
            Some(("thread", other)) => {
                return Err(init_error(format!(
                    "thread={other} is not supported; vCPUs run round-robin on a single thread"
                )))
            }
            _ => return Err(init_error(format!("unknown accelerator option {part:?}"))),
        }
    }
    Ok(one_insn_per_tb)
}

/// `-d` items; only `prefix:<name>` has an effect.
fn parse_log_items(items: &str) -> Option<String> {
    items
        .split(',')
        .find_map(|item| item.strip_prefix("prefix:"))
        .map(str::to_string)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub retired: u64,
    pub memory: u64,
    pub debug_traps: usize,
}

#[derive(Debug, Default)]
pub struct RefComponent {
    session: Mutex<Option<Arc<LockstepSession>>>,
    summary: Mutex<Option<RunSummary>>,
}

impl RefComponent {
    pub fn new() -> Self {
        Self::default()
    }

    fn session(&self) -> Option<Arc<LockstepSession>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Outcome of the last completed `main`.
    pub fn summary(&self) -> Option<RunSummary> {
        *self.summary.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl EmulatorComponent for RefComponent {
    fn name(&self) -> &str {
        COMPONENT_NAME
    }

    fn main(&self, argv: &[String]) -> Result<(), ComponentError> {
        let args = EmulatorArgs::parse(argv)?;
        let span = match &args.log_prefix {
            Some(prefix) => tracing::info_span!("emulator", log = %prefix),
            None => tracing::Span::none(),
        };
        let _enter = span.enter();

        let session = if args.cosim {
            let session = self
                .session()
                .ok_or_else(|| init_error(LockstepError::NotInitialized.to_string()))?;
            Some(session)
        } else {
            None
        };

        let bytes = fs::read(&args.bios).map_err(|err| {
            init_error(format!("cannot read guest image {}: {err}", args.bios.display()))
        })?;
        let image = GuestImage::parse(&bytes)
            .map_err(|err| init_error(format!("{}: {err}", args.bios.display())))?;

        let mut config = SchedulerConfig::from_env().map_err(|err| init_error(err.to_string()))?;
        config.lockstep = args.cosim;
        if args.one_insn_per_tb {
            config.slice_budget = 1;
        }

        let handle = SchedulerHandle::new();
        for _ in 0..args.smp {
            handle.add_cpu(RESET_PC);
        }

        let mut machine = RefMachine::new(Arc::new(image), handle.clone());
        for plugin in &args.plugins {
            if let Some(observer) = observer_for_plugin(plugin)? {
                machine.add_observer(observer);
            }
        }
        if let Some(session) = &session {
            let wake = handle.clone();
            session
                .gateway()
                .set_wake_hook(Arc::new(move || wake.notify()));
            machine = machine.with_lockstep(session.clone());
        }

        let clock = HostClock::new()
            .map_err(|err| init_error(format!("cannot start the virtual clock: {err}")))?;
        let vcpu_thread = Scheduler::new(&handle, machine, config, Arc::new(clock))
            .spawn()
            .map_err(|err| init_error(format!("cannot create the vCPU thread: {err}")))?;

        if let Some(session) = &session {
            session.gateway().open();
        }
        handle.start();

        let machine = match vcpu_thread.join() {
            Ok(Ok(machine)) => machine,
            Ok(Err(err)) => return Err(ComponentError::Runtime(err.to_string())),
            Err(_) => return Err(ComponentError::Runtime("vCPU thread panicked".to_string())),
        };
        let summary = RunSummary {
            retired: machine.retired(),
            memory: machine.memory(),
            debug_traps: machine.debug_traps().len(),
        };
        tracing::info!(retired = summary.retired, "emulator finished");
        *self.summary.lock().unwrap_or_else(PoisonError::into_inner) = Some(summary);
        Ok(())
    }

    fn pass_sync(&self, session: Arc<LockstepSession>) {
        tracing::debug!("synchronization primitives received");
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session);
    }

    fn step(&self) -> Result<(), LockstepError> {
        self.session()
            .ok_or(LockstepError::NotInitialized)?
            .gateway()
            .step()
    }
}
