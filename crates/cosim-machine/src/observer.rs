//! Per-instruction instrumentation hooks (the plugin invocation points).

use std::collections::BTreeMap;
use std::path::Path;

use cosim_lockstep::ComponentError;
use cosim_sched::CpuIndex;

use crate::isa::Insn;

/// Architectural state of one hart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HartState {
    pub pc: u64,
    pub acc: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsnEvent {
    pub cpu: CpuIndex,
    pub insn: Insn,
    pub state: HartState,
}

pub trait InsnObserver: Send {
    /// Called right before `insn` retires, with the state it executes on.
    fn before_insn(&mut self, _event: &InsnEvent) {}

    /// Called right after `insn` retired, with the resulting state.
    fn after_insn(&mut self, _event: &InsnEvent) {}
}

/// Logs every retired instruction together with the register delta it caused.
#[derive(Debug, Default)]
pub struct StateLogger {
    before: BTreeMap<CpuIndex, HartState>,
}

impl StateLogger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InsnObserver for StateLogger {
    fn before_insn(&mut self, event: &InsnEvent) {
        self.before.insert(event.cpu, event.state);
    }

    fn after_insn(&mut self, event: &InsnEvent) {
        let before = self.before.remove(&event.cpu).unwrap_or_default();
        tracing::debug!(
            cpu = event.cpu,
            insn = ?event.insn,
            pc = format_args!("{:#x}", before.pc),
            next_pc = format_args!("{:#x}", event.state.pc),
            acc = event.state.acc,
            acc_delta = event.state.acc.wrapping_sub(before.acc),
            "insn retired"
        );
    }
}

/// Resolve a `-plugin` argument to a built-in observer.
///
/// Only the file stem matters, with an optional `lib` prefix, so `state`, `libcosim_state.so` and
/// `/opt/plugins/libstate.so` all select the state logger.
pub fn observer_for_plugin(plugin: &str) -> Result<Option<Box<dyn InsnObserver>>, ComponentError> {
    let stem = Path::new(plugin)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(plugin);
    let name = stem.strip_prefix("lib").unwrap_or(stem);
    match name {
        "state" | "cosim_state" => Ok(Some(Box::new(StateLogger::new()))),
        "none" => Ok(None),
        _ => Err(ComponentError::Init(format!("unknown plugin {plugin:?}"))),
    }
}
