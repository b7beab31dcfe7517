//! Round-robin single-threaded vCPU scheduling.
//!
//! All vCPUs of a machine are multiplexed onto one host thread. The [`Scheduler`] walks the
//! [`Roster`] in order, gives each runnable vCPU a bounded slice through the [`Machine`]
//! collaborator, and blocks on the [`IdleCoordinator`] when nothing can run. A [`KickTimer`] bound
//! to a [`VirtualClock`] forces the running vCPU out of its slice once per period so no vCPU can
//! starve the others.

mod clock;
mod config;
mod cpu;
mod error;
mod idle;
mod kick;
mod roster;
mod scheduler;
mod trace;

pub use clock::{HostClock, ManualClock, TimerCallback, VirtualClock};
pub use config::{
    ConfigError, SchedulerConfig, DEFAULT_KICK_PERIOD_NS, ENV_ICOUNT_BUDGET, ENV_KICK_PERIOD_NS,
    ENV_SLICE_BUDGET,
};
pub use cpu::{CpuIndex, ExitRequest, Vcpu, WorkItem};
pub use error::SchedError;
pub use idle::IdleCoordinator;
pub use kick::{kick_all_cpus, kick_current_cpu, CurrentCpu, KickTimer};
pub use roster::{CpuCountCache, Roster};
pub use scheduler::{Machine, Scheduler, SchedulerHandle, SliceExit};
pub use trace::{RecordingTrace, SchedEvent, SchedTrace};
