//! Round-robin vCPU scheduling with a lockstep co-simulation gateway.
//!
//! - [`sched`]: roster, kick timer, idle coordination and the scheduler loop.
//! - [`lockstep`]: startup handshake, step channel and the emulator service interface.
//! - [`machine`]: the reference guest machine and its emulator component.

pub use cosim_lockstep as lockstep;
pub use cosim_machine as machine;
pub use cosim_sched as sched;
