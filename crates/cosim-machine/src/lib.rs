//! Reference guest machine for the round-robin scheduler and the lockstep gateway.
//!
//! [`RefMachine`] implements [`cosim_sched::Machine`] over a tiny word-encoded ISA
//! ([`isa`]); [`RefComponent`] wraps it as a loadable emulator with a QEMU-style command line.

pub mod isa;
mod component;
mod loader;
mod machine;
mod observer;

pub use component::{EmulatorArgs, RefComponent, RunSummary, COMPONENT_NAME};
pub use isa::{GuestImage, ImageError, Insn, RESET_PC};
pub use loader::RefLoader;
pub use machine::RefMachine;
pub use observer::{observer_for_plugin, HartState, InsnEvent, InsnObserver, StateLogger};
