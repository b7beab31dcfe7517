//! Lockstep co-simulation plumbing shared by the emulator and an external driver.
//!
//! A [`LockstepSession`] bundles two independent channels:
//! - the [`StartupHandshake`], a one-shot rendezvous before steady state;
//! - the [`StepGateway`], where every `step()` retires exactly one guest instruction and
//!   publishes an [`InsnReport`].
//!
//! The emulator itself is reached through the [`EmulatorComponent`] service trait, produced by a
//! [`ComponentLoader`] from a [`ComponentManifest`].

mod error;
mod gateway;
mod handshake;
mod report;
mod service;
mod session;

pub use error::{ComponentError, LoadError, LockstepError};
pub use gateway::{StepGateway, WakeHook};
pub use handshake::StartupHandshake;
pub use report::InsnReport;
pub use service::{
    ComponentLoader, ComponentManifest, EmulatorComponent, ENTRY_MAIN, ENTRY_PASS_SYNC,
    ENTRY_STEP, MANIFEST_FILE_NAME, REQUIRED_ENTRY_POINTS,
};
pub use session::LockstepSession;
