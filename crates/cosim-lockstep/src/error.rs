use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockstepError {
    /// The emulator side closed the session; no further instruction will be retired.
    #[error("lockstep session closed by the emulator")]
    Closed,
    #[error("co-simulation requested before the driver passed the synchronization primitives")]
    NotInitialized,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("emulator component not found at {0}")]
    NotFound(PathBuf),
    #[error("invalid component manifest {path}: {message}")]
    Manifest { path: PathBuf, message: String },
    #[error("unknown emulator component {0:?}")]
    UnknownComponent(String),
    #[error("emulator component does not export entry point {0:?}")]
    MissingEntryPoint(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComponentError {
    #[error("emulator initialization failed: {0}")]
    Init(String),
    #[error("emulator failed: {0}")]
    Runtime(String),
}
