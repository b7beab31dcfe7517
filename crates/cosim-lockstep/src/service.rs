//! The emulator as a statically-typed service.
//!
//! A launcher never looks up symbols: it asks a [`ComponentLoader`] for an [`EmulatorComponent`]
//! described by a JSON manifest, and the manifest must list every entry point the launcher needs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ComponentError, LoadError, LockstepError};
use crate::session::LockstepSession;

/// File name looked up when the component path is a directory.
pub const MANIFEST_FILE_NAME: &str = "cosim-emu.json";

pub const ENTRY_MAIN: &str = "main";
pub const ENTRY_PASS_SYNC: &str = "cosim_pass_sync";
pub const ENTRY_STEP: &str = "cosim_step";

/// Every entry point a lockstep launcher calls.
pub const REQUIRED_ENTRY_POINTS: [&str; 3] = [ENTRY_MAIN, ENTRY_PASS_SYNC, ENTRY_STEP];

pub trait EmulatorComponent: Send + Sync {
    fn name(&self) -> &str;

    /// Run the emulator to completion with a conventional argument vector (`argv[0]` first).
    fn main(&self, argv: &[String]) -> Result<(), ComponentError>;

    /// Hand the shared synchronization state to the emulator before `main` is entered.
    fn pass_sync(&self, session: Arc<LockstepSession>);

    /// Retire exactly one guest instruction. The resulting PC is published through the session.
    fn step(&self) -> Result<(), LockstepError>;
}

pub trait ComponentLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn EmulatorComponent>, LoadError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentManifest {
    /// Registered name of the component implementation.
    pub component: String,
    #[serde(default)]
    pub exports: Vec<String>,
}

impl ComponentManifest {
    /// Read the manifest at `path`, or `path/cosim-emu.json` when `path` is a directory.
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let file = manifest_path(path)?;
        let text = fs::read_to_string(&file).map_err(|err| LoadError::Manifest {
            path: file.clone(),
            message: err.to_string(),
        })?;
        let manifest: Self = serde_json::from_str(&text).map_err(|err| LoadError::Manifest {
            path: file.clone(),
            message: err.to_string(),
        })?;
        tracing::debug!(path = %file.display(), component = %manifest.component, "loaded component manifest");
        Ok(manifest)
    }

    pub fn exports(&self, entry: &str) -> bool {
        self.exports.iter().any(|export| export == entry)
    }

    /// Fail with the first entry point in `entries` that the component doesn't export.
    pub fn require_exports(&self, entries: &[&str]) -> Result<(), LoadError> {
        match entries.iter().find(|entry| !self.exports(entry)) {
            Some(missing) => Err(LoadError::MissingEntryPoint((*missing).to_string())),
            None => Ok(()),
        }
    }
}

fn manifest_path(path: &Path) -> Result<PathBuf, LoadError> {
    if path.is_dir() {
        let file = path.join(MANIFEST_FILE_NAME);
        if file.is_file() {
            return Ok(file);
        }
        return Err(LoadError::NotFound(file));
    }
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    Err(LoadError::NotFound(path.to_path_buf()))
}
