use std::path::Path;
use std::sync::Arc;

use cosim_lockstep::{
    ComponentLoader, ComponentManifest, EmulatorComponent, LoadError, REQUIRED_ENTRY_POINTS,
};

use crate::component::{RefComponent, COMPONENT_NAME};

/// Resolves component manifests to the components built into this crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefLoader;

impl ComponentLoader for RefLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn EmulatorComponent>, LoadError> {
        let manifest = ComponentManifest::load(path)?;
        if manifest.component != COMPONENT_NAME {
            return Err(LoadError::UnknownComponent(manifest.component));
        }
        manifest.require_exports(&REQUIRED_ENTRY_POINTS)?;
        tracing::info!(component = COMPONENT_NAME, path = %path.display(), "emulator component loaded");
        Ok(Arc::new(RefComponent::new()))
    }
}
