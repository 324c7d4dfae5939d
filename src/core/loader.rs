//! Pipeline loading
//!
//! Handlers are compiled functions, so discovery is a compile-time seam:
//! the composition root supplies a loader, and the worker registers
//! whatever it yields before polling starts.

use crate::core::pipeline::PipelineDefinition;
use crate::core::registry::PipelineRegistry;
use anyhow::Result;
use tracing::info;

/// Source of pipeline definitions to register at startup.
pub trait PipelineLoader: Send + Sync {
    fn load(&self) -> Result<Vec<PipelineDefinition>>;
}

/// Loader over a fixed set of definitions built in code.
pub struct StaticLoader {
    definitions: Vec<PipelineDefinition>,
}

impl StaticLoader {
    pub fn new(definitions: Vec<PipelineDefinition>) -> Self {
        StaticLoader { definitions }
    }
}

impl PipelineLoader for StaticLoader {
    fn load(&self) -> Result<Vec<PipelineDefinition>> {
        Ok(self.definitions.clone())
    }
}

/// Load and register every definition a loader yields.
///
/// Returns the number of pipelines registered. Registration failures abort
/// the load: an invalid definition is a deployment error, not a runtime
/// condition.
pub fn load_pipelines(registry: &PipelineRegistry, loader: &dyn PipelineLoader) -> Result<usize> {
    let definitions = loader.load()?;
    let mut registered = 0;
    for definition in definitions {
        let name = definition.name.clone();
        registry.register(definition)?;
        info!(pipeline = %name, "loaded pipeline");
        registered += 1;
    }
    Ok(registered)
}
