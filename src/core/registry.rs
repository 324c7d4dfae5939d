//! Pipeline registry
//!
//! In-process catalogue of validated pipeline definitions keyed by name.
//! Loaded once at startup; safe under concurrent readers afterwards.

use crate::core::pipeline::{PipelineDefinition, ValidationError};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Case-sensitive name → definition mapping.
#[derive(Debug, Default)]
pub struct PipelineRegistry {
    inner: RwLock<HashMap<String, Arc<PipelineDefinition>>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a validated definition.
    ///
    /// Rejects duplicates and invalid definitions; on rejection the
    /// registry is unchanged.
    pub fn register(&self, definition: PipelineDefinition) -> Result<(), ValidationError> {
        definition.validate()?;

        let mut map = self.write();
        if map.contains_key(&definition.name) {
            return Err(ValidationError::DuplicatePipeline(definition.name));
        }
        debug!(pipeline = %definition.name, steps = definition.steps.len(), "registered pipeline");
        map.insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<PipelineDefinition>> {
        self.read().get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Registered pipeline names, sorted for stable output.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.write().remove(name).is_some()
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<PipelineDefinition>>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<PipelineDefinition>>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}
