//! Core domain model: pipeline definitions, registry, dependency graph,
//! and the execution context shared by running steps.

pub mod context;
pub mod graph;
pub mod loader;
pub mod pipeline;
pub mod registry;

pub use context::{ExecutionContext, StepContext};
pub use graph::DependencyGraph;
pub use loader::{PipelineLoader, StaticLoader};
pub use pipeline::{
    PipelineDefinition, StepConfig, StepDefinition, StepHandler, StepResult, ValidationError,
    DEFAULT_MAX_RETRIES,
};
pub use registry::PipelineRegistry;
