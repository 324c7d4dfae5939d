//! conveyor - a durable pipeline execution engine
//!
//! Persists, schedules and executes user-defined DAGs of steps with
//! exactly-once-effective progress across worker crashes, per-step retries
//! with exponential backoff, and run history for observation.

pub mod cli;
pub mod core;
pub mod execution;
pub mod metrics;
pub mod persistence;
pub mod recovery;
pub mod worker;

// Re-export commonly used types
pub use crate::core::{
    ExecutionContext, PipelineDefinition, PipelineLoader, PipelineRegistry, StaticLoader,
    StepConfig, StepContext, StepDefinition, StepResult, ValidationError,
};
pub use crate::execution::{
    calculate_backoff, ExecutionError, RunExecutor, RunOptions, RunOutcome, StepExecutor,
};
pub use crate::metrics::{ExecutionMetrics, MetricsSnapshot};
pub use crate::persistence::{
    InMemoryStore, PipelineRecord, PipelineStore, RunRecord, RunStatus, StepRecord, StepStatus,
};
pub use crate::recovery::{RecoveryOrchestrator, RecoveryReport, ResumeOutcome};
pub use crate::worker::{Worker, WorkerConfig};
