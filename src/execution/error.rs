//! Execution error taxonomy

use thiserror::Error;

/// Errors surfaced by the step and run executors.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// A step exhausted its retry budget; carries the last attempt error.
    #[error("step '{step}' failed after {attempts} attempt(s): {message}")]
    StepExhausted {
        step: String,
        attempts: u32,
        message: String,
    },

    /// The requested pipeline is not in the registry.
    #[error("pipeline '{0}' is not registered")]
    PipelineNotFound(String),

    /// The DAG loop found no runnable and no in-flight steps before every
    /// step reached a terminal state. Unreachable for graphs accepted at
    /// registration; raised defensively.
    #[error("pipeline execution stalled - possible circular dependency")]
    Stalled,

    #[error(transparent)]
    Validation(#[from] crate::core::ValidationError),

    /// Fault from the persistent store; not retried by the core.
    #[error("storage error: {0:#}")]
    Storage(#[source] anyhow::Error),

    /// A spawned step task could not be joined.
    #[error("step task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ExecutionError {
    pub fn is_step_failure(&self) -> bool {
        matches!(self, ExecutionError::StepExhausted { .. })
    }
}
