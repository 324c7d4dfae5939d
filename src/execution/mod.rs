//! Execution engine: per-step attempt loop and the run-level DAG driver.

pub mod error;
pub mod run_executor;
pub mod step_executor;

pub use error::ExecutionError;
pub use run_executor::{RunExecutor, RunOptions, RunOutcome};
pub use step_executor::{calculate_backoff, StepExecutor, BACKOFF_BASE_SECS, BACKOFF_CAP_SECS};
