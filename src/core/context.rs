//! Execution context - run-scoped results shared between steps

use crate::core::pipeline::StepResult;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Read-only view handed to a step handler on every attempt.
///
/// `prev_results` is a snapshot of the results from steps of this run that
/// had completed when the attempt started.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: Uuid,
    pub pipeline_id: Uuid,
    pub prev_results: HashMap<String, StepResult>,
    /// Opaque user data attached to the run, passed through unchanged.
    pub metadata: Option<Value>,
}

impl StepContext {
    /// Data produced by a previously completed step, if any.
    pub fn prev_data(&self, step: &str) -> Option<&Value> {
        self.prev_results.get(step).and_then(|r| r.data())
    }
}

/// Mutable state of one run, owned by the run executor.
///
/// Handlers never touch this directly; the run executor records results as
/// tasks complete and hands snapshots out via [`StepContext`]. Completion
/// events interleave, hence the guarded map.
#[derive(Debug)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub pipeline_id: Uuid,
    pub metadata: Option<Value>,
    step_results: Mutex<HashMap<String, StepResult>>,
}

impl ExecutionContext {
    pub fn new(run_id: Uuid, pipeline_id: Uuid, metadata: Option<Value>) -> Self {
        Self::with_results(run_id, pipeline_id, metadata, HashMap::new())
    }

    /// Create a context pre-seeded with results, used by recovery to skip
    /// completed steps.
    pub fn with_results(
        run_id: Uuid,
        pipeline_id: Uuid,
        metadata: Option<Value>,
        initial: HashMap<String, StepResult>,
    ) -> Self {
        ExecutionContext {
            run_id,
            pipeline_id,
            metadata,
            step_results: Mutex::new(initial),
        }
    }

    /// Record the result of a completed step.
    pub async fn record(&self, step: &str, result: StepResult) {
        self.step_results
            .lock()
            .await
            .insert(step.to_string(), result);
    }

    /// Snapshot of all recorded results.
    pub async fn results(&self) -> HashMap<String, StepResult> {
        self.step_results.lock().await.clone()
    }

    /// Names of steps with a recorded result.
    pub async fn recorded_steps(&self) -> HashSet<String> {
        self.step_results.lock().await.keys().cloned().collect()
    }

    /// Build the read-only view for a handler attempt.
    pub async fn step_context(&self) -> StepContext {
        StepContext {
            run_id: self.run_id,
            pipeline_id: self.pipeline_id,
            prev_results: self.results().await,
            metadata: self.metadata.clone(),
        }
    }
}
