//! Run executor - drives a run's dependency graph to completion

use crate::core::{
    DependencyGraph, ExecutionContext, PipelineDefinition, PipelineRegistry, StepResult,
};
use crate::execution::error::ExecutionError;
use crate::execution::step_executor::StepExecutor;
use crate::persistence::{PipelineStore, RunRecord, RunStatus};
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Options for starting a new run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Registered pipeline name.
    pub pipeline: String,
    pub triggered_by: Option<String>,
    /// Opaque user data stored on the run and exposed to handlers.
    pub metadata: Option<Value>,
}

impl RunOptions {
    pub fn new(pipeline: impl Into<String>) -> Self {
        RunOptions {
            pipeline: pipeline.into(),
            triggered_by: None,
            metadata: None,
        }
    }

    pub fn triggered_by(mut self, by: impl Into<String>) -> Self {
        self.triggered_by = Some(by.into());
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Result of one [`RunExecutor::execute`] call.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub success: bool,
    /// Results of completed steps keyed by step name.
    pub step_results: HashMap<String, StepResult>,
    /// The first step error when the run failed.
    pub error: Option<String>,
    pub duration: Duration,
}

/// Drives one run at a time: creates or resumes the run record, walks the
/// dependency graph with dependency-driven parallelism and records results.
pub struct RunExecutor {
    store: Arc<dyn PipelineStore>,
    registry: Arc<PipelineRegistry>,
    step_executor: StepExecutor,
}

impl RunExecutor {
    pub fn new(store: Arc<dyn PipelineStore>, registry: Arc<PipelineRegistry>) -> Self {
        RunExecutor {
            step_executor: StepExecutor::new(store.clone()),
            store,
            registry,
        }
    }

    /// Scale retry sleeps; forwarded to the step executor.
    pub fn with_retry_delay_multiplier(mut self, multiplier: f64) -> Self {
        self.step_executor = self.step_executor.with_retry_delay_multiplier(multiplier);
        self
    }

    /// Create and execute a new run of a registered pipeline.
    ///
    /// Step failures are reported in the returned outcome; only registry
    /// misses and storage faults are raised.
    pub async fn execute(&self, options: RunOptions) -> Result<RunOutcome, ExecutionError> {
        let definition = self
            .registry
            .get(&options.pipeline)
            .ok_or_else(|| ExecutionError::PipelineNotFound(options.pipeline.clone()))?;

        let pipeline = self
            .store
            .create_pipeline_if_absent(
                &definition.name,
                definition.description.as_deref(),
                definition.schedule.as_deref(),
            )
            .await
            .map_err(ExecutionError::Storage)?;

        let run = self
            .store
            .create_run(
                pipeline.id,
                options.triggered_by.as_deref(),
                options.metadata.clone(),
            )
            .await
            .map_err(ExecutionError::Storage)?;
        self.store
            .update_run_status(run.id, RunStatus::Running, None)
            .await
            .map_err(ExecutionError::Storage)?;

        info!(run_id = %run.id, pipeline = %definition.name, "starting run");
        let started = Instant::now();
        let ctx = Arc::new(ExecutionContext::new(
            run.id,
            pipeline.id,
            options.metadata.clone(),
        ));

        let drive_result = self.drive(&definition, ctx.clone()).await;
        let duration = started.elapsed();
        let step_results = ctx.results().await;

        match drive_result {
            Ok(()) => {
                self.store
                    .update_run_status(run.id, RunStatus::Success, Some(Utc::now()))
                    .await
                    .map_err(ExecutionError::Storage)?;
                info!(run_id = %run.id, duration_ms = duration.as_millis() as u64, "run succeeded");
                Ok(RunOutcome {
                    run_id: run.id,
                    success: true,
                    step_results,
                    error: None,
                    duration,
                })
            }
            Err(err) => {
                self.store
                    .update_run_status(run.id, RunStatus::Failed, Some(Utc::now()))
                    .await
                    .map_err(ExecutionError::Storage)?;
                warn!(run_id = %run.id, error = %err, "run failed");
                Ok(RunOutcome {
                    run_id: run.id,
                    success: false,
                    step_results,
                    error: Some(err.to_string()),
                    duration,
                })
            }
        }
    }

    /// Drive an already-claimed run to completion.
    ///
    /// The run is assumed to be in `running`; the caller sets the terminal
    /// status. `initial_results` seeds the context so recovery can skip
    /// completed steps.
    pub async fn drive_existing_run(
        &self,
        run: &RunRecord,
        definition: &PipelineDefinition,
        initial_results: HashMap<String, StepResult>,
    ) -> Result<(), ExecutionError> {
        let ctx = Arc::new(ExecutionContext::with_results(
            run.id,
            run.pipeline_id,
            run.metadata.clone(),
            initial_results,
        ));
        self.drive(definition, ctx).await
    }

    /// The DAG loop.
    ///
    /// Launches every step whose dependencies are satisfied, in declaration
    /// order, then waits for the next completion. After the first failure
    /// no new steps start, but in-flight siblings drain naturally so their
    /// persisted rows stay truthful.
    async fn drive(
        &self,
        definition: &PipelineDefinition,
        ctx: Arc<ExecutionContext>,
    ) -> Result<(), ExecutionError> {
        let graph = DependencyGraph::build(&definition.steps)?;
        let total = graph.len();

        let seeded = ctx.recorded_steps().await;
        let mut completed: HashSet<String> = graph
            .order()
            .iter()
            .filter(|name| seeded.contains(*name))
            .cloned()
            .collect();
        let mut failed: HashSet<String> = HashSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut tasks: JoinSet<(String, Result<StepResult, ExecutionError>)> = JoinSet::new();
        let mut first_error: Option<ExecutionError> = None;

        loop {
            if completed.len() + failed.len() >= total {
                break;
            }

            if first_error.is_none() {
                for name in graph.order() {
                    if completed.contains(name)
                        || failed.contains(name)
                        || in_flight.contains(name)
                        || !graph.is_ready(name, &completed)
                    {
                        continue;
                    }
                    let Some(step) = definition.find_step(name) else {
                        continue;
                    };

                    debug!(step = %name, "launching step");
                    let step = step.clone();
                    let executor = self.step_executor.clone();
                    let task_ctx = ctx.clone();
                    let step_name = name.clone();
                    in_flight.insert(name.clone());
                    tasks.spawn(async move {
                        let result = executor.execute_step(&step, &task_ctx).await;
                        (step_name, result)
                    });
                }
            }

            if in_flight.is_empty() {
                // Nothing running and nothing launchable: after a failure
                // the remaining steps are unreachable and the first error
                // is the outcome; otherwise the graph is stuck.
                return match first_error {
                    Some(err) => Err(err),
                    None => Err(ExecutionError::Stalled),
                };
            }

            match tasks.join_next().await {
                Some(Ok((name, Ok(result)))) => {
                    in_flight.remove(&name);
                    ctx.record(&name, result).await;
                    completed.insert(name);
                }
                Some(Ok((name, Err(err)))) => {
                    in_flight.remove(&name);
                    failed.insert(name.clone());
                    if first_error.is_none() {
                        first_error = Some(err);
                    } else {
                        debug!(step = %name, error = %err, "subsequent step failure");
                    }
                }
                Some(Err(join_err)) => return Err(ExecutionError::Join(join_err)),
                None => return Err(ExecutionError::Stalled),
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PipelineRegistry, StepDefinition};
    use crate::persistence::{InMemoryStore, StepStatus};
    use serde_json::json;

    fn harness(definition: PipelineDefinition) -> (Arc<InMemoryStore>, RunExecutor) {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(PipelineRegistry::new());
        registry.register(definition).unwrap();
        let executor = RunExecutor::new(store.clone() as Arc<dyn PipelineStore>, registry)
            .with_retry_delay_multiplier(0.0);
        (store, executor)
    }

    #[tokio::test]
    async fn test_simple_success() {
        let definition = PipelineDefinition::new("greeting")
            .step(StepDefinition::new("greet", |_| async {
                StepResult::ok_with("Hello")
            }));
        let (store, executor) = harness(definition);

        let outcome = executor
            .execute(RunOptions::new("greeting"))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(
            outcome.step_results.get("greet"),
            Some(&StepResult::ok_with("Hello"))
        );

        let run = store.find_run(outcome.run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert!(run.finished_at.is_some());

        let steps = store.list_steps(outcome.run_id).await.unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].status, StepStatus::Success);
        assert_eq!(steps[0].result.as_deref(), Some("\"Hello\""));
        assert_eq!(steps[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn test_unknown_pipeline() {
        let (_, executor) = harness(
            PipelineDefinition::new("known")
                .step(StepDefinition::new("s", |_| async { StepResult::ok() })),
        );
        let err = executor
            .execute(RunOptions::new("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::PipelineNotFound(name) if name == "missing"));
    }

    #[tokio::test]
    async fn test_downstream_sees_upstream_results() {
        let definition = PipelineDefinition::new("chained")
            .step(StepDefinition::new("first", |_| async {
                StepResult::ok_with(json!({"count": 41}))
            }))
            .step(StepDefinition::new("second", |ctx| async move {
                let count = ctx
                    .prev_data("first")
                    .and_then(|v| v["count"].as_i64())
                    .unwrap_or_default();
                StepResult::ok_with(json!(count + 1))
            }));
        let (_, executor) = harness(definition);

        let outcome = executor.execute(RunOptions::new("chained")).await.unwrap();
        assert!(outcome.success);
        assert_eq!(
            outcome.step_results.get("second").and_then(|r| r.data()),
            Some(&json!(42))
        );
    }

    #[tokio::test]
    async fn test_metadata_reaches_handlers() {
        let definition =
            PipelineDefinition::new("meta").step(StepDefinition::new("echo", |ctx| async move {
                match ctx.metadata {
                    Some(metadata) => StepResult::ok_with(metadata),
                    None => StepResult::err("metadata missing"),
                }
            }));
        let (_, executor) = harness(definition);

        let metadata = json!({"tenant": "acme"});
        let outcome = executor
            .execute(RunOptions::new("meta").metadata(metadata.clone()))
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(
            outcome.step_results.get("echo").and_then(|r| r.data()),
            Some(&metadata)
        );
    }
}
