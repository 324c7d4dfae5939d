//! Recovery orchestrator - detects and resumes interrupted runs
//!
//! A run is interrupted when it is still `running` past the staleness
//! threshold: its worker is presumed dead. Recovery finishes such runs
//! without replaying completed work.

use crate::core::{PipelineDefinition, PipelineRegistry, StepResult};
use crate::execution::RunExecutor;
use crate::persistence::{PipelineStore, RunStatus, StepStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// How long a run may sit in `running` before it counts as interrupted.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(600);

/// One interrupted run, as reported by detection.
#[derive(Debug, Clone, Serialize)]
pub struct InterruptedRun {
    pub run_id: Uuid,
    pub pipeline_id: Uuid,
    pub pipeline_name: String,
    pub started_at: DateTime<Utc>,
    /// Most recent timestamp among the run's step rows.
    pub last_step_update: Option<DateTime<Utc>>,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    /// First declared step that is neither completed nor failed.
    pub next_step_to_execute: Option<String>,
}

/// Classification of a run's steps against its declared order.
#[derive(Debug, Clone, Default)]
pub struct StepCompletion {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Declared steps without a terminal row (including rows interrupted
    /// mid-attempt, which are re-executable).
    pub pending: Vec<String>,
    /// Last step in declared order whose row is `success`.
    pub last_completed: Option<String>,
}

/// Structured result of one resume attempt. Refusals are values here, not
/// errors; only storage faults raise.
#[derive(Debug, Clone, Serialize)]
pub struct ResumeOutcome {
    pub success: bool,
    pub error: Option<String>,
    /// Steps driven to a terminal state by this call.
    pub steps_executed: usize,
}

impl ResumeOutcome {
    fn refused(error: impl Into<String>) -> Self {
        ResumeOutcome {
            success: false,
            error: Some(error.into()),
            steps_executed: 0,
        }
    }
}

/// Aggregate result of a recovery sweep.
#[derive(Debug, Default, Serialize)]
pub struct RecoveryReport {
    pub detected: usize,
    pub recovered: usize,
    pub failed: usize,
    pub errors: Vec<RecoveryFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryFailure {
    pub run_id: Uuid,
    pub error: String,
}

/// Detects interrupted runs and resumes them through the run executor.
pub struct RecoveryOrchestrator {
    store: Arc<dyn PipelineStore>,
    registry: Arc<PipelineRegistry>,
    executor: RunExecutor,
    stale_after: Duration,
}

impl RecoveryOrchestrator {
    pub fn new(store: Arc<dyn PipelineStore>, registry: Arc<PipelineRegistry>) -> Self {
        RecoveryOrchestrator {
            executor: RunExecutor::new(store.clone(), registry.clone()),
            store,
            registry,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Scale retry sleeps of resumed executions.
    pub fn with_retry_delay_multiplier(mut self, multiplier: f64) -> Self {
        self.executor = self.executor.with_retry_delay_multiplier(multiplier);
        self
    }

    /// Find runs stuck in `running` past the staleness threshold.
    pub async fn detect_interrupted(&self) -> Result<Vec<InterruptedRun>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.stale_after)
                .context("staleness threshold out of range")?;
        let stuck = self.store.find_stuck_runs(cutoff).await?;

        let mut interrupted = Vec::with_capacity(stuck.len());
        for run in stuck {
            let Some(pipeline) = self.store.find_pipeline(run.pipeline_id).await? else {
                warn!(run_id = %run.id, "stuck run references a missing pipeline row");
                continue;
            };

            let steps = self.store.list_steps(run.id).await?;
            let completed_steps: Vec<String> = steps
                .iter()
                .filter(|s| s.status == StepStatus::Success)
                .map(|s| s.name.clone())
                .collect();
            let failed_steps: Vec<String> = steps
                .iter()
                .filter(|s| s.status == StepStatus::Failed)
                .map(|s| s.name.clone())
                .collect();
            let last_step_update = steps
                .iter()
                .filter_map(|s| s.finished_at.or(s.started_at))
                .max();

            let next_step_to_execute = self.registry.get(&pipeline.name).and_then(|definition| {
                definition
                    .step_names()
                    .into_iter()
                    .find(|name| !completed_steps.contains(name) && !failed_steps.contains(name))
            });

            interrupted.push(InterruptedRun {
                run_id: run.id,
                pipeline_id: run.pipeline_id,
                pipeline_name: pipeline.name,
                started_at: run.started_at,
                last_step_update,
                completed_steps,
                failed_steps,
                next_step_to_execute,
            });
        }

        Ok(interrupted)
    }

    /// Classify a run's step rows against the declared step order.
    pub async fn analyze_step_completion(
        &self,
        run_id: Uuid,
        definition: &PipelineDefinition,
    ) -> Result<StepCompletion> {
        let rows = self.store.list_steps(run_id).await?;
        let by_name: HashMap<&str, StepStatus> =
            rows.iter().map(|s| (s.name.as_str(), s.status)).collect();

        let mut completion = StepCompletion::default();
        for name in definition.step_names() {
            match by_name.get(name.as_str()) {
                Some(StepStatus::Success) => {
                    completion.last_completed = Some(name.clone());
                    completion.completed.push(name);
                }
                Some(StepStatus::Failed) => completion.failed.push(name),
                _ => completion.pending.push(name),
            }
        }
        Ok(completion)
    }

    /// Rebuild the prev-results view of a run from persisted step rows.
    ///
    /// Every completed step contributes a successful result with its
    /// deserialized data; round-trips arbitrary JSON including nulls,
    /// arrays and nested objects.
    pub async fn reconstruct_context(&self, run_id: Uuid) -> Result<HashMap<String, StepResult>> {
        let rows = self.store.list_steps(run_id).await?;
        let mut results = HashMap::new();
        for row in rows {
            if row.status != StepStatus::Success {
                continue;
            }
            let data = row
                .result
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .with_context(|| format!("invalid result JSON for step '{}'", row.name))?;
            results.insert(row.name, StepResult::Success { data });
        }
        Ok(results)
    }

    /// Resume a single run.
    ///
    /// Refuses when the run is missing, has a failed step (manual
    /// intervention required), or its pipeline is unregistered. A run with
    /// every step completed is marked `success` without executing anything.
    pub async fn resume_run(&self, run_id: Uuid) -> Result<ResumeOutcome> {
        let Some(run) = self.store.find_run(run_id).await? else {
            return Ok(ResumeOutcome::refused(format!("run {run_id} not found")));
        };

        let steps = self.store.list_steps(run_id).await?;
        if steps.iter().any(|s| s.status == StepStatus::Failed) {
            return Ok(ResumeOutcome::refused(format!(
                "run {run_id} has failed step(s) and requires manual intervention"
            )));
        }

        let Some(pipeline) = self.store.find_pipeline(run.pipeline_id).await? else {
            return Ok(ResumeOutcome::refused(format!(
                "pipeline {} not found for run {run_id}",
                run.pipeline_id
            )));
        };
        let Some(definition) = self.registry.get(&pipeline.name) else {
            return Ok(ResumeOutcome::refused(format!(
                "pipeline '{}' not found in registry",
                pipeline.name
            )));
        };

        let completion = self.analyze_step_completion(run_id, &definition).await?;
        if completion.pending.is_empty() && completion.failed.is_empty() {
            self.store
                .update_run_status(run_id, RunStatus::Success, Some(Utc::now()))
                .await?;
            info!(run_id = %run_id, "all steps already completed, marked run successful");
            return Ok(ResumeOutcome {
                success: true,
                error: None,
                steps_executed: 0,
            });
        }

        let initial = self.reconstruct_context(run_id).await?;
        let remaining = completion.pending.len();
        info!(
            run_id = %run_id,
            pipeline = %pipeline.name,
            completed = completion.completed.len(),
            remaining,
            "resuming interrupted run"
        );

        match self
            .executor
            .drive_existing_run(&run, &definition, initial)
            .await
        {
            Ok(()) => {
                self.store
                    .update_run_status(run_id, RunStatus::Success, Some(Utc::now()))
                    .await?;
                Ok(ResumeOutcome {
                    success: true,
                    error: None,
                    steps_executed: remaining,
                })
            }
            Err(err) => {
                self.store
                    .update_run_status(run_id, RunStatus::Failed, Some(Utc::now()))
                    .await?;
                let terminal_after = self
                    .store
                    .list_steps(run_id)
                    .await?
                    .iter()
                    .filter(|s| s.status.is_terminal())
                    .count();
                Ok(ResumeOutcome {
                    success: false,
                    error: Some(err.to_string()),
                    steps_executed: terminal_after.saturating_sub(completion.completed.len()),
                })
            }
        }
    }

    /// Detect and resume every interrupted run.
    pub async fn recover_interrupted_runs(&self) -> Result<RecoveryReport> {
        let interrupted = self.detect_interrupted().await?;
        let mut report = RecoveryReport {
            detected: interrupted.len(),
            ..Default::default()
        };

        for candidate in interrupted {
            match self.resume_run(candidate.run_id).await {
                Ok(outcome) if outcome.success => report.recovered += 1,
                Ok(outcome) => {
                    report.failed += 1;
                    report.errors.push(RecoveryFailure {
                        run_id: candidate.run_id,
                        error: outcome
                            .error
                            .unwrap_or_else(|| "resume refused".to_string()),
                    });
                }
                Err(err) => {
                    report.failed += 1;
                    report.errors.push(RecoveryFailure {
                        run_id: candidate.run_id,
                        error: format!("{err:#}"),
                    });
                }
            }
        }

        if report.detected > 0 {
            info!(
                detected = report.detected,
                recovered = report.recovered,
                failed = report.failed,
                "recovery sweep finished"
            );
        }
        Ok(report)
    }
}
