//! Persistence layer: storage port, persisted entities, in-memory store

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteStore;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Failed)
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "pending" => RunStatus::Pending,
            "running" => RunStatus::Running,
            "success" => RunStatus::Success,
            "failed" => RunStatus::Failed,
            other => bail!("unknown run status '{other}'"),
        })
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a step attempt record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Retrying,
    Success,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Retrying => "retrying",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Failed)
    }
}

impl FromStr for StepStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "pending" => StepStatus::Pending,
            "running" => StepStatus::Running,
            "retrying" => StepStatus::Retrying,
            "success" => StepStatus::Success,
            "failed" => StepStatus::Failed,
            other => bail!("unknown step status '{other}'"),
        })
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identity of a workflow; never mutated by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub schedule: Option<String>,
}

/// One attempt at executing a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub status: RunStatus,
    /// Submission time while pending; overwritten with the claim time once
    /// a worker takes ownership.
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub triggered_by: Option<String>,
    /// Opaque user data, passed through unchanged.
    pub metadata: Option<Value>,
}

/// One attempt record for one step of one run; at most one row per
/// (run, step name), updated in place across attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub name: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// JSON-encoded result data; non-null only when status is success.
    pub result: Option<String>,
    /// Last error message; non-null only on failed or retrying.
    pub error: Option<String>,
}

/// Fields written by a step status transition.
#[derive(Debug, Clone, Default)]
pub struct StepStatusUpdate {
    pub status: StepStatus,
    /// Written only when `Some`; an existing value is never cleared.
    pub started_at: Option<DateTime<Utc>>,
    /// Written only when `Some`.
    pub finished_at: Option<DateTime<Utc>>,
    pub attempt_count: u32,
    /// Always overwritten; `None` clears a previously scheduled retry.
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl Default for StepStatus {
    fn default() -> Self {
        StepStatus::Pending
    }
}

/// Typed, transactional operations over pipelines, runs and steps.
///
/// Every operation either completes or raises; rows are never partially
/// updated.
#[async_trait::async_trait]
pub trait PipelineStore: Send + Sync {
    async fn find_pipeline_by_name(&self, name: &str) -> Result<Option<PipelineRecord>>;

    async fn find_pipeline(&self, id: Uuid) -> Result<Option<PipelineRecord>>;

    /// Return the pipeline with this name, creating it if absent.
    async fn create_pipeline_if_absent(
        &self,
        name: &str,
        description: Option<&str>,
        schedule: Option<&str>,
    ) -> Result<PipelineRecord>;

    /// Create a run in `pending` with `started_at` set to now.
    async fn create_run(
        &self,
        pipeline_id: Uuid,
        triggered_by: Option<&str>,
        metadata: Option<Value>,
    ) -> Result<RunRecord>;

    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn find_run(&self, run_id: Uuid) -> Result<Option<RunRecord>>;

    /// Atomically claim the oldest pending run: transition it to `running`
    /// and overwrite `started_at` with the claim time, inside one
    /// transaction. At most one caller ever observes a given run here.
    async fn claim_pending_run(&self) -> Result<Option<(RunRecord, PipelineRecord)>>;

    /// Runs still `running` whose `started_at` is older than the cutoff.
    async fn find_stuck_runs(&self, older_than: DateTime<Utc>) -> Result<Vec<RunRecord>>;

    /// Recently finished runs, newest first.
    async fn find_recent_completed(
        &self,
        limit: usize,
        pipeline: Option<&str>,
    ) -> Result<Vec<(RunRecord, PipelineRecord)>>;

    /// Create a step row in `pending` with `attempt_count = 0`.
    ///
    /// At most one row exists per (run, name); when the row is already
    /// present it is returned unchanged, so a resumed run can continue an
    /// interrupted step's attempt accounting.
    async fn create_step(&self, run_id: Uuid, name: &str) -> Result<StepRecord>;

    async fn update_step_status(&self, step_id: Uuid, update: StepStatusUpdate) -> Result<()>;

    async fn update_step_result(
        &self,
        step_id: Uuid,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<()>;

    /// Steps of a run ordered by `started_at`.
    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepRecord>>;
}

#[derive(Debug, Default)]
struct Tables {
    pipelines: HashMap<Uuid, PipelineRecord>,
    runs: HashMap<Uuid, RunRecord>,
    steps: HashMap<Uuid, StepRecord>,
    /// Step creation order per run, the tie-break for equal start times.
    step_order: HashMap<Uuid, Vec<Uuid>>,
}

/// In-memory store for tests and ephemeral use.
///
/// A single mutex over all tables makes the claim trivially serializable.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: tokio::sync::Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite a run's `started_at`, used by tests to age runs into the
    /// recovery window.
    pub async fn set_run_started_at(&self, run_id: Uuid, started_at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.inner.lock().await;
        match tables.runs.get_mut(&run_id) {
            Some(run) => {
                run.started_at = started_at;
                Ok(())
            }
            None => bail!("run {run_id} not found"),
        }
    }
}

#[async_trait::async_trait]
impl PipelineStore for InMemoryStore {
    async fn find_pipeline_by_name(&self, name: &str) -> Result<Option<PipelineRecord>> {
        let tables = self.inner.lock().await;
        Ok(tables.pipelines.values().find(|p| p.name == name).cloned())
    }

    async fn find_pipeline(&self, id: Uuid) -> Result<Option<PipelineRecord>> {
        let tables = self.inner.lock().await;
        Ok(tables.pipelines.get(&id).cloned())
    }

    async fn create_pipeline_if_absent(
        &self,
        name: &str,
        description: Option<&str>,
        schedule: Option<&str>,
    ) -> Result<PipelineRecord> {
        let mut tables = self.inner.lock().await;
        if let Some(existing) = tables.pipelines.values().find(|p| p.name == name) {
            return Ok(existing.clone());
        }
        let record = PipelineRecord {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: description.map(str::to_string),
            schedule: schedule.map(str::to_string),
        };
        tables.pipelines.insert(record.id, record.clone());
        Ok(record)
    }

    async fn create_run(
        &self,
        pipeline_id: Uuid,
        triggered_by: Option<&str>,
        metadata: Option<Value>,
    ) -> Result<RunRecord> {
        let mut tables = self.inner.lock().await;
        if !tables.pipelines.contains_key(&pipeline_id) {
            bail!("pipeline {pipeline_id} not found");
        }
        let record = RunRecord {
            id: Uuid::new_v4(),
            pipeline_id,
            status: RunStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            triggered_by: triggered_by.map(str::to_string),
            metadata,
        };
        tables.runs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut tables = self.inner.lock().await;
        match tables.runs.get_mut(&run_id) {
            Some(run) => {
                run.status = status;
                if finished_at.is_some() {
                    run.finished_at = finished_at;
                }
                Ok(())
            }
            None => bail!("run {run_id} not found"),
        }
    }

    async fn find_run(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        let tables = self.inner.lock().await;
        Ok(tables.runs.get(&run_id).cloned())
    }

    async fn claim_pending_run(&self) -> Result<Option<(RunRecord, PipelineRecord)>> {
        let mut tables = self.inner.lock().await;
        let oldest = tables
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Pending)
            .min_by_key(|r| (r.started_at, r.id))
            .map(|r| r.id);
        let Some(run_id) = oldest else {
            return Ok(None);
        };

        let run = match tables.runs.get_mut(&run_id) {
            Some(run) => {
                run.status = RunStatus::Running;
                run.started_at = Utc::now();
                run.clone()
            }
            None => return Ok(None),
        };
        let pipeline = match tables.pipelines.get(&run.pipeline_id) {
            Some(p) => p.clone(),
            None => bail!("pipeline {} not found for run {}", run.pipeline_id, run.id),
        };
        Ok(Some((run, pipeline)))
    }

    async fn find_stuck_runs(&self, older_than: DateTime<Utc>) -> Result<Vec<RunRecord>> {
        let tables = self.inner.lock().await;
        let mut stuck: Vec<RunRecord> = tables
            .runs
            .values()
            .filter(|r| r.status == RunStatus::Running && r.started_at < older_than)
            .cloned()
            .collect();
        stuck.sort_by_key(|r| r.started_at);
        Ok(stuck)
    }

    async fn find_recent_completed(
        &self,
        limit: usize,
        pipeline: Option<&str>,
    ) -> Result<Vec<(RunRecord, PipelineRecord)>> {
        let tables = self.inner.lock().await;
        let mut completed: Vec<(RunRecord, PipelineRecord)> = tables
            .runs
            .values()
            .filter(|r| r.status.is_terminal())
            .filter_map(|r| {
                tables
                    .pipelines
                    .get(&r.pipeline_id)
                    .map(|p| (r.clone(), p.clone()))
            })
            .filter(|(_, p)| pipeline.is_none_or(|name| p.name == name))
            .collect();
        completed.sort_by(|a, b| b.0.finished_at.cmp(&a.0.finished_at));
        completed.truncate(limit);
        Ok(completed)
    }

    async fn create_step(&self, run_id: Uuid, name: &str) -> Result<StepRecord> {
        let mut tables = self.inner.lock().await;
        if !tables.runs.contains_key(&run_id) {
            bail!("run {run_id} not found");
        }
        if let Some(existing) = tables
            .steps
            .values()
            .find(|s| s.run_id == run_id && s.name == name)
        {
            return Ok(existing.clone());
        }
        let record = StepRecord {
            id: Uuid::new_v4(),
            run_id,
            name: name.to_string(),
            status: StepStatus::Pending,
            started_at: None,
            finished_at: None,
            attempt_count: 0,
            next_retry_at: None,
            result: None,
            error: None,
        };
        tables.steps.insert(record.id, record.clone());
        tables.step_order.entry(run_id).or_default().push(record.id);
        Ok(record)
    }

    async fn update_step_status(&self, step_id: Uuid, update: StepStatusUpdate) -> Result<()> {
        let mut tables = self.inner.lock().await;
        match tables.steps.get_mut(&step_id) {
            Some(step) => {
                step.status = update.status;
                step.attempt_count = update.attempt_count;
                if update.started_at.is_some() {
                    step.started_at = update.started_at;
                }
                if update.finished_at.is_some() {
                    step.finished_at = update.finished_at;
                }
                step.next_retry_at = update.next_retry_at;
                Ok(())
            }
            None => bail!("step {step_id} not found"),
        }
    }

    async fn update_step_result(
        &self,
        step_id: Uuid,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let mut tables = self.inner.lock().await;
        match tables.steps.get_mut(&step_id) {
            Some(step) => {
                step.result = result.map(str::to_string);
                step.error = error.map(str::to_string);
                Ok(())
            }
            None => bail!("step {step_id} not found"),
        }
    }

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepRecord>> {
        let tables = self.inner.lock().await;
        let mut steps: Vec<StepRecord> = tables
            .step_order
            .get(&run_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.steps.get(id).cloned())
            .collect();
        steps.sort_by_key(|s| s.started_at);
        Ok(steps)
    }
}
