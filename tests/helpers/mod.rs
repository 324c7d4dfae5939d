//! Shared test utilities: handler builders, seeded stores, harnesses
#![allow(dead_code)]

use anyhow::Result;
use chrono::{DateTime, Utc};
use conveyor::persistence::{
    PipelineRecord, RunRecord, StepRecord, StepStatusUpdate,
};
use conveyor::{
    InMemoryStore, PipelineDefinition, PipelineRegistry, PipelineStore, RunExecutor, RunStatus,
    StepDefinition, StepResult, StepStatus,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Build a store, registry and executor (with retry sleeps collapsed) for
/// one pipeline definition.
pub fn harness(
    definition: PipelineDefinition,
) -> (Arc<InMemoryStore>, Arc<PipelineRegistry>, RunExecutor) {
    let store = Arc::new(InMemoryStore::new());
    let registry = Arc::new(PipelineRegistry::new());
    registry.register(definition).unwrap();
    let executor = RunExecutor::new(store.clone() as Arc<dyn PipelineStore>, registry.clone())
        .with_retry_delay_multiplier(0.0);
    (store, registry, executor)
}

/// Step that immediately succeeds with a JSON value.
pub fn ok_step(name: &str, data: Value) -> StepDefinition {
    StepDefinition::new(name, move |_ctx| {
        let data = data.clone();
        async move { StepResult::ok_with(data) }
    })
}

/// Step that immediately succeeds with no data.
pub fn ok_step_plain(name: &str) -> StepDefinition {
    StepDefinition::new(name, |_ctx| async { StepResult::ok() })
}

/// Step that always fails with the given message.
pub fn failing_step(name: &str, message: &str) -> StepDefinition {
    let message = message.to_string();
    StepDefinition::new(name, move |_ctx| {
        let message = message.clone();
        async move { StepResult::err(message) }
    })
}

/// Step that fails the first `failures` attempts, then succeeds. Returns
/// the invocation counter alongside.
pub fn flaky_step(name: &str, failures: u32) -> (StepDefinition, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let step = StepDefinition::new(name, move |_ctx| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < failures {
                StepResult::err("transient failure")
            } else {
                StepResult::ok()
            }
        }
    });
    (step, calls)
}

/// Step that sleeps before succeeding, for overlap assertions.
pub fn sleeping_step(name: &str, sleep: Duration) -> StepDefinition {
    StepDefinition::new(name, move |_ctx| async move {
        tokio::time::sleep(sleep).await;
        StepResult::ok_with(Value::String("done".to_string()))
    })
}

/// Create a pipeline row plus one run stuck in `running`, back-dated by
/// `age_minutes` so it falls inside the recovery window.
pub async fn seed_interrupted_run(
    store: &InMemoryStore,
    pipeline_name: &str,
    age_minutes: i64,
) -> RunRecord {
    let pipeline = store
        .create_pipeline_if_absent(pipeline_name, None, None)
        .await
        .unwrap();
    let run = store.create_run(pipeline.id, None, None).await.unwrap();
    store
        .update_run_status(run.id, RunStatus::Running, None)
        .await
        .unwrap();
    store
        .set_run_started_at(run.id, Utc::now() - chrono::Duration::minutes(age_minutes))
        .await
        .unwrap();
    store.find_run(run.id).await.unwrap().unwrap()
}

/// Insert a step row in the given terminal (or stuck) state.
pub async fn seed_step_row(
    store: &InMemoryStore,
    run_id: Uuid,
    name: &str,
    status: StepStatus,
    result: Option<&str>,
    error: Option<&str>,
    attempt_count: u32,
) -> StepRecord {
    let row = store.create_step(run_id, name).await.unwrap();
    let started = Utc::now() - chrono::Duration::minutes(12);
    store
        .update_step_status(
            row.id,
            StepStatusUpdate {
                status,
                started_at: Some(started),
                finished_at: status
                    .is_terminal()
                    .then(|| Utc::now() - chrono::Duration::minutes(11)),
                attempt_count,
                next_retry_at: None,
            },
        )
        .await
        .unwrap();
    store.update_step_result(row.id, result, error).await.unwrap();
    store
        .list_steps(run_id)
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.name == name)
        .unwrap()
}

/// Fetch one step row by name.
pub async fn step_row(store: &InMemoryStore, run_id: Uuid, name: &str) -> Option<StepRecord> {
    store
        .list_steps(run_id)
        .await
        .unwrap()
        .into_iter()
        .find(|s| s.name == name)
}

/// Store wrapper that records every step status transition, so tests can
/// assert on intermediate writes that the final row no longer shows.
pub struct RecordingStore {
    inner: InMemoryStore,
    step_updates: std::sync::Mutex<Vec<(Uuid, StepStatusUpdate)>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        RecordingStore {
            inner: InMemoryStore::new(),
            step_updates: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// All recorded step status updates, in write order.
    pub fn step_updates(&self) -> Vec<(Uuid, StepStatusUpdate)> {
        self.step_updates.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl PipelineStore for RecordingStore {
    async fn find_pipeline_by_name(&self, name: &str) -> Result<Option<PipelineRecord>> {
        self.inner.find_pipeline_by_name(name).await
    }

    async fn find_pipeline(&self, id: Uuid) -> Result<Option<PipelineRecord>> {
        self.inner.find_pipeline(id).await
    }

    async fn create_pipeline_if_absent(
        &self,
        name: &str,
        description: Option<&str>,
        schedule: Option<&str>,
    ) -> Result<PipelineRecord> {
        self.inner
            .create_pipeline_if_absent(name, description, schedule)
            .await
    }

    async fn create_run(
        &self,
        pipeline_id: Uuid,
        triggered_by: Option<&str>,
        metadata: Option<Value>,
    ) -> Result<RunRecord> {
        self.inner.create_run(pipeline_id, triggered_by, metadata).await
    }

    async fn update_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.inner.update_run_status(run_id, status, finished_at).await
    }

    async fn find_run(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        self.inner.find_run(run_id).await
    }

    async fn claim_pending_run(&self) -> Result<Option<(RunRecord, PipelineRecord)>> {
        self.inner.claim_pending_run().await
    }

    async fn find_stuck_runs(&self, older_than: DateTime<Utc>) -> Result<Vec<RunRecord>> {
        self.inner.find_stuck_runs(older_than).await
    }

    async fn find_recent_completed(
        &self,
        limit: usize,
        pipeline: Option<&str>,
    ) -> Result<Vec<(RunRecord, PipelineRecord)>> {
        self.inner.find_recent_completed(limit, pipeline).await
    }

    async fn create_step(&self, run_id: Uuid, name: &str) -> Result<StepRecord> {
        self.inner.create_step(run_id, name).await
    }

    async fn update_step_status(&self, step_id: Uuid, update: StepStatusUpdate) -> Result<()> {
        self.step_updates
            .lock()
            .unwrap()
            .push((step_id, update.clone()));
        self.inner.update_step_status(step_id, update).await
    }

    async fn update_step_result(
        &self,
        step_id: Uuid,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        self.inner.update_step_result(step_id, result, error).await
    }

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepRecord>> {
        self.inner.list_steps(run_id).await
    }
}

/// Assert a run reached the expected terminal status with `finished_at` set.
pub async fn assert_run_terminal(store: &InMemoryStore, run_id: Uuid, expected: RunStatus) {
    let run = store.find_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, expected, "run {run_id} status");
    assert!(
        run.finished_at.is_some(),
        "terminal run {run_id} must have finished_at"
    );
}

/// Results map with a single named entry, for seeding contexts.
pub fn results_with(name: &str, result: StepResult) -> HashMap<String, StepResult> {
    HashMap::from([(name.to_string(), result)])
}
