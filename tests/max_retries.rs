//! Retry exhaustion boundaries

mod helpers;

use conveyor::{PipelineDefinition, RunOptions, RunStatus, StepDefinition, StepResult, StepStatus};
use helpers::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Always-failing handler with the default budget: four attempts total,
/// then the step and the run fail.
#[tokio::test]
async fn test_retry_exhaustion() {
    let definition =
        PipelineDefinition::new("doomed").step(failing_step("task", "persistent failure"));
    let (store, _registry, executor) = harness(definition);

    let outcome = executor.execute(RunOptions::new("doomed")).await.unwrap();
    assert!(!outcome.success);
    assert!(outcome
        .error
        .as_deref()
        .unwrap()
        .contains("persistent failure"));

    assert_run_terminal(&store, outcome.run_id, RunStatus::Failed).await;

    let step = step_row(&store, outcome.run_id, "task").await.unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.attempt_count, 4);
    assert_eq!(step.error.as_deref(), Some("persistent failure"));
    assert!(step.result.is_none());
    assert!(step.finished_at.is_some());
}

/// With `max_retries = 0` the handler is invoked exactly once; the first
/// failure is final.
#[tokio::test]
async fn test_zero_retries_single_attempt() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let step = StepDefinition::new("once", move |_ctx| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            StepResult::err("no second chances")
        }
    })
    .max_retries(0);

    let definition = PipelineDefinition::new("strict").step(step);
    let (store, _registry, executor) = harness(definition);

    let outcome = executor.execute(RunOptions::new("strict")).await.unwrap();
    assert!(!outcome.success);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let step = step_row(&store, outcome.run_id, "once").await.unwrap();
    assert_eq!(step.attempt_count, 1);
    assert_eq!(step.status, StepStatus::Failed);
}

/// Per-step budgets override the default independently.
#[tokio::test]
async fn test_per_step_budget() {
    let (flaky, calls) = flaky_step("task", 1);
    let definition = PipelineDefinition::new("tight").step(flaky.max_retries(1));
    let (store, _registry, executor) = harness(definition);

    let outcome = executor.execute(RunOptions::new("tight")).await.unwrap();
    assert!(outcome.success);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let step = step_row(&store, outcome.run_id, "task").await.unwrap();
    assert_eq!(step.attempt_count, 2);
    assert_eq!(step.status, StepStatus::Success);
}
