//! Failure propagation: sequential short-circuit, sibling draining

mod helpers;

use conveyor::{PipelineDefinition, PipelineStore, RunOptions, RunStatus, StepStatus};
use helpers::*;
use serde_json::json;
use std::time::Duration;

/// Failing middle step in a sequential chain: the run fails with the step
/// error, and the step after the failure never gets a row.
#[tokio::test]
async fn test_failing_middle_step() {
    let definition = PipelineDefinition::new("broken-chain")
        .step(ok_step("s1", json!("ok")))
        .step(failing_step("s2", "boom"))
        .step(ok_step("s3", json!("never")));
    let (store, _registry, executor) = harness(definition);

    let outcome = executor
        .execute(RunOptions::new("broken-chain"))
        .await
        .unwrap();
    assert!(!outcome.success);
    assert!(outcome.error.as_deref().unwrap().contains("boom"));

    assert_run_terminal(&store, outcome.run_id, RunStatus::Failed).await;

    let steps = store.list_steps(outcome.run_id).await.unwrap();
    assert_eq!(steps.len(), 2, "s3 must not have a row");
    assert!(step_row(&store, outcome.run_id, "s3").await.is_none());

    let s1 = step_row(&store, outcome.run_id, "s1").await.unwrap();
    let s2 = step_row(&store, outcome.run_id, "s2").await.unwrap();
    assert_eq!(s1.status, StepStatus::Success);
    assert_eq!(s2.status, StepStatus::Failed);
}

/// In-flight siblings are not cancelled when another root fails: they
/// complete naturally and their rows stay truthful.
#[tokio::test]
async fn test_sibling_drains_after_failure() {
    let definition = PipelineDefinition::new("siblings")
        .step(failing_step("fast-fail", "early exit").max_retries(0).depends_on(Vec::<String>::new()))
        .step(
            sleeping_step("slow-ok", Duration::from_millis(100))
                .depends_on(Vec::<String>::new()),
        );
    let (store, _registry, executor) = harness(definition);

    let outcome = executor.execute(RunOptions::new("siblings")).await.unwrap();
    assert!(!outcome.success);
    assert!(outcome.error.as_deref().unwrap().contains("early exit"));

    // The slow sibling still ran to completion and recorded success.
    let slow = step_row(&store, outcome.run_id, "slow-ok").await.unwrap();
    assert_eq!(slow.status, StepStatus::Success);
    assert!(slow.finished_at.is_some());

    assert_run_terminal(&store, outcome.run_id, RunStatus::Failed).await;
}

/// Steps downstream of a failed dependency are never launched.
#[tokio::test]
async fn test_downstream_of_failure_not_launched() {
    let definition = PipelineDefinition::new("downstream")
        .step(failing_step("root", "root failed").max_retries(0))
        .step(ok_step("child", json!(1)).depends_on(["root"]))
        .step(ok_step("grandchild", json!(2)).depends_on(["child"]));
    let (store, _registry, executor) = harness(definition);

    let outcome = executor
        .execute(RunOptions::new("downstream"))
        .await
        .unwrap();
    assert!(!outcome.success);

    let steps = store.list_steps(outcome.run_id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].name, "root");
}
