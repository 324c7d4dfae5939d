//! Atomic FIFO run claiming under contention

use conveyor::{InMemoryStore, PipelineStore, RunStatus};
use std::collections::HashSet;
use std::sync::Arc;

/// Three pending runs, five concurrent claimers: exactly three claims
/// succeed, all distinct, and every run ends up running.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_race_free_claim() {
    let store = Arc::new(InMemoryStore::new());
    let pipeline = store
        .create_pipeline_if_absent("contended", None, None)
        .await
        .unwrap();

    let mut created = Vec::new();
    for _ in 0..3 {
        created.push(store.create_run(pipeline.id, None, None).await.unwrap());
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    let mut claimers = Vec::new();
    for _ in 0..5 {
        let store = store.clone();
        claimers.push(tokio::spawn(async move {
            store.claim_pending_run().await.unwrap()
        }));
    }

    let mut claimed_ids = Vec::new();
    for claimer in claimers {
        if let Some((run, _)) = claimer.await.unwrap() {
            claimed_ids.push(run.id);
        }
    }

    assert_eq!(claimed_ids.len(), 3, "exactly one claim per pending run");
    let distinct: HashSet<_> = claimed_ids.iter().collect();
    assert_eq!(distinct.len(), 3, "no run observed by two claimers");

    for run in &created {
        let loaded = store.find_run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
    }
}

/// Claims come out oldest-first and overwrite `started_at` with the claim
/// time.
#[tokio::test]
async fn test_claim_fifo_and_timestamp_overwrite() {
    let store = InMemoryStore::new();
    let pipeline = store
        .create_pipeline_if_absent("queue", None, None)
        .await
        .unwrap();

    let first = store.create_run(pipeline.id, None, None).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    let second = store.create_run(pipeline.id, None, None).await.unwrap();

    let (claimed_first, claimed_pipeline) = store.claim_pending_run().await.unwrap().unwrap();
    assert_eq!(claimed_first.id, first.id);
    assert_eq!(claimed_pipeline.name, "queue");
    assert!(
        claimed_first.started_at > first.started_at,
        "claim must overwrite the submission timestamp"
    );

    let (claimed_second, _) = store.claim_pending_run().await.unwrap().unwrap();
    assert_eq!(claimed_second.id, second.id);

    assert!(store.claim_pending_run().await.unwrap().is_none());
}
