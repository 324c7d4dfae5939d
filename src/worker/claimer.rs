//! Run claimer - atomic FIFO claim of one pending run

use crate::persistence::{PipelineRecord, PipelineStore, RunRecord};
use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

/// A run claimed by this worker, with its pipeline row.
#[derive(Debug, Clone)]
pub struct ClaimedRun {
    pub run: RunRecord,
    pub pipeline: PipelineRecord,
}

/// Claims pending runs through the store's single-transaction claim, so at
/// most one worker ever observes a given run here.
///
/// The claim overwrites the run's `started_at` with the claim time; the
/// original submission timestamp is lost, and recovery treats the claim
/// time as last activity.
pub struct RunClaimer {
    store: Arc<dyn PipelineStore>,
}

impl RunClaimer {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        RunClaimer { store }
    }

    /// Claim the oldest pending run, or `None` when the queue is empty.
    pub async fn claim_pending(&self) -> Result<Option<ClaimedRun>> {
        let Some((run, pipeline)) = self.store.claim_pending_run().await? else {
            return Ok(None);
        };
        debug!(run_id = %run.id, pipeline = %pipeline.name, "claimed run");
        Ok(Some(ClaimedRun { run, pipeline }))
    }
}
