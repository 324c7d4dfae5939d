//! Execution metrics - lock-free counters with a periodic log reporter

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// Process-wide counters for run outcomes.
#[derive(Debug, Default)]
pub struct ExecutionMetrics {
    runs_succeeded: AtomicU64,
    runs_failed: AtomicU64,
    busy_ms: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub runs_succeeded: u64,
    pub runs_failed: u64,
    /// Total wall time spent executing runs, in milliseconds.
    pub busy_ms: u64,
}

impl ExecutionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, duration: Duration) {
        self.runs_succeeded.fetch_add(1, Ordering::Relaxed);
        self.busy_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self, duration: Duration) {
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
        self.busy_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            runs_succeeded: self.runs_succeeded.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            busy_ms: self.busy_ms.load(Ordering::Relaxed),
        }
    }
}

/// Log a metrics snapshot at a fixed cadence until the handle is aborted.
pub fn spawn_reporter(metrics: Arc<ExecutionMetrics>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the first report
        // covers a full interval.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let snapshot = metrics.snapshot();
            info!(
                runs_succeeded = snapshot.runs_succeeded,
                runs_failed = snapshot.runs_failed,
                busy_ms = snapshot.busy_ms,
                "execution metrics"
            );
        }
    })
}
