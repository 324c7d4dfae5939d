//! Worker loop - long-running poller pairing the claimer with the executor

pub mod claimer;
pub mod config;

pub use claimer::{ClaimedRun, RunClaimer};
pub use config::WorkerConfig;

use crate::core::PipelineRegistry;
use crate::execution::RunExecutor;
use crate::metrics::{self, ExecutionMetrics};
use crate::persistence::{PipelineStore, RunStatus};
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Result of one poll iteration.
enum Tick {
    /// A run was claimed and driven to a terminal status.
    Executed,
    /// Nothing pending.
    Idle,
    /// A run was claimed but its pipeline is not registered; left in
    /// `running` for a later deploy (recovery will pick it up).
    UnknownPipeline,
}

/// Long-running worker: claims pending runs and executes them until a
/// shutdown signal arrives.
pub struct Worker {
    store: Arc<dyn PipelineStore>,
    registry: Arc<PipelineRegistry>,
    executor: RunExecutor,
    claimer: RunClaimer,
    metrics: Arc<ExecutionMetrics>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        registry: Arc<PipelineRegistry>,
        config: WorkerConfig,
    ) -> Self {
        let executor = RunExecutor::new(store.clone(), registry.clone())
            .with_retry_delay_multiplier(config.retry_delay_multiplier);
        Worker {
            claimer: RunClaimer::new(store.clone()),
            executor,
            metrics: Arc::new(ExecutionMetrics::new()),
            store,
            registry,
            config,
        }
    }

    pub fn metrics(&self) -> Arc<ExecutionMetrics> {
        self.metrics.clone()
    }

    /// Run until SIGINT/SIGTERM.
    pub async fn run(&self) -> Result<()> {
        let shutdown = spawn_shutdown_listener();
        self.run_with_shutdown(shutdown).await
    }

    /// Run until the shutdown channel flips to `true`.
    ///
    /// In-flight work gets up to the configured grace period to finish
    /// after the signal; shutdown is cooperative and no step is killed
    /// mid-flight within that window.
    pub async fn run_with_shutdown(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            pipelines = self.registry.count(),
            "worker started"
        );
        let reporter = metrics::spawn_reporter(self.metrics.clone(), self.config.metrics_interval);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let tick = self.tick();
            tokio::pin!(tick);

            let outcome = tokio::select! {
                outcome = &mut tick => outcome,
                _ = shutdown.changed() => {
                    info!(
                        grace_secs = self.config.shutdown_grace.as_secs(),
                        "shutdown requested, draining in-flight work"
                    );
                    match tokio::time::timeout(self.config.shutdown_grace, &mut tick).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(err)) => error!(error = %err, "final iteration failed"),
                        Err(_) => warn!("shutdown grace period elapsed, abandoning in-flight work"),
                    }
                    break;
                }
            };

            let idle = match outcome {
                Ok(Tick::Executed) => false,
                Ok(Tick::Idle) => true,
                Ok(Tick::UnknownPipeline) => true,
                Err(err) => {
                    // Storage faults are not retried here; log and keep
                    // polling so a recovering store resumes service.
                    error!(error = %err, "worker iteration failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }

        reporter.abort();
        info!("worker stopped");
        Ok(())
    }

    /// One poll iteration: claim, resolve the pipeline, execute, persist
    /// the terminal status.
    async fn tick(&self) -> Result<Tick> {
        let Some(claimed) = self.claimer.claim_pending().await? else {
            return Ok(Tick::Idle);
        };

        let Some(definition) = self.registry.get(&claimed.pipeline.name) else {
            warn!(
                run_id = %claimed.run.id,
                pipeline = %claimed.pipeline.name,
                "claimed run references an unregistered pipeline; leaving it for a later deploy"
            );
            return Ok(Tick::UnknownPipeline);
        };

        info!(run_id = %claimed.run.id, pipeline = %claimed.pipeline.name, "executing claimed run");
        let started = Instant::now();
        let result = self
            .executor
            .drive_existing_run(&claimed.run, &definition, HashMap::new())
            .await;
        let duration = started.elapsed();

        match result {
            Ok(()) => {
                self.store
                    .update_run_status(claimed.run.id, RunStatus::Success, Some(Utc::now()))
                    .await?;
                self.metrics.record_success(duration);
                info!(
                    run_id = %claimed.run.id,
                    duration_ms = duration.as_millis() as u64,
                    "run succeeded"
                );
            }
            Err(err) => {
                self.store
                    .update_run_status(claimed.run.id, RunStatus::Failed, Some(Utc::now()))
                    .await?;
                self.metrics.record_failure(duration);
                warn!(
                    run_id = %claimed.run.id,
                    duration_ms = duration.as_millis() as u64,
                    error = %err,
                    "run failed"
                );
            }
        }

        Ok(Tick::Executed)
    }
}

/// Install SIGINT/SIGTERM handlers feeding a watch channel.
pub fn spawn_shutdown_listener() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = tx.send(true);
    });
    rx
}

/// Wait for SIGINT (Ctrl+C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
        } else {
            info!("received Ctrl+C, initiating graceful shutdown");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("received SIGTERM, initiating graceful shutdown");
            }
            Err(err) => error!(error = %err, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
