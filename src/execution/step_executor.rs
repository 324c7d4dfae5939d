//! Step executor - runs one step with retries, timeout and persistence

use crate::core::{ExecutionContext, StepDefinition, StepResult};
use crate::execution::error::ExecutionError;
use crate::persistence::{PipelineStore, StepStatus, StepStatusUpdate};
use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Base delay for the first retry, in seconds.
pub const BACKOFF_BASE_SECS: u64 = 30;

/// Upper bound on any single backoff delay, in seconds.
pub const BACKOFF_CAP_SECS: u64 = 300;

/// Delay before the retry that follows a failed attempt `k` (1-indexed):
/// `min(30 * 2^(k-1), 300)` seconds.
///
/// Pure; used for both scheduling and display.
pub fn calculate_backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let secs = BACKOFF_BASE_SECS.saturating_mul(1u64 << exponent);
    Duration::from_secs(secs.min(BACKOFF_CAP_SECS))
}

/// Executes a single step against an execution context, persisting every
/// state transition.
#[derive(Clone)]
pub struct StepExecutor {
    store: Arc<dyn PipelineStore>,
    retry_delay_multiplier: f64,
}

impl StepExecutor {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        StepExecutor {
            store,
            retry_delay_multiplier: 1.0,
        }
    }

    /// Scale every retry sleep by a process-wide factor. Values below 1
    /// collapse the waits for test harnesses.
    pub fn with_retry_delay_multiplier(mut self, multiplier: f64) -> Self {
        self.retry_delay_multiplier = multiplier;
        self
    }

    /// Run the step's attempt loop to a terminal outcome.
    ///
    /// Returns the successful [`StepResult`]; fails with
    /// [`ExecutionError::StepExhausted`] once retries run out, or with the
    /// storage error if persistence fails.
    pub async fn execute_step(
        &self,
        step: &StepDefinition,
        ctx: &ExecutionContext,
    ) -> Result<StepResult, ExecutionError> {
        let max_retries = step.effective_max_retries();

        let record = self
            .store
            .create_step(ctx.run_id, &step.name)
            .await
            .map_err(ExecutionError::Storage)?;

        // A reused row from an interrupted run continues its attempt
        // numbering; attempt_count stays monotonically non-decreasing.
        let mut attempt: u32 = record.attempt_count + 1;

        // A resumed row may already have burned its budget before the
        // interruption; fail it without invoking the handler again.
        if attempt > max_retries + 1 {
            let message = record
                .error
                .clone()
                .unwrap_or_else(|| format!("Exceeded retry limit of {max_retries}"));
            self.store
                .update_step_status(
                    record.id,
                    StepStatusUpdate {
                        status: StepStatus::Failed,
                        finished_at: Some(Utc::now()),
                        attempt_count: record.attempt_count,
                        ..Default::default()
                    },
                )
                .await
                .map_err(ExecutionError::Storage)?;
            self.store
                .update_step_result(record.id, None, Some(&message))
                .await
                .map_err(ExecutionError::Storage)?;
            return Err(ExecutionError::StepExhausted {
                step: step.name.clone(),
                attempts: record.attempt_count,
                message,
            });
        }

        loop {
            let update = if attempt == 1 {
                StepStatusUpdate {
                    status: StepStatus::Running,
                    started_at: Some(Utc::now()),
                    attempt_count: 1,
                    ..Default::default()
                }
            } else {
                StepStatusUpdate {
                    status: StepStatus::Retrying,
                    attempt_count: attempt,
                    ..Default::default()
                }
            };
            self.store
                .update_step_status(record.id, update)
                .await
                .map_err(ExecutionError::Storage)?;

            debug!(step = %step.name, attempt, "starting attempt");
            let outcome = self.run_attempt(step, ctx).await;

            match outcome {
                Ok(data) => {
                    let serialized = data.as_ref().map(Value::to_string);
                    self.store
                        .update_step_status(
                            record.id,
                            StepStatusUpdate {
                                status: StepStatus::Success,
                                finished_at: Some(Utc::now()),
                                attempt_count: attempt,
                                ..Default::default()
                            },
                        )
                        .await
                        .map_err(ExecutionError::Storage)?;
                    self.store
                        .update_step_result(record.id, serialized.as_deref(), None)
                        .await
                        .map_err(ExecutionError::Storage)?;

                    info!(step = %step.name, attempt, "step completed");
                    return Ok(StepResult::Success { data });
                }
                Err(message) => {
                    if attempt > max_retries {
                        self.store
                            .update_step_status(
                                record.id,
                                StepStatusUpdate {
                                    status: StepStatus::Failed,
                                    finished_at: Some(Utc::now()),
                                    attempt_count: attempt,
                                    ..Default::default()
                                },
                            )
                            .await
                            .map_err(ExecutionError::Storage)?;
                        self.store
                            .update_step_result(record.id, None, Some(&message))
                            .await
                            .map_err(ExecutionError::Storage)?;

                        warn!(step = %step.name, attempts = attempt, error = %message, "step failed, retries exhausted");
                        return Err(ExecutionError::StepExhausted {
                            step: step.name.clone(),
                            attempts: attempt,
                            message,
                        });
                    }

                    let backoff = calculate_backoff(attempt);
                    self.store
                        .update_step_status(
                            record.id,
                            StepStatusUpdate {
                                status: StepStatus::Retrying,
                                attempt_count: attempt,
                                next_retry_at: Some(
                                    Utc::now()
                                        + chrono::Duration::seconds(backoff.as_secs() as i64),
                                ),
                                ..Default::default()
                            },
                        )
                        .await
                        .map_err(ExecutionError::Storage)?;
                    self.store
                        .update_step_result(record.id, None, Some(&message))
                        .await
                        .map_err(ExecutionError::Storage)?;

                    warn!(
                        step = %step.name,
                        attempt,
                        backoff_secs = backoff.as_secs(),
                        error = %message,
                        "step attempt failed, will retry"
                    );
                    tokio::time::sleep(backoff.mul_f64(self.retry_delay_multiplier)).await;
                }
            }

            attempt += 1;
        }
    }

    /// Invoke the handler once, racing it against the configured timeout.
    /// A panicking handler is contained and reported as an ordinary
    /// attempt failure.
    async fn run_attempt(
        &self,
        step: &StepDefinition,
        ctx: &ExecutionContext,
    ) -> Result<Option<Value>, String> {
        let step_ctx = ctx.step_context().await;
        let invocation = AssertUnwindSafe((step.handler)(step_ctx)).catch_unwind();

        let outcome = match step.config.timeout {
            Some(limit) => match tokio::time::timeout(limit, invocation).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    return Err(format!(
                        "Step execution timeout after {}ms",
                        limit.as_millis()
                    ))
                }
            },
            None => invocation.await,
        };

        match outcome {
            Ok(StepResult::Success { data }) => Ok(data),
            Ok(StepResult::Failure { message }) => Err(message),
            Err(panic) => Err(panic_message(panic)),
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("step handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("step handler panicked: {message}")
    } else {
        "step handler panicked".to_string()
    }
}
