//! Pipeline and step definitions

use crate::core::context::StepContext;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default number of retries when a step does not configure its own.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Errors raised while validating a pipeline definition.
///
/// Raised at registration time; an invalid definition never reaches the
/// executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("pipeline name must not be empty")]
    EmptyName,

    #[error("pipeline '{0}' has no steps")]
    EmptySteps(String),

    #[error("pipeline '{0}' is already registered")]
    DuplicatePipeline(String),

    #[error("duplicate step name '{0}'")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("step '{step}' depends on '{dependency}', which is declared later")]
    ForwardDependency { step: String, dependency: String },

    #[error("step '{0}' depends on itself")]
    SelfDependency(String),
}

/// The declared outcome of one step handler invocation.
///
/// A tagged variant rather than a success flag with optional fields, so a
/// missing error message can never be read as success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepResult {
    /// The step finished; `data` is stored and exposed to downstream steps.
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    /// The step failed; the attempt is retried until retries are exhausted.
    Failure { message: String },
}

impl StepResult {
    /// A successful result carrying no data.
    pub fn ok() -> Self {
        StepResult::Success { data: None }
    }

    /// A successful result carrying a JSON value.
    pub fn ok_with(data: impl Into<Value>) -> Self {
        StepResult::Success {
            data: Some(data.into()),
        }
    }

    /// A failed result with a human-readable message.
    pub fn err(message: impl Into<String>) -> Self {
        StepResult::Failure {
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepResult::Success { .. })
    }

    /// Data carried by a successful result, if any.
    pub fn data(&self) -> Option<&Value> {
        match self {
            StepResult::Success { data } => data.as_ref(),
            StepResult::Failure { .. } => None,
        }
    }

    /// Message carried by a failed result.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            StepResult::Success { .. } => None,
            StepResult::Failure { message } => Some(message),
        }
    }
}

/// User-supplied step function: receives a read-only context snapshot and
/// resolves to a [`StepResult`].
pub type StepHandler = Arc<dyn Fn(StepContext) -> BoxFuture<'static, StepResult> + Send + Sync>;

/// Per-step execution configuration.
#[derive(Debug, Clone, Default)]
pub struct StepConfig {
    /// Maximum retries after the first attempt; `None` uses
    /// [`DEFAULT_MAX_RETRIES`].
    pub max_retries: Option<u32>,

    /// Deadline for one handler invocation; `None` means no timeout.
    pub timeout: Option<Duration>,

    /// Explicit dependencies. `None` means "all previously declared steps"
    /// (sequential default); `Some(vec![])` means no dependencies at all.
    pub depends_on: Option<Vec<String>>,
}

/// A single step in a pipeline definition.
#[derive(Clone)]
pub struct StepDefinition {
    /// Step name, unique within its pipeline.
    pub name: String,

    /// The handler invoked on every attempt.
    pub handler: StepHandler,

    /// Retry, timeout and dependency configuration.
    pub config: StepConfig,
}

impl StepDefinition {
    /// Create a step from an async function or closure.
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepResult> + Send + 'static,
    {
        StepDefinition {
            name: name.into(),
            handler: Arc::new(move |ctx| Box::pin(handler(ctx))),
            config: StepConfig::default(),
        }
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = Some(retries);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// Declare explicit dependencies, replacing the sequential default.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.depends_on = Some(deps.into_iter().map(Into::into).collect());
        self
    }

    /// The retry budget with the process default applied.
    pub fn effective_max_retries(&self) -> u32 {
        self.config.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A validated, in-memory pipeline definition.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    /// Globally unique pipeline name.
    pub name: String,

    pub description: Option<String>,

    /// Optional schedule expression, stored but not interpreted by the core.
    pub schedule: Option<String>,

    /// Steps in declaration order.
    pub steps: Vec<StepDefinition>,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        PipelineDefinition {
            name: name.into(),
            description: None,
            schedule: None,
            steps: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    pub fn step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Get a step by name.
    pub fn find_step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Names of all steps in declaration order.
    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name.clone()).collect()
    }

    /// Validate the definition: non-empty name and steps, and a
    /// well-formed dependency graph.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if self.steps.is_empty() {
            return Err(ValidationError::EmptySteps(self.name.clone()));
        }
        crate::core::graph::DependencyGraph::build(&self.steps)?;
        Ok(())
    }
}
