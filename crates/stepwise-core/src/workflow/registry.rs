//! Step registry: maps `step_type` strings to handler implementations.
//!
//! Handlers implement [`StepHandler`] (native async fn in traits). Since RPITIT
//! traits cannot be used as trait objects, the registry stores them through
//! the object-safe [`StepHandlerDyn`] twin, which every `StepHandler` gets via
//! a blanket impl. The registry is populated at process start and shared
//! read-only afterwards; duplicate registrations are rejected up front.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use stepwise_types::workflow::{StepDefinition, StepStatus};
use thiserror::Error;

use super::context::ExecutionContext;

/// Input key under which a resumed step receives the resume signal.
///
/// Only the scheduler sets it; definitions may not map an input to it.
pub const RESUME_SIGNAL_KEY: &str = "_resume";

// ---------------------------------------------------------------------------
// StepOutcome
// ---------------------------------------------------------------------------

/// What a handler reports back for one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub success: bool,
    /// `Completed`, `Failed` or `Waiting`.
    pub status: StepStatus,
    /// Final output, or the partial resume state when waiting.
    pub output_data: Map<String, Value>,
    pub error: Option<String>,
    /// For waiting outcomes: wake the step with a timeout signal after this long.
    pub resume_after: Option<Duration>,
    /// The outcome is an expired suspension; terminates the execution as `timeout`.
    pub timed_out: bool,
}

impl StepOutcome {
    pub fn completed(output_data: Map<String, Value>) -> Self {
        Self {
            success: true,
            status: StepStatus::Completed,
            output_data,
            error: None,
            resume_after: None,
            timed_out: false,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            status: StepStatus::Failed,
            output_data: Map::new(),
            error: Some(error.into()),
            resume_after: None,
            timed_out: false,
        }
    }

    /// Suspend the step. `partial` is merged into the input on resume.
    pub fn waiting(partial: Map<String, Value>) -> Self {
        Self {
            success: true,
            status: StepStatus::Waiting,
            output_data: partial,
            error: None,
            resume_after: None,
            timed_out: false,
        }
    }

    pub fn with_resume_after(mut self, after: Duration) -> Self {
        self.resume_after = Some(after);
        self
    }

    pub fn with_timed_out(mut self) -> Self {
        self.timed_out = true;
        self
    }

    /// `success` must be false exactly when `status` is `Failed`.
    pub fn is_consistent(&self) -> bool {
        self.success == (self.status != StepStatus::Failed)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors a handler may raise. The scheduler records them as step failures.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("step execution failed: {0}")]
    ExecutionFailed(String),

    #[error("invalid step parameters: {0}")]
    InvalidParameters(String),

    #[error("dependency unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by registry operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("step type already registered: {0}")]
    AlreadyRegistered(String),

    #[error("step type not registered: {0}")]
    NotRegistered(String),
}

// ---------------------------------------------------------------------------
// Handler traits
// ---------------------------------------------------------------------------

/// A step implementation.
///
/// Called with the step's definition (parameters live in `step.parameters`),
/// the resolved input, and a read-only view of the execution context. Handlers
/// that suspend must tolerate being invoked again with their own partial state
/// merged into `input`; the signal that resumed them arrives under
/// [`RESUME_SIGNAL_KEY`].
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait StepHandler: Send + Sync {
    fn execute(
        &self,
        step: &StepDefinition,
        input: Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> impl Future<Output = Result<StepOutcome, StepError>> + Send;
}

/// Object-safe version of [`StepHandler`] with boxed futures.
pub trait StepHandlerDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        step: &'a StepDefinition,
        input: Map<String, Value>,
        ctx: &'a ExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutcome, StepError>> + Send + 'a>>;
}

/// Blanket implementation: any `StepHandler` automatically implements `StepHandlerDyn`.
impl<T: StepHandler> StepHandlerDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        step: &'a StepDefinition,
        input: Map<String, Value>,
        ctx: &'a ExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutcome, StepError>> + Send + 'a>> {
        Box::pin(self.execute(step, input, ctx))
    }
}

// ---------------------------------------------------------------------------
// Characteristics
// ---------------------------------------------------------------------------

/// How a step type behaves with respect to suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionKind {
    /// Returns a terminal outcome on every call.
    Synchronous,
    /// May return `waiting` and expect a later resume.
    Suspendable,
    /// Terminal outcome, but may take a long time.
    LongRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepCharacteristics {
    pub execution_kind: ExecutionKind,
    pub description: String,
}

impl StepCharacteristics {
    pub fn synchronous(description: impl Into<String>) -> Self {
        Self {
            execution_kind: ExecutionKind::Synchronous,
            description: description.into(),
        }
    }

    pub fn suspendable(description: impl Into<String>) -> Self {
        Self {
            execution_kind: ExecutionKind::Suspendable,
            description: description.into(),
        }
    }

    pub fn long_running(description: impl Into<String>) -> Self {
        Self {
            execution_kind: ExecutionKind::LongRunning,
            description: description.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// StepRegistry
// ---------------------------------------------------------------------------

/// A registered handler with its characteristics.
#[derive(Clone)]
pub struct RegisteredStep {
    pub handler: Arc<dyn StepHandlerDyn>,
    pub characteristics: StepCharacteristics,
}

/// Lookup table from `step_type` to handler.
#[derive(Default)]
pub struct StepRegistry {
    steps: HashMap<String, RegisteredStep>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Fails if `step_type` is already taken.
    pub fn register<H: StepHandler + 'static>(
        &mut self,
        step_type: impl Into<String>,
        handler: H,
        characteristics: StepCharacteristics,
    ) -> Result<(), RegistryError> {
        let step_type = step_type.into();
        if self.steps.contains_key(&step_type) {
            return Err(RegistryError::AlreadyRegistered(step_type));
        }
        tracing::debug!(step_type = step_type.as_str(), kind = ?characteristics.execution_kind, "registered step type");
        self.steps.insert(
            step_type,
            RegisteredStep {
                handler: Arc::new(handler),
                characteristics,
            },
        );
        Ok(())
    }

    pub fn lookup(&self, step_type: &str) -> Result<&RegisteredStep, RegistryError> {
        self.steps
            .get(step_type)
            .ok_or_else(|| RegistryError::NotRegistered(step_type.to_string()))
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.steps.contains_key(step_type)
    }

    /// Registered step types, sorted.
    pub fn list(&self) -> Vec<(&str, &StepCharacteristics)> {
        let mut entries: Vec<_> = self
            .steps
            .iter()
            .map(|(k, v)| (k.as_str(), &v.characteristics))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("step_types", &self.list().iter().map(|(k, _)| *k).collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
