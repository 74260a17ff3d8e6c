//! Scheduler: drives one execution through its step graph.
//!
//! `WorkflowEngine` owns the dispatch algorithm and nothing else. It does not
//! decide how a suspended execution is woken up; the in-process and durable
//! backends wrap it and supply that policy.
//!
//! # Dispatch round
//!
//! 1. Stop if the execution is cancelled or past its deadline.
//! 2. Scan steps in dispatch order and collect those whose dependencies are
//!    satisfied (`completed`, `skipped`, or `failed` and non-critical).
//! 3. Evaluate conditions; false conditions record `skipped`.
//! 4. Run the remaining ready steps concurrently (one step per round for the
//!    `sequential` pattern), each under its step timeout and retry policy.
//! 5. Apply the outcomes in dispatch order, checkpointing every transition.
//!
//! A round with nothing ready either suspends the execution (some step is
//! waiting) or completes it.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SubsecRound, Utc};
use dashmap::DashMap;
use futures_util::FutureExt;
use serde_json::{Map, Value, json};
use stepwise_types::config::EngineConfig;
use stepwise_types::event::WorkflowEvent;
use stepwise_types::workflow::{
    Execution, ExecutionPattern, ExecutionStatus, ParentLink, StepDefinition, StepResult,
    StepStatus, UserContext, WorkflowDefinition,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::workflow::WorkflowRepository;

use super::analytics::{ExecutionAnalytics, summarize};
use super::breaker::{StepBreakers, StepTypeStats};
use super::checkpoint::{CheckpointError, CheckpointManager};
use super::condition::ConditionEvaluator;
use super::context::ExecutionContext;
use super::dag::dispatch_order;
use super::definition::{WorkflowError, validate_definition, validate_step_types};
use super::registry::{RESUME_SIGNAL_KEY, StepHandlerDyn, StepOutcome, StepRegistry};
use super::retry::RetryHandler;
use super::variables::resolve_mapping;

// ---------------------------------------------------------------------------
// WorkflowExecutor trait
// ---------------------------------------------------------------------------

/// Entry points shared by the execution backends.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods,
/// consistent with the project's Rust 2024 edition approach.
pub trait WorkflowExecutor: Send + Sync {
    /// Start a new execution of `definition` for one trigger payload.
    fn execute(
        &self,
        definition: WorkflowDefinition,
        trigger_data: Value,
        user: UserContext,
    ) -> impl std::future::Future<Output = Result<ExecutionResult, ExecutorError>> + Send;

    /// Deliver an external signal to a waiting step and continue the run.
    ///
    /// Resuming a step (or execution) that is already terminal is a no-op.
    fn resume(
        &self,
        execution_id: Uuid,
        step_id: &str,
        decision: Value,
    ) -> impl std::future::Future<Output = Result<ExecutionResult, ExecutorError>> + Send;

    /// Stop dispatching further steps. Recorded step results are kept.
    fn cancel(
        &self,
        execution_id: Uuid,
    ) -> impl std::future::Future<Output = Result<(), ExecutorError>> + Send;

    fn get_execution(
        &self,
        execution_id: Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, ExecutorError>> + Send;

    /// Executions, optionally for one workflow, newest first.
    fn list_executions(
        &self,
        workflow_id: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, ExecutorError>> + Send;
}

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

/// State of an execution when control returns to the caller.
///
/// `status` may be `waiting`: the run is suspended, not finished.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub context: ExecutionContext,
    pub step_results: BTreeMap<String, StepResult>,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn new(execution: &Execution, context: ExecutionContext) -> Self {
        Self {
            execution_id: execution.execution_id,
            status: execution.status,
            context,
            step_results: execution.step_results.clone(),
            error: execution.error.clone(),
        }
    }

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.step_results.get(step_id).map(|r| r.status)
    }

    /// Output recorded for a step, if it completed.
    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.context.get_step_output(step_id)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by executor entry points.
///
/// Step failures and definition errors are not errors here: they are recorded
/// on the execution and returned as an `ExecutionResult` with a failed status.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("execution not found: {0}")]
    NotFound(Uuid),

    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("cannot resume step '{step_id}' of execution {execution_id}: {reason}")]
    InvalidResume {
        execution_id: Uuid,
        step_id: String,
        reason: String,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Approval(#[from] super::approval::ApprovalError),

    #[error("step task failed: {0}")]
    Task(String),
}

/// How a resume request relates to the current step state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeCheck {
    /// The step is waiting and may be resumed now.
    Proceed,
    /// The step or the execution is already terminal; nothing to do.
    AlreadyTerminal,
    /// The step is being (re)dispatched; the signal must be kept for later.
    Deferred,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Dispatch algorithm shared by the execution backends.
///
/// Generic over `R: WorkflowRepository` for storage flexibility.
pub struct WorkflowEngine<R: WorkflowRepository> {
    checkpoint: Arc<CheckpointManager<R>>,
    registry: Arc<StepRegistry>,
    event_bus: EventBus,
    config: EngineConfig,
    /// Cancellation tokens keyed by execution_id.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
    breakers: Arc<StepBreakers>,
}

impl<R: WorkflowRepository + 'static> WorkflowEngine<R> {
    pub fn new(
        repo: Arc<R>,
        registry: Arc<StepRegistry>,
        event_bus: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            checkpoint: Arc::new(CheckpointManager::new(repo)),
            registry,
            event_bus,
            breakers: Arc::new(StepBreakers::new(
                config.circuit_breaker_threshold,
                Duration::from_secs(config.circuit_breaker_cooldown_secs),
            )),
            config,
            cancellation_tokens: DashMap::new(),
        }
    }

    pub fn checkpoint(&self) -> &CheckpointManager<R> {
        &self.checkpoint
    }

    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn breakers(&self) -> &StepBreakers {
        &self.breakers
    }

    /// Attempt and failure counters with circuit state, per step type.
    pub fn error_statistics(&self, step_type: Option<&str>) -> Vec<StepTypeStats> {
        self.breakers.statistics(step_type)
    }

    /// Status distribution and timings over stored executions.
    pub async fn execution_analytics(
        &self,
        workflow_id: Option<&str>,
    ) -> Result<ExecutionAnalytics, ExecutorError> {
        let executions = self.list_executions(workflow_id).await?;
        Ok(summarize(&executions))
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Token for an execution, created on first use.
    pub fn cancellation_token(&self, execution_id: Uuid) -> CancellationToken {
        self.cancellation_tokens
            .entry(execution_id)
            .or_default()
            .value()
            .clone()
    }

    /// Trigger the execution's token. Returns `false` if no token exists.
    pub fn cancel_token(&self, execution_id: Uuid) -> bool {
        match self.cancellation_tokens.get(&execution_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    /// Load an execution and rebuild its context from the last checkpoint.
    pub async fn load(
        &self,
        execution_id: Uuid,
    ) -> Result<(Execution, ExecutionContext), ExecutorError> {
        let execution = self
            .checkpoint
            .find_execution(execution_id)
            .await?
            .ok_or(ExecutorError::NotFound(execution_id))?;
        let ctx = ExecutionContext::restore(&execution)?;
        Ok((execution, ctx))
    }

    /// Current state of an execution as an `ExecutionResult`.
    pub async fn snapshot(&self, execution_id: Uuid) -> Result<ExecutionResult, ExecutorError> {
        let (execution, ctx) = self.load(execution_id).await?;
        Ok(ExecutionResult::new(&execution, ctx))
    }

    /// Stored definition by workflow id.
    pub async fn definition(&self, workflow_id: &str) -> Result<WorkflowDefinition, ExecutorError> {
        self.checkpoint
            .repo()
            .get_definition(workflow_id)
            .await
            .map_err(|e| ExecutorError::Checkpoint(CheckpointError::Repository(e.to_string())))?
            .ok_or_else(|| ExecutorError::DefinitionNotFound(workflow_id.to_string()))
    }

    /// Validate and store a definition so subflow steps can reference it.
    pub async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), ExecutorError> {
        validate_definition(definition)?;
        for warning in super::definition::condition_warnings(definition) {
            tracing::warn!(workflow_id = definition.id.as_str(), "{warning}");
        }
        self.checkpoint
            .repo()
            .save_definition(definition)
            .await
            .map_err(|e| ExecutorError::Checkpoint(CheckpointError::Repository(e.to_string())))
    }

    pub async fn get_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<Execution>, ExecutorError> {
        Ok(self.checkpoint.find_execution(execution_id).await?)
    }

    pub async fn list_executions(
        &self,
        workflow_id: Option<&str>,
    ) -> Result<Vec<Execution>, ExecutorError> {
        self.checkpoint
            .repo()
            .list_executions(workflow_id)
            .await
            .map_err(|e| ExecutorError::Checkpoint(CheckpointError::Repository(e.to_string())))
    }

    /// The child execution a subflow step already started, if any.
    pub async fn find_child(
        &self,
        parent: &ParentLink,
        workflow_id: &str,
    ) -> Result<Option<Execution>, ExecutorError> {
        let children = self.list_executions(Some(workflow_id)).await?;
        Ok(children.into_iter().find(|e| {
            e.parent.as_ref().is_some_and(|p| {
                p.execution_id == parent.execution_id && p.step_id == parent.step_id
            })
        }))
    }

    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    /// Create and persist a new execution.
    ///
    /// An invalid definition (cycle, unknown dependency, unregistered step
    /// type) is recorded as an execution that failed before any dispatch.
    pub async fn start(
        &self,
        definition: WorkflowDefinition,
        trigger_data: Value,
        user: UserContext,
        parent: Option<ParentLink>,
    ) -> Result<(Execution, ExecutionContext), ExecutorError> {
        let depth = parent.as_ref().map_or(0, |p| p.depth);
        let mut execution = Execution::pending(definition, trigger_data, user, parent);
        let ctx = ExecutionContext::new(
            execution.execution_id,
            Arc::new(execution.definition.clone()),
            execution.trigger_data.clone(),
            execution.user.clone(),
        )
        .with_depth(depth);

        let now = Utc::now();
        execution.started_at = Some(now);
        execution.context = ctx.to_json();

        let invalid = validate_definition(&execution.definition)
            .and_then(|()| validate_step_types(&execution.definition, &self.registry))
            .err();
        match &invalid {
            Some(err) => {
                execution.status = ExecutionStatus::Failed;
                execution.error = Some(err.to_string());
                execution.completed_at = Some(now);
            }
            None => execution.status = ExecutionStatus::Running,
        }

        self.checkpoint.create_execution(&execution).await?;
        self.event_bus.publish(WorkflowEvent::ExecutionStarted {
            execution_id: execution.execution_id,
            workflow_id: execution.workflow_id.clone(),
            parent_execution_id: execution.parent.as_ref().map(|p| p.execution_id),
        });

        match invalid {
            Some(err) => {
                tracing::warn!(
                    execution_id = %execution.execution_id,
                    workflow_id = execution.workflow_id.as_str(),
                    error = %err,
                    "workflow definition rejected"
                );
                self.event_bus.publish(WorkflowEvent::ExecutionFinished {
                    execution_id: execution.execution_id,
                    status: ExecutionStatus::Failed,
                    error: execution.error.clone(),
                });
            }
            None => {
                self.cancellation_token(execution.execution_id);
                tracing::info!(
                    execution_id = %execution.execution_id,
                    workflow_id = execution.workflow_id.as_str(),
                    depth,
                    "starting workflow execution"
                );
            }
        }
        Ok((execution, ctx))
    }

    // -----------------------------------------------------------------------
    // Drive
    // -----------------------------------------------------------------------

    /// Run dispatch rounds until the execution suspends or terminates.
    pub async fn drive(
        &self,
        execution: &mut Execution,
        ctx: &mut ExecutionContext,
        cancel: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        if execution.status.is_terminal() {
            return Ok(());
        }
        if execution.status != ExecutionStatus::Running {
            execution.status = ExecutionStatus::Running;
            execution.started_at.get_or_insert_with(Utc::now);
            self.checkpoint.checkpoint_execution(execution).await?;
        }

        let order = dispatch_order(&execution.definition.steps)?;
        let deadline = self.deadline(execution);

        loop {
            if cancel.is_cancelled() {
                return self
                    .finish(
                        execution,
                        ctx,
                        ExecutionStatus::Cancelled,
                        Some("execution cancelled".to_string()),
                    )
                    .await;
            }
            if deadline.is_some_and(|d| Utc::now() >= d) {
                return self
                    .finish(
                        execution,
                        ctx,
                        ExecutionStatus::Timeout,
                        Some("execution timed out".to_string()),
                    )
                    .await;
            }

            let mut ready = ready_steps(execution, &order);
            if ready.is_empty() {
                let waiting = execution.waiting_steps();
                if waiting.is_empty() {
                    return self
                        .finish(execution, ctx, ExecutionStatus::Completed, None)
                        .await;
                }
                return self.suspend(execution, ctx, waiting).await;
            }
            if execution.definition.execution_pattern == ExecutionPattern::Sequential {
                ready.truncate(1);
            }

            if let Some((status, error)) = self.run_round(execution, ctx, &ready).await? {
                return self.finish(execution, ctx, status, Some(error)).await;
            }
        }
    }

    /// Dispatch one round of ready steps and apply their outcomes.
    ///
    /// Returns the terminal status the round forces, if any.
    async fn run_round(
        &self,
        execution: &mut Execution,
        ctx: &mut ExecutionContext,
        ready: &[usize],
    ) -> Result<Option<(ExecutionStatus, String)>, ExecutorError> {
        let execution_id = execution.execution_id;
        let trigger_input = trigger_input(ctx);
        let mut join_set = JoinSet::new();
        let mut outcomes: Vec<Option<(StepOutcome, u32)>> = vec![None; ready.len()];
        let mut dispatched: Vec<Option<StepDefinition>> = vec![None; ready.len()];

        for (pos, &idx) in ready.iter().enumerate() {
            let step = execution.definition.steps[idx].clone();

            if let Some(condition) = &step.condition
                && !ConditionEvaluator::evaluate(condition, ctx)
            {
                tracing::debug!(
                    execution_id = %execution_id,
                    step_id = step.step_id.as_str(),
                    condition = condition.as_str(),
                    "condition false, skipping step"
                );
                let result = StepResult::skipped(&step.step_id);
                ctx.record_state(&step.step_id, StepStatus::Skipped, None);
                self.record_step(execution, ctx, result).await?;
                continue;
            }

            let input = resolve_mapping(&step.input_mapping, ctx, &trigger_input);
            let prior_attempts = execution
                .step_results
                .get(&step.step_id)
                .map_or(0, |r| r.attempts);
            let mut running = StepResult::running(&step.step_id);
            running.attempts = prior_attempts;
            ctx.record_state(&step.step_id, StepStatus::Running, None);
            self.record_step(execution, ctx, running).await?;

            match self.registry.lookup(&step.step_type) {
                Ok(registered) => {
                    let handler = Arc::clone(&registered.handler);
                    let timeout = self.step_timeout(&step);
                    let step_ctx = ctx.clone();
                    let task_step = step.clone();
                    let breakers = Arc::clone(&self.breakers);
                    join_set.spawn(async move {
                        let (outcome, attempts) = invoke_step(
                            handler,
                            &task_step,
                            input,
                            &step_ctx,
                            timeout,
                            Some(breakers.as_ref()),
                        )
                        .await;
                        (pos, outcome, attempts)
                    });
                }
                Err(e) => outcomes[pos] = Some((StepOutcome::failed(e.to_string()), 1)),
            }
            dispatched[pos] = Some(step);
        }

        while let Some(joined) = join_set.join_next().await {
            let (pos, outcome, attempts) = joined.map_err(|e| ExecutorError::Task(e.to_string()))?;
            outcomes[pos] = Some((outcome, attempts));
        }

        let mut terminal = None;
        for (step, outcome) in dispatched.into_iter().zip(outcomes) {
            let (Some(step), Some((outcome, attempts))) = (step, outcome) else {
                continue;
            };
            if let Some(forced) = self
                .apply_outcome(execution, ctx, &step, outcome, attempts)
                .await?
            {
                terminal.get_or_insert(forced);
            }
        }
        Ok(terminal)
    }

    // -----------------------------------------------------------------------
    // Resume
    // -----------------------------------------------------------------------

    /// Classify a resume request against the persisted execution state.
    pub fn check_resume(
        execution: &Execution,
        step_id: &str,
    ) -> Result<ResumeCheck, ExecutorError> {
        if execution.status.is_terminal() {
            return Ok(ResumeCheck::AlreadyTerminal);
        }
        let invalid = |reason: String| ExecutorError::InvalidResume {
            execution_id: execution.execution_id,
            step_id: step_id.to_string(),
            reason,
        };
        if execution.definition.step(step_id).is_none() {
            return Err(invalid("no such step".to_string()));
        }
        match execution.step_status(step_id) {
            Some(StepStatus::Waiting) => Ok(ResumeCheck::Proceed),
            Some(status) if status.is_terminal() => Ok(ResumeCheck::AlreadyTerminal),
            Some(StepStatus::Running) => Ok(ResumeCheck::Deferred),
            Some(status) => Err(invalid(format!("step is {status}"))),
            None => Err(invalid("step has not been dispatched".to_string())),
        }
    }

    /// Re-invoke a waiting step with its partial state merged into its input
    /// and the signal under [`RESUME_SIGNAL_KEY`], then apply the outcome.
    ///
    /// Does not dispatch further steps; the caller drives afterwards.
    pub async fn resume_step(
        &self,
        execution: &mut Execution,
        ctx: &mut ExecutionContext,
        step_id: &str,
        signal: Value,
    ) -> Result<(), ExecutorError> {
        let step = execution
            .definition
            .step(step_id)
            .cloned()
            .ok_or_else(|| ExecutorError::InvalidResume {
                execution_id: execution.execution_id,
                step_id: step_id.to_string(),
                reason: "no such step".to_string(),
            })?;
        let prior = execution
            .step_results
            .get(step_id)
            .cloned()
            .unwrap_or_else(|| StepResult::running(step_id));

        let mut input = resolve_mapping(&step.input_mapping, ctx, &trigger_input(ctx));
        input.extend(prior.output_data.clone());
        let signal = match signal {
            Value::Object(fields) => fields,
            Value::Null => Map::new(),
            other => Map::from_iter([("decision".to_string(), other)]),
        };
        input.insert(RESUME_SIGNAL_KEY.to_string(), Value::Object(signal));

        tracing::info!(
            execution_id = %execution.execution_id,
            step_id,
            "resuming waiting step"
        );

        let mut running = prior;
        running.status = StepStatus::Running;
        running.wake_at = None;
        ctx.record_state(step_id, StepStatus::Running, None);
        self.record_step(execution, ctx, running).await?;

        let (outcome, attempts) = match self.registry.lookup(&step.step_type) {
            Ok(registered) => {
                let handler = Arc::clone(&registered.handler);
                let timeout = self.step_timeout(&step);
                // A resumed step is already admitted; only its outcome is counted.
                let (outcome, attempts) = invoke_step(handler, &step, input, ctx, timeout, None).await;
                record_attempt(&self.breakers, &step.step_type, &outcome);
                (outcome, attempts)
            }
            Err(e) => (StepOutcome::failed(e.to_string()), 1),
        };

        if let Some((status, error)) = self
            .apply_outcome(execution, ctx, &step, outcome, attempts)
            .await?
        {
            self.finish(execution, ctx, status, Some(error)).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Outcome application
    // -----------------------------------------------------------------------

    /// Record a handler outcome. Returns the terminal status it forces, if any.
    async fn apply_outcome(
        &self,
        execution: &mut Execution,
        ctx: &mut ExecutionContext,
        step: &StepDefinition,
        outcome: StepOutcome,
        attempts: u32,
    ) -> Result<Option<(ExecutionStatus, String)>, ExecutorError> {
        let step_id = step.step_id.as_str();
        let now = Utc::now();
        let mut result = execution
            .step_results
            .get(step_id)
            .cloned()
            .unwrap_or_else(|| StepResult::running(step_id));
        result.attempts = result.attempts.saturating_add(attempts);
        result.wake_at = None;

        match outcome.status {
            StepStatus::Completed => {
                let output = truncate_output(
                    outcome.output_data,
                    self.config.max_step_output_bytes,
                    execution.execution_id,
                    step_id,
                );
                ctx.set_step_output(step_id, output.clone())?;
                ctx.record_state(step_id, StepStatus::Completed, None);
                result.status = StepStatus::Completed;
                result.output_data = output;
                result.error = None;
                result.completed_at = Some(now);
                self.record_step(execution, ctx, result).await?;
                Ok(None)
            }
            StepStatus::Waiting => {
                result.status = StepStatus::Waiting;
                result.output_data = outcome.output_data;
                result.error = None;
                result.wake_at = outcome
                    .resume_after
                    .and_then(|after| chrono::Duration::from_std(after).ok())
                    .and_then(|after| now.checked_add_signed(after))
                    .map(|at| at.trunc_subsecs(3));
                ctx.record_state(step_id, StepStatus::Waiting, None);
                tracing::debug!(
                    execution_id = %execution.execution_id,
                    step_id,
                    wake_at = ?result.wake_at,
                    "step suspended"
                );
                self.record_step(execution, ctx, result).await?;
                Ok(None)
            }
            _ => {
                let error = outcome
                    .error
                    .unwrap_or_else(|| "step failed without an error message".to_string());
                tracing::warn!(
                    execution_id = %execution.execution_id,
                    step_id,
                    critical = step.critical,
                    attempts = result.attempts,
                    error = error.as_str(),
                    "step failed"
                );
                ctx.record_state(step_id, StepStatus::Failed, Some(error.clone()));
                result.status = StepStatus::Failed;
                result.output_data = Map::new();
                result.error = Some(error.clone());
                result.completed_at = Some(now);
                self.record_step(execution, ctx, result).await?;

                if outcome.timed_out {
                    Ok(Some((
                        ExecutionStatus::Timeout,
                        format!("step '{step_id}' timed out: {error}"),
                    )))
                } else if step.critical {
                    Ok(Some((
                        ExecutionStatus::Failed,
                        format!("step '{step_id}' failed: {error}"),
                    )))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Persist a step transition, then the context, then announce it.
    ///
    /// A terminal step can no longer be resumed, so its pending signal goes.
    async fn record_step(
        &self,
        execution: &mut Execution,
        ctx: &ExecutionContext,
        result: StepResult,
    ) -> Result<(), ExecutorError> {
        let execution_id = execution.execution_id;
        self.checkpoint.checkpoint_step(execution_id, &result).await?;

        let event = WorkflowEvent::StepStatusChanged {
            execution_id,
            step_id: result.step_id.clone(),
            status: result.status,
            error: result.error.clone(),
        };
        let terminal = result.status.is_terminal();
        let step_id = result.step_id.clone();
        execution.step_results.insert(step_id.clone(), result);

        if terminal {
            execution.context = ctx.to_json();
            self.checkpoint.checkpoint_execution(execution).await?;
            self.checkpoint.clear_signals(execution_id, Some(&step_id)).await?;
        }
        self.event_bus.publish(event);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Terminal transitions
    // -----------------------------------------------------------------------

    async fn suspend(
        &self,
        execution: &mut Execution,
        ctx: &ExecutionContext,
        waiting_steps: Vec<String>,
    ) -> Result<(), ExecutorError> {
        execution.status = ExecutionStatus::Waiting;
        execution.context = ctx.to_json();
        self.checkpoint.checkpoint_execution(execution).await?;
        tracing::info!(
            execution_id = %execution.execution_id,
            waiting = ?waiting_steps,
            "execution suspended"
        );
        self.event_bus.publish(WorkflowEvent::ExecutionSuspended {
            execution_id: execution.execution_id,
            waiting_steps,
        });
        Ok(())
    }

    /// Move an execution to a terminal status. Recorded step results are kept.
    pub async fn finish(
        &self,
        execution: &mut Execution,
        ctx: &ExecutionContext,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<(), ExecutorError> {
        if execution.status.is_terminal() {
            return Ok(());
        }
        execution.status = status;
        execution.error = error;
        execution.completed_at = Some(Utc::now());
        execution.context = ctx.to_json();
        self.checkpoint.checkpoint_execution(execution).await?;
        self.checkpoint.clear_signals(execution.execution_id, None).await?;
        self.cancellation_tokens.remove(&execution.execution_id);

        tracing::info!(
            execution_id = %execution.execution_id,
            status = ?status,
            error = execution.error.as_deref(),
            "execution finished"
        );
        self.event_bus.publish(WorkflowEvent::ExecutionFinished {
            execution_id: execution.execution_id,
            status,
            error: execution.error.clone(),
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Timeouts
    // -----------------------------------------------------------------------

    fn step_timeout(&self, step: &StepDefinition) -> Duration {
        Duration::from_secs(
            step.timeout_secs
                .unwrap_or(self.config.default_step_timeout_secs),
        )
    }

    /// Wall-clock deadline of an execution, if it has one.
    pub fn deadline(&self, execution: &Execution) -> Option<chrono::DateTime<Utc>> {
        let secs = execution
            .definition
            .timeout_secs
            .or(self.config.default_execution_timeout_secs)?;
        let started = execution.started_at.unwrap_or(execution.created_at);
        let secs = i64::try_from(secs).ok()?;
        started.checked_add_signed(chrono::Duration::try_seconds(secs)?)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Indices (in dispatch order) of steps that may be dispatched now.
///
/// Steps left `running` or `pending` by a crashed process are dispatched again.
fn ready_steps(execution: &Execution, order: &[usize]) -> Vec<usize> {
    let steps = &execution.definition.steps;
    order
        .iter()
        .copied()
        .filter(|&idx| {
            let step = &steps[idx];
            let undispatched = match execution.step_status(&step.step_id) {
                None | Some(StepStatus::Pending) | Some(StepStatus::Running) => true,
                Some(_) => false,
            };
            undispatched
                && step
                    .dependencies
                    .iter()
                    .all(|dep| dependency_satisfied(execution, dep))
        })
        .collect()
}

/// `completed` and `skipped` satisfy dependents; so does `failed` when the
/// failed step is non-critical.
fn dependency_satisfied(execution: &Execution, dep: &str) -> bool {
    match execution.step_status(dep) {
        Some(StepStatus::Completed) | Some(StepStatus::Skipped) => true,
        Some(StepStatus::Failed) => execution
            .definition
            .step(dep)
            .is_some_and(|step| !step.critical),
        _ => false,
    }
}

/// The trigger payload as a map, the fallback source for mappings.
fn trigger_input(ctx: &ExecutionContext) -> Map<String, Value> {
    match ctx.trigger_data() {
        Value::Object(fields) => fields.clone(),
        _ => Map::new(),
    }
}

/// Invoke a handler under its timeout and retry policy.
///
/// Returns the final outcome and the number of attempts made. Handler errors,
/// panics and timeouts all become failed outcomes. With `breakers`, every
/// attempt must pass the step type's circuit and is counted against it; an
/// open circuit fails the step without retrying.
pub(crate) async fn invoke_step(
    handler: Arc<dyn StepHandlerDyn>,
    step: &StepDefinition,
    input: Map<String, Value>,
    ctx: &ExecutionContext,
    timeout: Duration,
    breakers: Option<&StepBreakers>,
) -> (StepOutcome, u32) {
    let mut attempt = 0;
    loop {
        attempt += 1;
        if let Some(breakers) = breakers
            && !breakers.try_acquire(&step.step_type)
        {
            tracing::warn!(
                execution_id = %ctx.execution_id(),
                step_id = step.step_id.as_str(),
                step_type = step.step_type.as_str(),
                "circuit open, step not attempted"
            );
            let error = format!("circuit open for step type '{}'", step.step_type);
            return (StepOutcome::failed(error), attempt - 1);
        }
        let outcome = invoke_once(handler.as_ref(), step, input.clone(), ctx, timeout).await;
        if let Some(breakers) = breakers {
            record_attempt(breakers, &step.step_type, &outcome);
        }

        let retry = step
            .retry
            .as_ref()
            .filter(|policy| RetryHandler::should_retry(Some(policy), attempt));
        match retry {
            Some(policy) if outcome.status == StepStatus::Failed && !outcome.timed_out => {
                let delay = RetryHandler::backoff(policy, attempt);
                tracing::warn!(
                    execution_id = %ctx.execution_id(),
                    step_id = step.step_id.as_str(),
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = outcome.error.as_deref(),
                    "step attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            _ => return (outcome, attempt),
        }
    }
}

fn record_attempt(breakers: &StepBreakers, step_type: &str, outcome: &StepOutcome) {
    match outcome.status {
        StepStatus::Failed => {
            breakers.record_failure(step_type, outcome.error.as_deref().unwrap_or("step failed"));
        }
        _ => breakers.record_success(step_type),
    }
}

async fn invoke_once(
    handler: &dyn StepHandlerDyn,
    step: &StepDefinition,
    input: Map<String, Value>,
    ctx: &ExecutionContext,
    timeout: Duration,
) -> StepOutcome {
    let call = AssertUnwindSafe(handler.execute_boxed(step, input, ctx)).catch_unwind();
    match tokio::time::timeout(timeout, call).await {
        Err(_elapsed) => StepOutcome::failed("step timed out"),
        Ok(Err(panic)) => {
            StepOutcome::failed(format!("step handler panicked: {}", panic_message(&*panic)))
        }
        Ok(Ok(Err(e))) => StepOutcome::failed(e.to_string()),
        Ok(Ok(Ok(outcome))) => match outcome.status {
            StepStatus::Completed | StepStatus::Waiting | StepStatus::Failed
                if !outcome.is_consistent() =>
            {
                let reason = format!(
                    "handler returned success={} with status '{}'",
                    outcome.success, outcome.status
                );
                StepOutcome::failed(outcome.error.unwrap_or(reason))
            }
            StepStatus::Completed | StepStatus::Waiting | StepStatus::Failed => outcome,
            other => StepOutcome::failed(format!("handler returned invalid status '{other}'")),
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Replace an oversized output with a marker object.
fn truncate_output(
    output: Map<String, Value>,
    max_bytes: usize,
    execution_id: Uuid,
    step_id: &str,
) -> Map<String, Value> {
    let size = serde_json::to_vec(&output).map_or(0, |bytes| bytes.len());
    if size <= max_bytes {
        return output;
    }
    tracing::warn!(
        execution_id = %execution_id,
        step_id,
        size,
        max_bytes,
        "step output exceeds size limit, truncating"
    );
    match json!({
        "_truncated": true,
        "_original_size": size,
        "_message": format!("output of {size} bytes exceeds the {max_bytes} byte limit"),
    }) {
        Value::Object(marker) => marker,
        _ => Map::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryWorkflowRepository;
    use crate::workflow::breaker::CircuitState;
    use crate::workflow::registry::{StepCharacteristics, StepError, StepHandler};
    use std::sync::atomic::{AtomicU32, Ordering};
    use stepwise_types::workflow::{RetryPolicy, RetryStrategy};

    struct Flaky {
        calls: Arc<AtomicU32>,
        succeed_on: u32,
    }

    impl StepHandler for Flaky {
        async fn execute(
            &self,
            _step: &StepDefinition,
            _input: Map<String, Value>,
            _ctx: &ExecutionContext,
        ) -> Result<StepOutcome, StepError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call >= self.succeed_on {
                Ok(StepOutcome::completed(Map::new()))
            } else {
                Err(StepError::ExecutionFailed(format!("attempt {call}")))
            }
        }
    }

    struct Slow;

    impl StepHandler for Slow {
        async fn execute(
            &self,
            _step: &StepDefinition,
            _input: Map<String, Value>,
            _ctx: &ExecutionContext,
        ) -> Result<StepOutcome, StepError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(StepOutcome::completed(Map::new()))
        }
    }

    struct Panics;

    impl StepHandler for Panics {
        async fn execute(
            &self,
            _step: &StepDefinition,
            _input: Map<String, Value>,
            _ctx: &ExecutionContext,
        ) -> Result<StepOutcome, StepError> {
            panic!("handler exploded");
        }
    }

    /// Reports failure but claims the step completed.
    struct Contradicts;

    impl StepHandler for Contradicts {
        async fn execute(
            &self,
            _step: &StepDefinition,
            _input: Map<String, Value>,
            _ctx: &ExecutionContext,
        ) -> Result<StepOutcome, StepError> {
            let mut outcome = StepOutcome::completed(Map::new());
            outcome.success = false;
            Ok(outcome)
        }
    }

    fn engine(registry: StepRegistry) -> WorkflowEngine<InMemoryWorkflowRepository> {
        WorkflowEngine::new(
            Arc::new(InMemoryWorkflowRepository::new()),
            Arc::new(registry),
            EventBus::new(16),
            EngineConfig::default(),
        )
    }

    fn engine_with(
        registry: StepRegistry,
        config: EngineConfig,
    ) -> WorkflowEngine<InMemoryWorkflowRepository> {
        WorkflowEngine::new(
            Arc::new(InMemoryWorkflowRepository::new()),
            Arc::new(registry),
            EventBus::new(16),
            config,
        )
    }

    async fn run(
        engine: &WorkflowEngine<InMemoryWorkflowRepository>,
        def: WorkflowDefinition,
    ) -> Execution {
        let (mut execution, mut ctx) = engine
            .start(def, json!({}), UserContext::default(), None)
            .await
            .unwrap();
        let token = engine.cancellation_token(execution.execution_id);
        engine.drive(&mut execution, &mut ctx, &token).await.unwrap();
        execution
    }

    fn retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            strategy: RetryStrategy::FixedDelay,
            delay_ms: 1,
            max_delay_ms: 10,
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = StepRegistry::new();
        registry
            .register(
                "flaky",
                Flaky {
                    calls: Arc::clone(&calls),
                    succeed_on: 3,
                },
                StepCharacteristics::synchronous("fails twice"),
            )
            .unwrap();
        let engine = engine(registry);
        let mut step = StepDefinition::new("f", "flaky");
        step.retry = Some(retry(3));

        let execution = run(&engine, WorkflowDefinition::new("w", vec![step])).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(execution.step_results["f"].attempts, 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_fails_execution() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = StepRegistry::new();
        registry
            .register(
                "flaky",
                Flaky {
                    calls: Arc::clone(&calls),
                    succeed_on: 10,
                },
                StepCharacteristics::synchronous("always fails"),
            )
            .unwrap();
        let engine = engine(registry);
        let mut step = StepDefinition::new("f", "flaky");
        step.retry = Some(retry(1));

        let execution = run(&engine, WorkflowDefinition::new("w", vec![step])).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let error = execution.step_results["f"].error.clone().unwrap();
        assert!(error.contains("attempt 2"), "{error}");
        assert!(execution.error.unwrap().contains("step 'f' failed"));
    }

    #[tokio::test]
    async fn test_step_timeout_records_failure() {
        let mut registry = StepRegistry::new();
        registry
            .register("slow", Slow, StepCharacteristics::long_running("sleeps"))
            .unwrap();
        let engine = engine(registry);
        let mut step = StepDefinition::new("s", "slow");
        step.timeout_secs = Some(1);

        let execution = run(&engine, WorkflowDefinition::new("w", vec![step])).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(
            execution.step_results["s"].error.as_deref(),
            Some("step timed out")
        );
    }

    #[tokio::test]
    async fn test_panicking_handler_is_a_step_failure() {
        let mut registry = StepRegistry::new();
        registry
            .register("boom", Panics, StepCharacteristics::synchronous("panics"))
            .unwrap();
        let engine = engine(registry);
        let def = WorkflowDefinition::new("w", vec![StepDefinition::new("b", "boom").non_critical()]);

        let execution = run(&engine, def).await;
        assert_eq!(execution.status, ExecutionStatus::Completed);
        let error = execution.step_results["b"].error.clone().unwrap();
        assert!(error.contains("handler exploded"), "{error}");
    }

    #[tokio::test]
    async fn test_unsuccessful_completed_outcome_is_a_failure() {
        let mut registry = StepRegistry::new();
        registry
            .register("contradicts", Contradicts, StepCharacteristics::synchronous("lies"))
            .unwrap();
        let engine = engine(registry);
        let def = WorkflowDefinition::new(
            "w",
            vec![
                StepDefinition::new("c", "contradicts"),
                StepDefinition::new("after", "contradicts").depends_on(["c"]),
            ],
        );

        let execution = run(&engine, def).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.step_results["c"].status, StepStatus::Failed);
        let error = execution.step_results["c"].error.clone().unwrap();
        assert!(error.contains("success=false"), "{error}");
        assert!(!execution.step_results.contains_key("after"));
    }

    #[tokio::test]
    async fn test_unregistered_type_fails_before_dispatch() {
        let engine = engine(StepRegistry::new());
        let def = WorkflowDefinition::new("w", vec![StepDefinition::new("a", "ghost")]);
        let execution = run(&engine, def).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert!(execution.step_results.is_empty());
        assert!(execution.error.unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_dispatch() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = StepRegistry::new();
        registry
            .register(
                "ok",
                Flaky {
                    calls: Arc::clone(&calls),
                    succeed_on: 1,
                },
                StepCharacteristics::synchronous("ok"),
            )
            .unwrap();
        let engine = engine(registry);
        let def = WorkflowDefinition::new("w", vec![StepDefinition::new("a", "ok")]);
        let (mut execution, mut ctx) = engine
            .start(def, json!({}), UserContext::default(), None)
            .await
            .unwrap();
        let token = engine.cancellation_token(execution.execution_id);
        assert!(engine.cancel_token(execution.execution_id));

        engine.drive(&mut execution, &mut ctx, &token).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_truncate_output_replaces_large_values() {
        let big = json!({"blob": "x".repeat(200)}).as_object().cloned().unwrap();
        let small = json!({"n": 1}).as_object().cloned().unwrap();

        assert_eq!(truncate_output(small.clone(), 100, Uuid::nil(), "s"), small);
        let marker = truncate_output(big, 100, Uuid::nil(), "s");
        assert_eq!(marker["_truncated"], true);
        assert!(marker["_original_size"].as_u64().unwrap() > 200);
        assert!(!marker.contains_key("blob"));
    }

    #[test]
    fn test_check_resume_classification() {
        let def = WorkflowDefinition::new(
            "w",
            vec![
                StepDefinition::new("wait", "human_approval"),
                StepDefinition::new("done", "noop"),
                StepDefinition::new("later", "noop"),
            ],
        );
        let mut execution = Execution::pending(def, json!({}), UserContext::default(), None);
        execution.status = ExecutionStatus::Waiting;
        let mut waiting = StepResult::running("wait");
        waiting.status = StepStatus::Waiting;
        execution.step_results.insert("wait".into(), waiting);
        let mut done = StepResult::running("done");
        done.status = StepStatus::Completed;
        execution.step_results.insert("done".into(), done);

        type E = WorkflowEngine<InMemoryWorkflowRepository>;
        assert_eq!(E::check_resume(&execution, "wait").unwrap(), ResumeCheck::Proceed);
        assert_eq!(
            E::check_resume(&execution, "done").unwrap(),
            ResumeCheck::AlreadyTerminal
        );
        assert!(matches!(
            E::check_resume(&execution, "later"),
            Err(ExecutorError::InvalidResume { .. })
        ));
        assert!(E::check_resume(&execution, "nope").is_err());

        execution.status = ExecutionStatus::Cancelled;
        assert_eq!(
            E::check_resume(&execution, "wait").unwrap(),
            ResumeCheck::AlreadyTerminal
        );
    }

    #[test]
    fn test_deadline_from_definition_or_config() {
        let engine = engine(StepRegistry::new());
        let mut def = WorkflowDefinition::new("w", vec![StepDefinition::new("a", "noop")]);
        let execution = Execution::pending(def.clone(), json!({}), UserContext::default(), None);
        assert!(engine.deadline(&execution).is_none());

        def.timeout_secs = Some(60);
        let mut execution = Execution::pending(def, json!({}), UserContext::default(), None);
        let started = Utc::now();
        execution.started_at = Some(started);
        assert_eq!(
            engine.deadline(&execution),
            Some(started + chrono::Duration::seconds(60))
        );
    }

    #[tokio::test]
    async fn test_open_circuit_stops_retries_and_later_dispatches() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = StepRegistry::new();
        registry
            .register(
                "flaky",
                Flaky {
                    calls: Arc::clone(&calls),
                    succeed_on: u32::MAX,
                },
                StepCharacteristics::synchronous("always fails"),
            )
            .unwrap();
        let config = EngineConfig {
            circuit_breaker_threshold: 2,
            ..EngineConfig::default()
        };
        let engine = engine_with(registry, config);
        let mut step = StepDefinition::new("f", "flaky");
        step.retry = Some(retry(5));

        let first = run(&engine, WorkflowDefinition::new("wf", vec![step.clone()])).await;
        assert_eq!(first.status, ExecutionStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(first.step_results["f"].attempts, 2);
        assert!(
            first.step_results["f"]
                .error
                .as_deref()
                .unwrap()
                .contains("circuit open for step type 'flaky'")
        );

        let second = run(&engine, WorkflowDefinition::new("wf", vec![step])).await;
        assert_eq!(second.status, ExecutionStatus::Failed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let stats = engine.error_statistics(Some("flaky"));
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].state, CircuitState::Open);
        assert_eq!(stats[0].failures, 2);
        assert_eq!(stats[0].rejected, 2);
        assert_eq!(stats[0].last_error.as_deref(), Some("step execution failed: attempt 2"));
    }

    #[tokio::test]
    async fn test_error_statistics_count_successes_and_failures() {
        let mut registry = StepRegistry::new();
        registry
            .register("panics", Panics, StepCharacteristics::synchronous("panics"))
            .unwrap();
        registry
            .register(
                "flaky",
                Flaky {
                    calls: Arc::new(AtomicU32::new(0)),
                    succeed_on: 1,
                },
                StepCharacteristics::synchronous("succeeds"),
            )
            .unwrap();
        let engine = engine(registry);
        let def = WorkflowDefinition::new(
            "wf",
            vec![
                StepDefinition::new("ok", "flaky"),
                StepDefinition::new("boom", "panics").depends_on(["ok"]),
            ],
        );
        run(&engine, def).await;

        let stats = engine.error_statistics(None);
        assert_eq!(
            stats.iter().map(|s| s.step_type.as_str()).collect::<Vec<_>>(),
            vec!["flaky", "panics"]
        );
        assert_eq!((stats[0].attempts, stats[0].failures), (1, 0));
        assert_eq!((stats[1].attempts, stats[1].failures), (1, 1));
        assert_eq!(stats[1].state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_execution_analytics_over_stored_runs() {
        let mut registry = StepRegistry::new();
        registry
            .register("panics", Panics, StepCharacteristics::synchronous("panics"))
            .unwrap();
        registry
            .register(
                "flaky",
                Flaky {
                    calls: Arc::new(AtomicU32::new(0)),
                    succeed_on: 1,
                },
                StepCharacteristics::synchronous("succeeds"),
            )
            .unwrap();
        let engine = engine(registry);
        run(&engine, WorkflowDefinition::new("good", vec![StepDefinition::new("a", "flaky")])).await;
        run(&engine, WorkflowDefinition::new("good", vec![StepDefinition::new("a", "flaky")])).await;
        run(&engine, WorkflowDefinition::new("bad", vec![StepDefinition::new("b", "panics")])).await;

        let all = engine.execution_analytics(None).await.unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.completed, 2);
        assert_eq!(all.failed, 1);
        assert_eq!(all.by_status["completed"], 2);
        assert!(all.average_duration_secs.is_some());
        assert_eq!(all.failed_steps["b"], 1);

        let good = engine.execution_analytics(Some("good")).await.unwrap();
        assert_eq!(good.total, 2);
        assert_eq!(good.failed, 0);
    }
}
