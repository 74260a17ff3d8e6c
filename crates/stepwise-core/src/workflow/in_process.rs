//! In-process backend.
//!
//! Each call drives an execution until it suspends or terminates, then returns
//! control to the caller. A suspended execution is continued by `resume`
//! (directly, through `submit_decision`, or from a wake-up timer). Calls for
//! the same execution are serialized by a per-execution lock; distinct
//! executions share nothing but the registry.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value, json};
use stepwise_types::approval::ApprovalDecision;
use stepwise_types::config::EngineConfig;
use stepwise_types::workflow::{
    Execution, ExecutionStatus, ParentLink, StepStatus, UserContext, WorkflowDefinition,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::approval::ApprovalRepository;
use crate::repository::workflow::WorkflowRepository;

use super::approval::ApprovalService;
use super::context::ExecutionContext;
use super::engine::{
    ExecutionResult, ExecutorError, ResumeCheck, WorkflowEngine, WorkflowExecutor,
};
use super::registry::{StepError, StepRegistry};
use super::subflow::{SubflowLauncher, SubflowRequest, SubflowStatus, waiting_children};

struct Inner<R: WorkflowRepository, A: ApprovalRepository> {
    engine: WorkflowEngine<R>,
    approvals: Arc<ApprovalService<A>>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    /// Scheduled wake-ups keyed by (execution_id, step_id).
    timers: DashMap<(Uuid, String), DateTime<Utc>>,
    /// Scheduled execution deadlines.
    deadlines: DashMap<Uuid, DateTime<Utc>>,
}

/// Executor that drives executions inside the calling task.
pub struct InProcessExecutor<R: WorkflowRepository, A: ApprovalRepository> {
    inner: Arc<Inner<R, A>>,
}

impl<R: WorkflowRepository, A: ApprovalRepository> Clone for InProcessExecutor<R, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, A> InProcessExecutor<R, A>
where
    R: WorkflowRepository + 'static,
    A: ApprovalRepository + 'static,
{
    pub fn new(
        repo: Arc<R>,
        approvals: Arc<ApprovalService<A>>,
        registry: Arc<StepRegistry>,
        event_bus: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine: WorkflowEngine::new(repo, registry, event_bus, config),
                approvals,
                locks: DashMap::new(),
                timers: DashMap::new(),
                deadlines: DashMap::new(),
            }),
        }
    }

    pub fn engine(&self) -> &WorkflowEngine<R> {
        &self.inner.engine
    }

    pub fn approvals(&self) -> &ApprovalService<A> {
        &self.inner.approvals
    }

    /// Validate and store a definition so it can be run by id or as a subflow.
    pub async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), ExecutorError> {
        self.inner.engine.save_definition(definition).await
    }

    /// Start a stored workflow by id.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        trigger_data: Value,
        user: UserContext,
    ) -> Result<ExecutionResult, ExecutorError> {
        let definition = self.inner.engine.definition(workflow_id).await?;
        self.execute(definition, trigger_data, user).await
    }

    /// Decide an approval request and resume the step that owns it.
    pub async fn submit_decision(
        &self,
        approval_id: Uuid,
        decision: ApprovalDecision,
        payload: Option<Value>,
        decided_by: Option<&str>,
    ) -> Result<ExecutionResult, ExecutorError> {
        let request = self
            .inner
            .approvals
            .decide(approval_id, decision, payload.clone(), decided_by)
            .await?;
        let mut signal = Map::new();
        signal.insert("decision".to_string(), json!(decision));
        signal.insert("payload".to_string(), payload.unwrap_or(Value::Null));
        self.resume_inner(request.execution_id, &request.step_id, Value::Object(signal), None)
            .await
    }

    /// Resume every approval step whose request expired without a decision.
    ///
    /// Returns the ids of the executions that were resumed.
    pub async fn sweep_expired_approvals(&self) -> Result<Vec<Uuid>, ExecutorError> {
        let expired = self.inner.approvals.expire_due(Utc::now()).await?;
        let mut resumed = Vec::new();
        for request in expired {
            let signal = json!({"timed_out": true});
            match self
                .resume_inner(request.execution_id, &request.step_id, signal, None)
                .await
            {
                Ok(_) => resumed.push(request.execution_id),
                Err(e @ (ExecutorError::InvalidResume { .. } | ExecutorError::NotFound(_))) => {
                    tracing::debug!(
                        approval_id = %request.approval_id,
                        error = %e,
                        "expired approval has no waiting step"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(resumed)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn execution_lock(&self, execution_id: Uuid) -> Arc<Mutex<()>> {
        self.inner
            .locks
            .entry(execution_id)
            .or_default()
            .value()
            .clone()
    }

    fn launcher(&self) -> Arc<dyn SubflowLauncher> {
        Arc::new(self.clone())
    }

    /// Start an execution and drive it as far as it goes.
    ///
    /// Does not notify a parent: a child started here is reported to its
    /// parent step through the launch result.
    async fn start_and_drive(
        &self,
        definition: WorkflowDefinition,
        trigger_data: Value,
        user: UserContext,
        parent: Option<ParentLink>,
    ) -> Result<ExecutionResult, ExecutorError> {
        let engine = &self.inner.engine;
        let (mut execution, ctx) = engine.start(definition, trigger_data, user, parent).await?;
        let mut ctx = ctx.with_launcher(self.launcher());
        let execution_id = execution.execution_id;

        let lock = self.execution_lock(execution_id);
        let guard = lock.lock().await;
        if !execution.status.is_terminal() {
            let token = engine.cancellation_token(execution_id);
            engine.drive(&mut execution, &mut ctx, &token).await?;
        }
        self.schedule_timers(&execution);
        drop(guard);
        self.release_if_terminal(&execution);
        Ok(ExecutionResult::new(&execution, ctx))
    }

    /// Resume a step under the execution lock.
    ///
    /// With `expected_wake` set (timer path) the step is only resumed if it is
    /// still waiting for that exact wake-up.
    async fn resume_inner(
        &self,
        execution_id: Uuid,
        step_id: &str,
        signal: Value,
        expected_wake: Option<DateTime<Utc>>,
    ) -> Result<ExecutionResult, ExecutorError> {
        let engine = &self.inner.engine;
        let lock = self.execution_lock(execution_id);
        let guard = lock.lock().await;

        let (mut execution, ctx) = engine.load(execution_id).await?;
        let mut ctx = ctx.with_launcher(self.launcher());

        if let Some(expected) = expected_wake {
            let current = execution.step_results.get(step_id);
            let still_due = current.is_some_and(|r| {
                r.status == StepStatus::Waiting && r.wake_at == Some(expected)
            });
            if execution.status.is_terminal() || !still_due {
                return Ok(ExecutionResult::new(&execution, ctx));
            }
        }

        match WorkflowEngine::<R>::check_resume(&execution, step_id)? {
            ResumeCheck::Proceed => {}
            ResumeCheck::AlreadyTerminal => {
                tracing::debug!(
                    execution_id = %execution_id,
                    step_id,
                    status = ?execution.status,
                    "resume ignored, already terminal"
                );
                return Ok(ExecutionResult::new(&execution, ctx));
            }
            ResumeCheck::Deferred => {
                return Err(ExecutorError::InvalidResume {
                    execution_id,
                    step_id: step_id.to_string(),
                    reason: "step is running".to_string(),
                });
            }
        }

        self.inner.timers.remove(&(execution_id, step_id.to_string()));
        engine
            .resume_step(&mut execution, &mut ctx, step_id, signal)
            .await?;
        if !execution.status.is_terminal() {
            let token = engine.cancellation_token(execution_id);
            engine.drive(&mut execution, &mut ctx, &token).await?;
        }
        self.schedule_timers(&execution);
        drop(guard);

        self.release_if_terminal(&execution);
        self.notify_parent(&execution).await;
        Ok(ExecutionResult::new(&execution, ctx))
    }

    /// Resume the parent step of a child that just terminated.
    fn notify_parent<'a>(
        &'a self,
        execution: &'a Execution,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let Some(parent) = &execution.parent else {
                return;
            };
            if !execution.status.is_terminal() {
                return;
            }
            tracing::debug!(
                execution_id = %execution.execution_id,
                parent_execution_id = %parent.execution_id,
                parent_step_id = parent.step_id.as_str(),
                "resuming parent of finished subflow"
            );
            let signal = Value::Object(Map::new());
            match self
                .resume_inner(parent.execution_id, &parent.step_id, signal, None)
                .await
            {
                Ok(_) | Err(ExecutorError::InvalidResume { .. }) => {}
                Err(e) => tracing::warn!(
                    execution_id = %execution.execution_id,
                    parent_execution_id = %parent.execution_id,
                    error = %e,
                    "failed to resume parent execution"
                ),
            }
        })
    }

    /// Spawn wake-up timers for waiting steps and the execution deadline.
    fn schedule_timers(&self, execution: &Execution) {
        if execution.status != ExecutionStatus::Waiting {
            return;
        }
        let execution_id = execution.execution_id;

        for result in execution.step_results.values() {
            let (StepStatus::Waiting, Some(wake_at)) = (result.status, result.wake_at) else {
                continue;
            };
            let key = (execution_id, result.step_id.clone());
            if self.inner.timers.insert(key, wake_at) == Some(wake_at) {
                continue;
            }
            let this = self.clone();
            let step_id = result.step_id.clone();
            tokio::spawn(async move {
                sleep_until(wake_at).await;
                let signal = json!({"timed_out": true});
                if let Err(e) = this
                    .resume_inner(execution_id, &step_id, signal, Some(wake_at))
                    .await
                {
                    tracing::warn!(
                        execution_id = %execution_id,
                        step_id = step_id.as_str(),
                        error = %e,
                        "wake-up resume failed"
                    );
                }
            });
        }

        if let Some(deadline) = self.inner.engine.deadline(execution)
            && self.inner.deadlines.insert(execution_id, deadline) != Some(deadline)
        {
            let this = self.clone();
            tokio::spawn(async move {
                sleep_until(deadline).await;
                if let Err(e) = this.enforce_deadline(execution_id).await {
                    tracing::warn!(execution_id = %execution_id, error = %e, "deadline check failed");
                }
            });
        }
    }

    /// Terminate a still-suspended execution whose deadline passed.
    async fn enforce_deadline(&self, execution_id: Uuid) -> Result<(), ExecutorError> {
        let engine = &self.inner.engine;
        let lock = self.execution_lock(execution_id);
        let guard = lock.lock().await;
        let (mut execution, ctx) = engine.load(execution_id).await?;
        if execution.status != ExecutionStatus::Waiting {
            return Ok(());
        }
        let mut ctx = ctx.with_launcher(self.launcher());
        let token = engine.cancellation_token(execution_id);
        engine.drive(&mut execution, &mut ctx, &token).await?;
        drop(guard);
        self.release_if_terminal(&execution);
        self.notify_parent(&execution).await;
        Ok(())
    }

    /// Cancel one execution. Returns the children its waiting subflow steps
    /// were blocked on.
    async fn cancel_one(&self, execution_id: Uuid) -> Result<Vec<Uuid>, ExecutorError> {
        let engine = &self.inner.engine;
        engine.cancel_token(execution_id);

        let lock = self.execution_lock(execution_id);
        let guard = lock.lock().await;
        let (mut execution, ctx) = engine.load(execution_id).await?;
        if execution.status.is_terminal() {
            return Ok(Vec::new());
        }
        engine
            .finish(
                &mut execution,
                &ctx,
                ExecutionStatus::Cancelled,
                Some("execution cancelled".to_string()),
            )
            .await?;
        drop(guard);
        self.release_if_terminal(&execution);
        self.notify_parent(&execution).await;
        Ok(waiting_children(&execution))
    }

    fn release_if_terminal(&self, execution: &Execution) {
        if !execution.status.is_terminal() {
            return;
        }
        let execution_id = execution.execution_id;
        self.inner.locks.remove(&execution_id);
        self.inner.deadlines.remove(&execution_id);
        self.inner.timers.retain(|(id, _), _| *id != execution_id);
    }
}

async fn sleep_until(at: DateTime<Utc>) {
    let delay = (at - Utc::now()).to_std().unwrap_or_default();
    tokio::time::sleep(delay).await;
}

fn subflow_status(execution: &Execution, ctx: &ExecutionContext) -> SubflowStatus {
    SubflowStatus {
        execution_id: execution.execution_id,
        status: execution.status,
        step_io_data: ctx.step_io_data().clone(),
        error: execution.error.clone(),
    }
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

impl<R, A> WorkflowExecutor for InProcessExecutor<R, A>
where
    R: WorkflowRepository + 'static,
    A: ApprovalRepository + 'static,
{
    async fn execute(
        &self,
        definition: WorkflowDefinition,
        trigger_data: Value,
        user: UserContext,
    ) -> Result<ExecutionResult, ExecutorError> {
        self.start_and_drive(definition, trigger_data, user, None).await
    }

    async fn resume(
        &self,
        execution_id: Uuid,
        step_id: &str,
        decision: Value,
    ) -> Result<ExecutionResult, ExecutorError> {
        self.resume_inner(execution_id, step_id, decision, None).await
    }

    /// Cancels the execution and every child subflow it is waiting on.
    async fn cancel(&self, execution_id: Uuid) -> Result<(), ExecutorError> {
        let mut children = self.cancel_one(execution_id).await?;
        while let Some(child) = children.pop() {
            match self.cancel_one(child).await {
                Ok(grandchildren) => children.extend(grandchildren),
                Err(e) => {
                    tracing::warn!(execution_id = %child, error = %e, "failed to cancel child execution");
                }
            }
        }
        Ok(())
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<Option<Execution>, ExecutorError> {
        self.inner.engine.get_execution(execution_id).await
    }

    async fn list_executions(
        &self,
        workflow_id: Option<&str>,
    ) -> Result<Vec<Execution>, ExecutorError> {
        self.inner.engine.list_executions(workflow_id).await
    }
}

// ---------------------------------------------------------------------------
// SubflowLauncher
// ---------------------------------------------------------------------------

impl<R, A> SubflowLauncher for InProcessExecutor<R, A>
where
    R: WorkflowRepository + 'static,
    A: ApprovalRepository + 'static,
{
    fn launch<'a>(
        &'a self,
        request: SubflowRequest,
    ) -> Pin<Box<dyn Future<Output = Result<SubflowStatus, StepError>> + Send + 'a>> {
        Box::pin(async move {
            let unavailable = |e: ExecutorError| StepError::Unavailable(e.to_string());
            if let Some(existing) = self
                .inner
                .engine
                .find_child(&request.parent, &request.workflow_id)
                .await
                .map_err(unavailable)?
            {
                let ctx = ExecutionContext::restore(&existing)
                    .map_err(|e| StepError::Unavailable(e.to_string()))?;
                return Ok(subflow_status(&existing, &ctx));
            }

            let definition = match self.inner.engine.definition(&request.workflow_id).await {
                Ok(definition) => definition,
                Err(ExecutorError::DefinitionNotFound(id)) => {
                    return Err(StepError::ExecutionFailed(format!(
                        "subflow workflow not found: {id}"
                    )));
                }
                Err(e) => return Err(unavailable(e)),
            };
            let result = self
                .start_and_drive(
                    definition,
                    request.trigger_data,
                    request.user,
                    Some(request.parent),
                )
                .await
                .map_err(unavailable)?;
            Ok(SubflowStatus {
                execution_id: result.execution_id,
                status: result.status,
                step_io_data: result.context.step_io_data().clone(),
                error: result.error,
            })
        })
    }

    fn inspect<'a>(
        &'a self,
        execution_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<SubflowStatus, StepError>> + Send + 'a>> {
        Box::pin(async move {
            let (execution, ctx) = self
                .inner
                .engine
                .load(execution_id)
                .await
                .map_err(|e| StepError::Unavailable(e.to_string()))?;
            Ok(subflow_status(&execution, &ctx))
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
