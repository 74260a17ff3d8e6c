//! Durable backend.
//!
//! One driver task per execution runs it to a terminal status. A suspended
//! step parks the driver until a resume signal arrives, its wake-up time
//! passes, the execution deadline passes, or the execution is cancelled.
//! Signals are persisted before the driver is woken, so a signal sent while
//! no driver runs (or before the step suspends) is picked up later, and
//! `recover` restarts drivers for executions a previous process left behind.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::{self, FutureExt};
use serde_json::{Map, Value, json};
use stepwise_types::approval::ApprovalDecision;
use stepwise_types::config::EngineConfig;
use stepwise_types::workflow::{
    Execution, ExecutionStatus, ParentLink, StepStatus, UserContext, WorkflowDefinition,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
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
use super::signal::SignalHub;
use super::subflow::{SubflowLauncher, SubflowRequest, SubflowStatus, waiting_children};

type DriverDone = watch::Sender<Option<ExecutionStatus>>;

struct Inner<R: WorkflowRepository, A: ApprovalRepository> {
    engine: WorkflowEngine<R>,
    approvals: Arc<ApprovalService<A>>,
    hub: Arc<SignalHub>,
    /// Executions with a live driver in this process.
    drivers: DashMap<Uuid, DriverDone>,
}

/// Executor whose suspended steps block in a durable wait.
pub struct DurableExecutor<R: WorkflowRepository, A: ApprovalRepository> {
    inner: Arc<Inner<R, A>>,
}

impl<R: WorkflowRepository, A: ApprovalRepository> Clone for DurableExecutor<R, A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R, A> DurableExecutor<R, A>
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
                hub: Arc::new(SignalHub::new()),
                drivers: DashMap::new(),
            }),
        }
    }

    pub fn engine(&self) -> &WorkflowEngine<R> {
        &self.inner.engine
    }

    pub fn approvals(&self) -> &ApprovalService<A> {
        &self.inner.approvals
    }

    pub async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), ExecutorError> {
        self.inner.engine.save_definition(definition).await
    }

    /// Start a stored workflow by id and wait for it to finish.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        trigger_data: Value,
        user: UserContext,
    ) -> Result<ExecutionResult, ExecutorError> {
        let definition = self.inner.engine.definition(workflow_id).await?;
        self.execute(definition, trigger_data, user).await
    }

    /// Decide an approval request and signal the step that owns it.
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
        self.resume(request.execution_id, &request.step_id, Value::Object(signal))
            .await
    }

    /// Drive an existing execution to a terminal status.
    ///
    /// If a driver is already running it, waits for that driver instead.
    pub async fn continue_execution(&self, execution_id: Uuid) -> Result<ExecutionResult, ExecutorError> {
        if !self.claim(execution_id) {
            return self.wait(execution_id).await;
        }
        let loaded = self.inner.engine.load(execution_id).await;
        let (execution, ctx) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                self.release(execution_id, None);
                return Err(e);
            }
        };
        if execution.status.is_terminal() {
            self.release(execution_id, Some(execution.status));
            return Ok(ExecutionResult::new(&execution, ctx));
        }
        self.run_claimed(execution, ctx).await
    }

    /// Restart drivers for every execution left `running` or `waiting`.
    ///
    /// Returns the ids of the executions picked up.
    pub async fn recover(&self) -> Result<Vec<Uuid>, ExecutorError> {
        let unfinished = self.inner.engine.checkpoint().unfinished_executions().await?;
        let mut recovered = Vec::with_capacity(unfinished.len());
        for execution in unfinished {
            let execution_id = execution.execution_id;
            if !self.claim(execution_id) {
                continue;
            }
            let ctx = match ExecutionContext::restore(&execution) {
                Ok(ctx) => ctx,
                Err(e) => {
                    tracing::warn!(execution_id = %execution_id, error = %e, "cannot restore execution context");
                    self.release(execution_id, None);
                    continue;
                }
            };
            tracing::info!(
                execution_id = %execution_id,
                workflow_id = execution.workflow_id.as_str(),
                status = %execution.status,
                "recovering execution"
            );
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.run_claimed(execution, ctx).await {
                    tracing::error!(execution_id = %execution_id, error = %e, "recovered execution failed");
                }
            });
            recovered.push(execution_id);
        }
        Ok(recovered)
    }

    /// Wait for the live driver of an execution to finish, then return its
    /// latest snapshot. Returns immediately when no driver is running.
    pub async fn wait(&self, execution_id: Uuid) -> Result<ExecutionResult, ExecutorError> {
        let receiver = self
            .inner
            .drivers
            .get(&execution_id)
            .map(|done| done.subscribe());
        if let Some(mut receiver) = receiver {
            // A closed channel means the driver is gone; the snapshot below
            // reflects whatever it left behind.
            let _ = receiver.wait_for(Option::is_some).await;
        }
        self.inner.engine.snapshot(execution_id).await
    }

    // -----------------------------------------------------------------------
    // Driver
    // -----------------------------------------------------------------------

    fn launcher(&self) -> Arc<dyn SubflowLauncher> {
        Arc::new(self.clone())
    }

    fn claim(&self, execution_id: Uuid) -> bool {
        match self.inner.drivers.entry(execution_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(watch::channel(None).0);
                true
            }
        }
    }

    fn release(&self, execution_id: Uuid, status: Option<ExecutionStatus>) {
        if let Some((_, done)) = self.inner.drivers.remove(&execution_id) {
            done.send_replace(Some(status.unwrap_or(ExecutionStatus::Failed)));
        }
        self.inner.hub.clear(execution_id);
    }

    /// Run a claimed execution to the end, then release it.
    async fn run_claimed(
        &self,
        mut execution: Execution,
        ctx: ExecutionContext,
    ) -> Result<ExecutionResult, ExecutorError> {
        let execution_id = execution.execution_id;
        let mut ctx = ctx.with_launcher(self.launcher());
        let result = self.run_loop(&mut execution, &mut ctx).await;
        self.release(execution_id, Some(execution.status));
        result?;
        self.notify_parent(&execution).await;
        Ok(ExecutionResult::new(&execution, ctx))
    }

    async fn run_loop(
        &self,
        execution: &mut Execution,
        ctx: &mut ExecutionContext,
    ) -> Result<(), ExecutorError> {
        let engine = &self.inner.engine;
        let token = engine.cancellation_token(execution.execution_id);
        loop {
            if execution.status == ExecutionStatus::Waiting {
                self.await_wake(execution, ctx, &token).await?;
            }
            if execution.status.is_terminal() {
                return Ok(());
            }
            engine.drive(execution, ctx, &token).await?;
            if execution.status.is_terminal() {
                return Ok(());
            }
        }
    }

    /// Park until one waiting step can be resumed, then resume it.
    ///
    /// Returns without resuming anything when the execution is cancelled, its
    /// deadline passed, or no step is actually waiting; the next drive round
    /// handles those cases.
    async fn await_wake(
        &self,
        execution: &mut Execution,
        ctx: &mut ExecutionContext,
        token: &CancellationToken,
    ) -> Result<(), ExecutorError> {
        let engine = &self.inner.engine;
        let execution_id = execution.execution_id;
        let deadline = engine.deadline(execution);

        loop {
            let waiting = execution.waiting_steps();
            if waiting.is_empty() || token.is_cancelled() {
                return Ok(());
            }

            for step_id in &waiting {
                if let Some(signal) = engine.checkpoint().take_signal(execution_id, step_id).await? {
                    tracing::debug!(execution_id = %execution_id, step_id = step_id.as_str(), "resuming on signal");
                    return engine.resume_step(execution, ctx, step_id, signal).await;
                }
            }

            let now = Utc::now();
            let next_wake = waiting
                .iter()
                .filter_map(|id| execution.step_results.get(id).and_then(|r| r.wake_at).map(|at| (at, id)))
                .min();
            if let Some((wake_at, step_id)) = &next_wake
                && *wake_at <= now
            {
                tracing::debug!(execution_id = %execution_id, step_id = step_id.as_str(), "wake-up time reached");
                let step_id = step_id.to_string();
                return engine
                    .resume_step(execution, ctx, &step_id, json!({"timed_out": true}))
                    .await;
            }
            if deadline.is_some_and(|d| d <= now) {
                return Ok(());
            }

            let sleep_target = [next_wake.map(|(at, _)| at), deadline]
                .into_iter()
                .flatten()
                .min();
            let notifies: Vec<_> = waiting
                .iter()
                .map(|step_id| self.inner.hub.subscribe(execution_id, step_id))
                .collect();
            let signalled = future::select_all(notifies.iter().map(|n| n.notified().boxed()));

            tokio::select! {
                _ = signalled => {}
                _ = sleep_until(sleep_target) => {}
                _ = token.cancelled() => {}
            }
        }
    }

    /// Cancel one execution, stopping its driver if one runs here. Returns
    /// the children its waiting subflow steps were blocked on.
    async fn cancel_one(&self, execution_id: Uuid) -> Result<Vec<Uuid>, ExecutorError> {
        let engine = &self.inner.engine;
        let (mut execution, ctx) = engine.load(execution_id).await?;
        if execution.status.is_terminal() {
            return Ok(Vec::new());
        }
        engine.cancel_token(execution_id);
        if self.inner.drivers.contains_key(&execution_id) {
            self.wait(execution_id).await?;
            let stopped = engine.checkpoint().load_execution(execution_id).await?;
            return Ok(waiting_children(&stopped));
        }
        engine
            .finish(
                &mut execution,
                &ctx,
                ExecutionStatus::Cancelled,
                Some("execution cancelled".to_string()),
            )
            .await?;
        self.notify_parent(&execution).await;
        Ok(waiting_children(&execution))
    }

    /// Signal the parent step of a child that just terminated.
    async fn notify_parent(&self, execution: &Execution) {
        let Some(parent) = &execution.parent else {
            return;
        };
        if !execution.status.is_terminal() {
            return;
        }
        let parent_finished = self
            .inner
            .engine
            .checkpoint()
            .load_execution(parent.execution_id)
            .await
            .is_ok_and(|p| p.status.is_terminal());
        if parent_finished {
            return;
        }
        let stored = self
            .inner
            .engine
            .checkpoint()
            .store_signal(parent.execution_id, &parent.step_id, &Value::Object(Map::new()))
            .await;
        if let Err(e) = stored {
            tracing::warn!(
                execution_id = %execution.execution_id,
                parent_execution_id = %parent.execution_id,
                error = %e,
                "failed to signal parent execution"
            );
            return;
        }
        self.wake(parent.execution_id, &parent.step_id);
    }

    /// Notify the driver of a stored signal, starting one if none runs here.
    fn wake(&self, execution_id: Uuid, step_id: &str) {
        self.inner.hub.notify(execution_id, step_id);
        if self.inner.drivers.contains_key(&execution_id) {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.continue_execution(execution_id).await {
                tracing::error!(execution_id = %execution_id, error = %e, "driver failed");
            }
        });
    }

    /// Start a child execution and drive it until it first blocks. A child
    /// that suspends keeps running on its own driver.
    async fn start_child(
        &self,
        definition: WorkflowDefinition,
        trigger_data: Value,
        user: UserContext,
        parent: ParentLink,
    ) -> Result<SubflowStatus, ExecutorError> {
        let engine = &self.inner.engine;
        let (mut execution, ctx) = engine.start(definition, trigger_data, user, Some(parent)).await?;
        let mut ctx = ctx.with_launcher(self.launcher());
        let execution_id = execution.execution_id;

        if !execution.status.is_terminal() && self.claim(execution_id) {
            let token = engine.cancellation_token(execution_id);
            if let Err(e) = engine.drive(&mut execution, &mut ctx, &token).await {
                self.release(execution_id, Some(execution.status));
                return Err(e);
            }
            if execution.status.is_terminal() {
                self.release(execution_id, Some(execution.status));
            } else {
                let this = self.clone();
                let (child, child_ctx) = (execution.clone(), ctx.clone());
                tokio::spawn(async move {
                    if let Err(e) = this.run_claimed(child, child_ctx).await {
                        tracing::error!(execution_id = %execution_id, error = %e, "subflow driver failed");
                    }
                });
            }
        }
        Ok(subflow_status(&execution, &ctx))
    }
}

async fn sleep_until(at: Option<DateTime<Utc>>) {
    match at {
        Some(at) => {
            let delay = (at - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(delay).await;
        }
        None => future::pending::<()>().await,
    }
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

impl<R, A> WorkflowExecutor for DurableExecutor<R, A>
where
    R: WorkflowRepository + 'static,
    A: ApprovalRepository + 'static,
{
    /// Blocks until the execution reaches a terminal status.
    async fn execute(
        &self,
        definition: WorkflowDefinition,
        trigger_data: Value,
        user: UserContext,
    ) -> Result<ExecutionResult, ExecutorError> {
        let (execution, ctx) = self
            .inner
            .engine
            .start(definition, trigger_data, user, None)
            .await?;
        if execution.status.is_terminal() || !self.claim(execution.execution_id) {
            return Ok(ExecutionResult::new(&execution, ctx));
        }
        self.run_claimed(execution, ctx).await
    }

    /// Persists the signal and wakes the driver. Returns the snapshot taken
    /// before the step is resumed.
    async fn resume(
        &self,
        execution_id: Uuid,
        step_id: &str,
        decision: Value,
    ) -> Result<ExecutionResult, ExecutorError> {
        let engine = &self.inner.engine;
        let (execution, ctx) = engine.load(execution_id).await?;
        match WorkflowEngine::<R>::check_resume(&execution, step_id)? {
            ResumeCheck::AlreadyTerminal => {
                tracing::debug!(execution_id = %execution_id, step_id, "resume ignored, already terminal");
            }
            ResumeCheck::Proceed | ResumeCheck::Deferred => {
                engine
                    .checkpoint()
                    .store_signal(execution_id, step_id, &decision)
                    .await?;
                self.wake(execution_id, step_id);
            }
        }
        Ok(ExecutionResult::new(&execution, ctx))
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

impl<R, A> SubflowLauncher for DurableExecutor<R, A>
where
    R: WorkflowRepository + 'static,
    A: ApprovalRepository + 'static,
{
    fn launch<'a>(
        &'a self,
        request: SubflowRequest,
    ) -> Pin<Box<dyn Future<Output = Result<SubflowStatus, StepError>> + Send + 'a>> {
        Box::pin(async move {
            let engine = &self.inner.engine;
            let unavailable = |e: ExecutorError| StepError::Unavailable(e.to_string());
            if let Some(existing) = engine
                .find_child(&request.parent, &request.workflow_id)
                .await
                .map_err(unavailable)?
            {
                let ctx = ExecutionContext::restore(&existing)
                    .map_err(|e| StepError::Unavailable(e.to_string()))?;
                return Ok(subflow_status(&existing, &ctx));
            }
            let definition = match engine.definition(&request.workflow_id).await {
                Ok(definition) => definition,
                Err(ExecutorError::DefinitionNotFound(id)) => {
                    return Err(StepError::ExecutionFailed(format!(
                        "subflow workflow not found: {id}"
                    )));
                }
                Err(e) => return Err(unavailable(e)),
            };
            self.start_child(definition, request.trigger_data, request.user, request.parent)
                .await
                .map_err(unavailable)
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
