//! Subflow invoker: runs a referenced workflow as a single step of a parent.
//!
//! The `subflow` handler does not know which backend is driving it. The
//! backend attaches a [`SubflowLauncher`] to every execution context before
//! dispatch, and the handler starts or inspects child executions through it.
//! A child that suspends makes the parent step wait; the backend resumes the
//! parent step once the child reaches a terminal status.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value, json};
use stepwise_types::workflow::{
    Execution, ExecutionStatus, ParentLink, StepDefinition, StepStatus, UserContext,
};
use uuid::Uuid;

use super::context::ExecutionContext;
use super::registry::{StepError, StepHandler, StepOutcome};
use super::variables::{lookup_path, resolve_mapping};

/// Partial-state key recording the child execution of a waiting subflow step.
pub const SUBFLOW_EXECUTION_KEY: &str = "subflow_execution_id";

/// Child executions that waiting subflow steps of `execution` are blocked on.
pub fn waiting_children(execution: &Execution) -> Vec<Uuid> {
    execution
        .step_results
        .values()
        .filter(|r| r.status == StepStatus::Waiting)
        .filter_map(|r| r.output_data.get(SUBFLOW_EXECUTION_KEY)?.as_str())
        .filter_map(|id| Uuid::parse_str(id).ok())
        .collect()
}

// ---------------------------------------------------------------------------
// Launcher boundary
// ---------------------------------------------------------------------------

/// A request to start a child execution.
#[derive(Debug, Clone)]
pub struct SubflowRequest {
    pub workflow_id: String,
    pub trigger_data: Value,
    pub user: UserContext,
    pub parent: ParentLink,
}

/// Snapshot of a child execution as seen by the parent step.
#[derive(Debug, Clone)]
pub struct SubflowStatus {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub step_io_data: BTreeMap<String, Value>,
    pub error: Option<String>,
}

/// Backend hook used by the `subflow` handler.
pub trait SubflowLauncher: Send + Sync {
    /// Start (or reattach to) the child execution for `request.parent` and
    /// drive it as far as the backend drives any execution.
    fn launch<'a>(
        &'a self,
        request: SubflowRequest,
    ) -> Pin<Box<dyn Future<Output = Result<SubflowStatus, StepError>> + Send + 'a>>;

    /// Current state of a child execution.
    fn inspect<'a>(
        &'a self,
        execution_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<SubflowStatus, StepError>> + Send + 'a>>;
}

// ---------------------------------------------------------------------------
// SubflowHandler
// ---------------------------------------------------------------------------

/// Handler for the `subflow` step type.
pub struct SubflowHandler {
    max_depth: u32,
}

impl SubflowHandler {
    pub fn new(max_depth: u32) -> Self {
        Self { max_depth }
    }

    fn mapping_param(
        step: &StepDefinition,
        key: &str,
    ) -> Result<Option<BTreeMap<String, String>>, StepError> {
        match step.parameters.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                StepError::InvalidParameters(format!("'{key}' must map names to paths: {e}"))
            }),
        }
    }

    /// Turn a child snapshot into this step's outcome.
    fn outcome(
        &self,
        step: &StepDefinition,
        workflow_id: &str,
        child: SubflowStatus,
    ) -> Result<StepOutcome, StepError> {
        match child.status {
            ExecutionStatus::Completed => {
                let child_data = Value::Object(child.step_io_data.into_iter().collect());
                let output_mapping = match Self::mapping_param(step, "output_mapping")? {
                    Some(mapping) => Some(mapping),
                    None => step.output_mapping.clone(),
                };
                let output = match output_mapping {
                    Some(mapping) => mapping
                        .into_iter()
                        .filter_map(|(key, path)| {
                            let segments: Vec<&str> = path.split('.').collect();
                            lookup_path(&child_data, &segments).map(|v| (key, v.clone()))
                        })
                        .collect(),
                    None => {
                        let mut output = match child_data {
                            Value::Object(map) => map,
                            _ => Map::new(),
                        };
                        output.insert(SUBFLOW_EXECUTION_KEY.to_string(), json!(child.execution_id));
                        output.insert("subflow_status".to_string(), json!(child.status));
                        output
                    }
                };
                Ok(StepOutcome::completed(output))
            }
            ExecutionStatus::Failed | ExecutionStatus::Cancelled | ExecutionStatus::Timeout => {
                Ok(StepOutcome::failed(format!(
                    "subflow '{workflow_id}' ended {}: {}",
                    child.status,
                    child.error.as_deref().unwrap_or("no error recorded")
                )))
            }
            ExecutionStatus::Pending | ExecutionStatus::Running | ExecutionStatus::Waiting => {
                let mut partial = Map::new();
                partial.insert(SUBFLOW_EXECUTION_KEY.to_string(), json!(child.execution_id));
                partial.insert("workflow_id".to_string(), json!(workflow_id));
                Ok(StepOutcome::waiting(partial))
            }
        }
    }
}

impl StepHandler for SubflowHandler {
    async fn execute(
        &self,
        step: &StepDefinition,
        mut input: Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<StepOutcome, StepError> {
        let workflow_id = step
            .parameters
            .get("workflow_id")
            .and_then(Value::as_str)
            .ok_or_else(|| StepError::InvalidParameters("'workflow_id' is required".to_string()))?
            .to_string();
        let launcher = ctx
            .launcher()
            .ok_or_else(|| StepError::Unavailable("no subflow launcher attached".to_string()))?;

        // Resumed call: the child already exists.
        if let Some(child_id) = input
            .remove(SUBFLOW_EXECUTION_KEY)
            .and_then(|v| v.as_str().and_then(|s| Uuid::parse_str(s).ok()))
        {
            let child = launcher.inspect(child_id).await?;
            return self.outcome(step, &workflow_id, child);
        }

        let depth = ctx.depth() + 1;
        if depth > self.max_depth {
            return Ok(StepOutcome::failed(format!(
                "subflow depth {depth} exceeds maximum {}",
                self.max_depth
            )));
        }

        let trigger_data = match Self::mapping_param(step, "input_mapping")? {
            Some(mapping) => resolve_mapping(&mapping, ctx, &input),
            None => input,
        };
        let inherit = step
            .parameters
            .get("inherit_context")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let user = if inherit {
            ctx.user().clone()
        } else {
            UserContext::default()
        };

        tracing::debug!(
            execution_id = %ctx.execution_id(),
            step_id = step.step_id.as_str(),
            workflow_id = workflow_id.as_str(),
            depth,
            "launching subflow"
        );

        let child = launcher
            .launch(SubflowRequest {
                workflow_id: workflow_id.clone(),
                trigger_data: Value::Object(trigger_data),
                user,
                parent: ParentLink {
                    execution_id: ctx.execution_id(),
                    step_id: step.step_id.clone(),
                    depth,
                },
            })
            .await?;
        self.outcome(step, &workflow_id, child)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use stepwise_types::workflow::{StepResult, WorkflowDefinition};

    /// Records launch requests and answers with a canned status.
    struct FakeLauncher {
        status: ExecutionStatus,
        requests: Mutex<Vec<SubflowRequest>>,
    }

    impl FakeLauncher {
        fn new(status: ExecutionStatus) -> Arc<Self> {
            Arc::new(Self {
                status,
                requests: Mutex::new(Vec::new()),
            })
        }

        fn snapshot(&self, execution_id: Uuid, text: &str) -> SubflowStatus {
            let mut step_io_data = BTreeMap::new();
            step_io_data.insert("trigger_data".to_string(), json!({"text": text}));
            step_io_data.insert("upper".to_string(), json!({"text": text.to_uppercase()}));
            step_io_data.insert("scratch".to_string(), json!({"internal": true}));
            SubflowStatus {
                execution_id,
                status: self.status,
                step_io_data,
                error: (self.status == ExecutionStatus::Failed).then(|| "boom".to_string()),
            }
        }
    }

    impl SubflowLauncher for FakeLauncher {
        fn launch<'a>(
            &'a self,
            request: SubflowRequest,
        ) -> Pin<Box<dyn Future<Output = Result<SubflowStatus, StepError>> + Send + 'a>> {
            Box::pin(async move {
                let text = request.trigger_data["text"].as_str().unwrap_or("").to_string();
                self.requests.lock().unwrap().push(request);
                Ok(self.snapshot(Uuid::now_v7(), &text))
            })
        }

        fn inspect<'a>(
            &'a self,
            execution_id: Uuid,
        ) -> Pin<Box<dyn Future<Output = Result<SubflowStatus, StepError>> + Send + 'a>> {
            Box::pin(async move { Ok(self.snapshot(execution_id, "later")) })
        }
    }

    fn context(launcher: Arc<FakeLauncher>) -> ExecutionContext {
        let def = WorkflowDefinition::new("parent", vec![StepDefinition::new("sub", "subflow")]);
        ExecutionContext::new(
            Uuid::now_v7(),
            Arc::new(def),
            json!({"messages": {"current_message": "hello"}}),
            UserContext::new("u-1", "s-1"),
        )
        .with_launcher(launcher)
    }

    fn subflow_step() -> StepDefinition {
        StepDefinition::new("sub", "subflow")
            .param("workflow_id", json!("uppercase"))
            .param(
                "input_mapping",
                json!({"text": "trigger_data.messages.current_message"}),
            )
            .param("output_mapping", json!({"text": "upper.text"}))
    }

    #[tokio::test]
    async fn test_output_mapping_exposes_only_mapped_values() {
        let launcher = FakeLauncher::new(ExecutionStatus::Completed);
        let ctx = context(Arc::clone(&launcher));
        let outcome = SubflowHandler::new(5)
            .execute(&subflow_step(), Map::new(), &ctx)
            .await
            .unwrap();

        assert_eq!(outcome.status, StepStatus::Completed);
        assert_eq!(Value::Object(outcome.output_data), json!({"text": "HELLO"}));

        let requests = launcher.requests.lock().unwrap();
        assert_eq!(requests[0].trigger_data, json!({"text": "hello"}));
        assert_eq!(requests[0].parent.depth, 1);
        assert_eq!(requests[0].user, UserContext::default(), "isolated by default");
    }

    #[tokio::test]
    async fn test_inherit_context_shares_user() {
        let launcher = FakeLauncher::new(ExecutionStatus::Completed);
        let ctx = context(Arc::clone(&launcher));
        let step = subflow_step().param("inherit_context", json!(true));
        SubflowHandler::new(5)
            .execute(&step, Map::new(), &ctx)
            .await
            .unwrap();
        let requests = launcher.requests.lock().unwrap();
        assert_eq!(requests[0].user.user_id.as_deref(), Some("u-1"));
    }

    #[tokio::test]
    async fn test_without_output_mapping_exposes_child_data() {
        let launcher = FakeLauncher::new(ExecutionStatus::Completed);
        let ctx = context(launcher);
        let step = StepDefinition::new("sub", "subflow").param("workflow_id", json!("uppercase"));
        let input = json!({"text": "hi"}).as_object().cloned().unwrap();
        let outcome = SubflowHandler::new(5).execute(&step, input, &ctx).await.unwrap();
        assert_eq!(outcome.output_data["upper"]["text"], "HI");
        assert_eq!(outcome.output_data["subflow_status"], "completed");
        assert!(outcome.output_data.contains_key(SUBFLOW_EXECUTION_KEY));
    }

    #[tokio::test]
    async fn test_child_failure_is_step_failure() {
        let launcher = FakeLauncher::new(ExecutionStatus::Failed);
        let ctx = context(launcher);
        let outcome = SubflowHandler::new(5)
            .execute(&subflow_step(), Map::new(), &ctx)
            .await
            .unwrap();
        assert_eq!(outcome.status, StepStatus::Failed);
        assert!(outcome.error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_waiting_child_suspends_then_resumes() {
        let launcher = FakeLauncher::new(ExecutionStatus::Waiting);
        let ctx = context(launcher);
        let handler = SubflowHandler::new(5);
        let outcome = handler
            .execute(&subflow_step(), Map::new(), &ctx)
            .await
            .unwrap();
        assert_eq!(outcome.status, StepStatus::Waiting);
        let child_id = outcome.output_data[SUBFLOW_EXECUTION_KEY].clone();

        // Resumed call inspects the recorded child instead of launching again.
        let completed = FakeLauncher::new(ExecutionStatus::Completed);
        let ctx = context(Arc::clone(&completed));
        let mut input = Map::new();
        input.insert(SUBFLOW_EXECUTION_KEY.to_string(), child_id);
        let outcome = handler.execute(&subflow_step(), input, &ctx).await.unwrap();
        assert_eq!(outcome.status, StepStatus::Completed);
        assert_eq!(outcome.output_data["text"], "LATER");
        assert!(completed.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let launcher = FakeLauncher::new(ExecutionStatus::Completed);
        let ctx = context(launcher).with_depth(2);
        let outcome = SubflowHandler::new(2)
            .execute(&subflow_step(), Map::new(), &ctx)
            .await
            .unwrap();
        assert_eq!(outcome.status, StepStatus::Failed);
        assert!(outcome.error.unwrap().contains("exceeds maximum"));
    }

    #[tokio::test]
    async fn test_missing_workflow_id_is_an_error() {
        let launcher = FakeLauncher::new(ExecutionStatus::Completed);
        let ctx = context(launcher);
        let step = StepDefinition::new("sub", "subflow");
        let err = SubflowHandler::new(5)
            .execute(&step, Map::new(), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::InvalidParameters(_)));
    }

    #[test]
    fn test_waiting_children_lists_blocked_subflows() {
        let def = WorkflowDefinition::new("parent", vec![StepDefinition::new("sub", "subflow")]);
        let mut execution = Execution::pending(def, json!({}), UserContext::default(), None);
        let child = Uuid::now_v7();

        let mut waiting = StepResult::running("sub");
        waiting.status = StepStatus::Waiting;
        waiting
            .output_data
            .insert(SUBFLOW_EXECUTION_KEY.to_string(), json!(child));
        execution.step_results.insert("sub".to_string(), waiting);

        let mut done = StepResult::running("other");
        done.status = StepStatus::Completed;
        done.output_data
            .insert(SUBFLOW_EXECUTION_KEY.to_string(), json!(Uuid::now_v7()));
        execution.step_results.insert("other".to_string(), done);

        assert_eq!(waiting_children(&execution), vec![child]);
    }
}
