//! Execution context: the per-run data channel between steps.
//!
//! `ExecutionContext` holds the outputs recorded so far (`step_io_data`), the
//! trigger payload under a reserved key, the user/session identifiers, and the
//! definition being executed. Step output slots are write-once; the scheduler
//! is the only writer.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use stepwise_types::workflow::{
    Execution, StepStatus, TRIGGER_DATA_KEY, UserContext, WorkflowDefinition,
};
use uuid::Uuid;

use super::definition::WorkflowError;
use super::subflow::SubflowLauncher;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Serializable part of the context, persisted in `Execution::context`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ContextSnapshot {
    #[serde(default)]
    step_io_data: BTreeMap<String, Value>,
    #[serde(default)]
    depth: u32,
}

/// Status and error of a recorded step, as seen by conditions.
#[derive(Debug, Clone, PartialEq)]
pub struct StepState {
    pub status: StepStatus,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Mutable state of one execution, shared by reference with every handler call.
#[derive(Clone)]
pub struct ExecutionContext {
    execution_id: Uuid,
    workflow: Arc<WorkflowDefinition>,
    user: UserContext,
    step_io_data: BTreeMap<String, Value>,
    step_states: BTreeMap<String, StepState>,
    depth: u32,
    launcher: Option<Arc<dyn SubflowLauncher>>,
}

impl ExecutionContext {
    /// Create the context for a new execution. The trigger payload is stored
    /// under [`TRIGGER_DATA_KEY`].
    pub fn new(
        execution_id: Uuid,
        workflow: Arc<WorkflowDefinition>,
        trigger_data: Value,
        user: UserContext,
    ) -> Self {
        let mut step_io_data = BTreeMap::new();
        step_io_data.insert(TRIGGER_DATA_KEY.to_string(), trigger_data);
        Self {
            execution_id,
            workflow,
            user,
            step_io_data,
            step_states: BTreeMap::new(),
            depth: 0,
            launcher: None,
        }
    }

    /// Rebuild the context of a persisted execution.
    pub fn restore(execution: &Execution) -> Result<Self, WorkflowError> {
        let snapshot: ContextSnapshot = serde_json::from_value(execution.context.clone())
            .map_err(|e| WorkflowError::ContextError(format!("failed to restore context: {e}")))?;

        let mut step_io_data = snapshot.step_io_data;
        step_io_data
            .entry(TRIGGER_DATA_KEY.to_string())
            .or_insert_with(|| execution.trigger_data.clone());
        // A crash between the step-result write and the context write leaves
        // completed outputs only on the step result.
        for result in execution.step_results.values() {
            if result.status == StepStatus::Completed {
                step_io_data
                    .entry(result.step_id.clone())
                    .or_insert_with(|| Value::Object(result.output_data.clone()));
            }
        }

        let step_states = execution
            .step_results
            .values()
            .map(|r| {
                (
                    r.step_id.clone(),
                    StepState {
                        status: r.status,
                        error: r.error.clone(),
                    },
                )
            })
            .collect();

        Ok(Self {
            execution_id: execution.execution_id,
            workflow: Arc::new(execution.definition.clone()),
            user: execution.user.clone(),
            step_io_data,
            step_states,
            depth: snapshot.depth,
            launcher: None,
        })
    }

    /// Serialize the persisted part of the context for checkpointing.
    pub fn to_json(&self) -> Value {
        let snapshot = ContextSnapshot {
            step_io_data: self.step_io_data.clone(),
            depth: self.depth,
        };
        serde_json::to_value(snapshot).unwrap_or_else(|_| json!({}))
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn workflow(&self) -> &WorkflowDefinition {
        &self.workflow
    }

    pub fn user(&self) -> &UserContext {
        &self.user
    }

    /// Subflow nesting depth (0 for a top-level execution).
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    pub fn trigger_data(&self) -> &Value {
        self.step_io_data
            .get(TRIGGER_DATA_KEY)
            .unwrap_or(&Value::Null)
    }

    /// Workflow-global template variables.
    pub fn variables(&self) -> &Map<String, Value> {
        &self.workflow.variables
    }

    /// All recorded outputs keyed by step ID, plus the trigger payload.
    pub fn step_io_data(&self) -> &BTreeMap<String, Value> {
        &self.step_io_data
    }

    // -----------------------------------------------------------------------
    // Step outputs
    // -----------------------------------------------------------------------

    /// Output recorded for a step, if any.
    pub fn get_step_output(&self, step_id: &str) -> Option<&Value> {
        self.step_io_data.get(step_id)
    }

    /// Record a step's output. Each slot may be written once.
    pub fn set_step_output(
        &mut self,
        step_id: &str,
        output: Map<String, Value>,
    ) -> Result<(), WorkflowError> {
        if self.step_io_data.contains_key(step_id) {
            return Err(WorkflowError::OutputAlreadyRecorded(step_id.to_string()));
        }
        self.step_io_data
            .insert(step_id.to_string(), Value::Object(output));
        Ok(())
    }

    /// Track the latest status of a step for condition evaluation.
    pub fn record_state(&mut self, step_id: &str, status: StepStatus, error: Option<String>) {
        self.step_states
            .insert(step_id.to_string(), StepState { status, error });
    }

    pub fn step_state(&self, step_id: &str) -> Option<&StepState> {
        self.step_states.get(step_id)
    }

    /// JSON scope used by the condition evaluator.
    ///
    /// Shape:
    /// ```json
    /// {
    ///   "<step_id>": { "status": "...", "output": {..}, "error": null, ...output fields },
    ///   "trigger_data": <payload>,
    ///   "variables": { ... }
    /// }
    /// ```
    pub fn condition_scope(&self) -> Value {
        let mut scope = Map::new();
        for (key, value) in &self.step_io_data {
            scope.insert(key.clone(), value.clone());
        }
        for (step_id, state) in &self.step_states {
            let output = self
                .step_io_data
                .get(step_id)
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new()));
            let mut entry = match &output {
                Value::Object(fields) => fields.clone(),
                _ => Map::new(),
            };
            entry.insert("status".to_string(), json!(state.status.as_str()));
            entry.insert("output".to_string(), output);
            entry.insert("error".to_string(), json!(state.error));
            scope.insert(step_id.clone(), Value::Object(entry));
        }
        scope.insert(
            "variables".to_string(),
            Value::Object(self.workflow.variables.clone()),
        );
        Value::Object(scope)
    }

    // -----------------------------------------------------------------------
    // Subflow launcher
    // -----------------------------------------------------------------------

    /// Attach the backend that subflow handlers use to run child executions.
    pub fn with_launcher(mut self, launcher: Arc<dyn SubflowLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn launcher(&self) -> Option<&Arc<dyn SubflowLauncher>> {
        self.launcher.as_ref()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("execution_id", &self.execution_id)
            .field("workflow_id", &self.workflow.id)
            .field("user", &self.user)
            .field("step_io_data", &self.step_io_data.keys().collect::<Vec<_>>())
            .field("depth", &self.depth)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_types::workflow::{StepDefinition, StepResult};

    fn test_context() -> ExecutionContext {
        let def = WorkflowDefinition::new("ctx-test", vec![StepDefinition::new("a", "noop")]);
        ExecutionContext::new(
            Uuid::now_v7(),
            Arc::new(def),
            json!({"source": "chat", "text": "hi"}),
            UserContext::new("u-1", "s-1"),
        )
    }

    fn output(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_trigger_stored_under_reserved_key() {
        let ctx = test_context();
        assert_eq!(ctx.trigger_data()["text"], "hi");
        assert_eq!(ctx.get_step_output(TRIGGER_DATA_KEY).unwrap()["source"], "chat");
        assert_eq!(ctx.user().user_id.as_deref(), Some("u-1"));
    }

    #[test]
    fn test_step_output_is_write_once() {
        let mut ctx = test_context();
        ctx.set_step_output("a", output(json!({"n": 1}))).unwrap();
        let err = ctx.set_step_output("a", output(json!({"n": 2}))).unwrap_err();
        assert!(matches!(err, WorkflowError::OutputAlreadyRecorded(ref id) if id == "a"));
        assert_eq!(ctx.get_step_output("a").unwrap()["n"], 1);
    }

    #[test]
    fn test_trigger_slot_cannot_be_overwritten() {
        let mut ctx = test_context();
        assert!(ctx.set_step_output(TRIGGER_DATA_KEY, Map::new()).is_err());
    }

    #[test]
    fn test_condition_scope_shape() {
        let mut ctx = test_context();
        ctx.set_step_output("approval", output(json!({"decision": "approved"})))
            .unwrap();
        ctx.record_state("approval", StepStatus::Completed, None);
        ctx.record_state("skipped", StepStatus::Skipped, None);

        let scope = ctx.condition_scope();
        assert_eq!(scope["approval"]["output"]["decision"], "approved");
        assert_eq!(scope["approval"]["decision"], "approved");
        assert_eq!(scope["approval"]["status"], "completed");
        assert_eq!(scope["skipped"]["status"], "skipped");
        assert_eq!(scope[TRIGGER_DATA_KEY]["source"], "chat");
    }

    #[test]
    fn test_json_roundtrip_through_execution() {
        let mut ctx = test_context().with_depth(2);
        ctx.set_step_output("a", output(json!({"n": 1}))).unwrap();

        let mut execution = Execution::pending(
            ctx.workflow().clone(),
            ctx.trigger_data().clone(),
            ctx.user().clone(),
            None,
        );
        execution.execution_id = ctx.execution_id();
        execution.context = ctx.to_json();
        let mut result = StepResult::running("a");
        result.status = StepStatus::Completed;
        execution.step_results.insert("a".to_string(), result);

        let restored = ExecutionContext::restore(&execution).unwrap();
        assert_eq!(restored.execution_id(), ctx.execution_id());
        assert_eq!(restored.depth(), 2);
        assert_eq!(restored.get_step_output("a"), ctx.get_step_output("a"));
        assert_eq!(restored.trigger_data(), ctx.trigger_data());
        assert_eq!(
            restored.step_state("a").map(|s| s.status),
            Some(StepStatus::Completed)
        );
    }

    #[test]
    fn test_restore_backfills_completed_outputs() {
        let ctx = test_context();
        let mut execution = Execution::pending(
            ctx.workflow().clone(),
            json!({}),
            UserContext::default(),
            None,
        );
        let mut result = StepResult::running("a");
        result.status = StepStatus::Completed;
        result.output_data = output(json!({"n": 5}));
        execution.step_results.insert("a".to_string(), result);

        let restored = ExecutionContext::restore(&execution).unwrap();
        assert_eq!(restored.get_step_output("a").unwrap()["n"], 5);
    }

    #[test]
    fn test_restore_rejects_garbage_snapshot() {
        let ctx = test_context();
        let mut execution = Execution::pending(
            ctx.workflow().clone(),
            json!({}),
            UserContext::default(),
            None,
        );
        execution.context = json!({"step_io_data": "not a map"});
        assert!(ExecutionContext::restore(&execution).is_err());
    }
}
