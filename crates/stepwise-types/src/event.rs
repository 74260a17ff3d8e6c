//! Lifecycle events emitted by the workflow engine.
//!
//! `WorkflowEvent` is broadcast on the engine's event bus. All variants are
//! Clone + Send + Sync for use with tokio broadcast channels; delivery to UI
//! or observability sinks is the subscriber's concern.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{ExecutionStatus, StepStatus};

/// Events emitted while driving an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// The scheduler began dispatching an execution.
    ExecutionStarted {
        execution_id: Uuid,
        workflow_id: String,
        /// Set for subflow executions.
        parent_execution_id: Option<Uuid>,
    },

    /// A step result changed status.
    StepStatusChanged {
        execution_id: Uuid,
        step_id: String,
        status: StepStatus,
        /// Error text for `failed` transitions.
        error: Option<String>,
    },

    /// The execution has no progressable step and is waiting on external input.
    ExecutionSuspended {
        execution_id: Uuid,
        waiting_steps: Vec<String>,
    },

    /// The execution reached a terminal status.
    ExecutionFinished {
        execution_id: Uuid,
        status: ExecutionStatus,
        error: Option<String>,
    },
}

impl WorkflowEvent {
    /// Execution this event belongs to.
    pub fn execution_id(&self) -> Uuid {
        match self {
            WorkflowEvent::ExecutionStarted { execution_id, .. }
            | WorkflowEvent::StepStatusChanged { execution_id, .. }
            | WorkflowEvent::ExecutionSuspended { execution_id, .. }
            | WorkflowEvent::ExecutionFinished { execution_id, .. } => *execution_id,
        }
    }

    /// Step this event belongs to, if any.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            WorkflowEvent::StepStatusChanged { step_id, .. } => Some(step_id),
            _ => None,
        }
    }
}
