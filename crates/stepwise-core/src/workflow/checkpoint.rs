//! Checkpoint manager for execution state.
//!
//! Wraps `WorkflowRepository` to provide a higher-level API for recording
//! execution progress. Every step transition (running -> waiting ->
//! completed/failed/skipped) is persisted before the scheduler makes its next
//! dispatch decision, so a crashed execution can be resumed from the last
//! recorded state instead of being restarted.

use std::sync::Arc;

use serde_json::Value;
use stepwise_types::workflow::{Execution, ExecutionStatus, StepResult, StepStatus};
use uuid::Uuid;

use crate::repository::workflow::WorkflowRepository;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages durable checkpoints for executions.
///
/// Generic over `R: WorkflowRepository` so it works with any storage backend
/// (SQLite, in-memory, etc.).
pub struct CheckpointManager<R: WorkflowRepository> {
    repo: Arc<R>,
}

impl<R: WorkflowRepository> CheckpointManager<R> {
    /// Create a new checkpoint manager backed by the given repository.
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Access the underlying repository.
    pub fn repo(&self) -> &R {
        &self.repo
    }

    // -----------------------------------------------------------------------
    // Execution-level checkpoints
    // -----------------------------------------------------------------------

    /// Persist a freshly created execution.
    pub async fn create_execution(&self, execution: &Execution) -> Result<(), CheckpointError> {
        self.repo
            .create_execution(execution)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            execution_id = %execution.execution_id,
            workflow_id = execution.workflow_id.as_str(),
            "checkpointed execution created"
        );
        Ok(())
    }

    /// Persist the execution's status, context, error and timestamps.
    pub async fn checkpoint_execution(&self, execution: &Execution) -> Result<(), CheckpointError> {
        self.repo
            .update_execution(execution)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            execution_id = %execution.execution_id,
            status = ?execution.status,
            "checkpointed execution status"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Step-level checkpoints
    // -----------------------------------------------------------------------

    /// Persist one step result.
    pub async fn checkpoint_step(
        &self,
        execution_id: Uuid,
        result: &StepResult,
    ) -> Result<(), CheckpointError> {
        self.repo
            .upsert_step_result(&execution_id, result)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;

        tracing::debug!(
            execution_id = %execution_id,
            step_id = result.step_id.as_str(),
            status = ?result.status,
            attempts = result.attempts,
            "checkpointed step"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Signals
    // -----------------------------------------------------------------------

    /// Persist a resume payload so it survives until a waiter consumes it.
    pub async fn store_signal(
        &self,
        execution_id: Uuid,
        step_id: &str,
        payload: &Value,
    ) -> Result<(), CheckpointError> {
        self.repo
            .put_signal(&execution_id, step_id, payload)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Consume the pending resume payload for a step, if any.
    pub async fn take_signal(
        &self,
        execution_id: Uuid,
        step_id: &str,
    ) -> Result<Option<Value>, CheckpointError> {
        self.repo
            .take_signal(&execution_id, step_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Discard signals nobody will consume: those of a step that reached a
    /// terminal status, or of every step when `step_id` is `None`.
    pub async fn clear_signals(
        &self,
        execution_id: Uuid,
        step_id: Option<&str>,
    ) -> Result<(), CheckpointError> {
        let cleared = self
            .repo
            .clear_signals(&execution_id, step_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        if cleared > 0 {
            tracing::debug!(
                execution_id = %execution_id,
                step_id,
                cleared,
                "discarded unconsumed signals"
            );
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Recovery helpers
    // -----------------------------------------------------------------------

    /// Load an execution, failing if it does not exist.
    pub async fn load_execution(&self, execution_id: Uuid) -> Result<Execution, CheckpointError> {
        self.find_execution(execution_id)
            .await?
            .ok_or(CheckpointError::ExecutionNotFound(execution_id))
    }

    pub async fn find_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<Execution>, CheckpointError> {
        self.repo
            .get_execution(&execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Executions a crashed process left `running` or `waiting`, oldest first.
    pub async fn unfinished_executions(&self) -> Result<Vec<Execution>, CheckpointError> {
        self.repo
            .list_executions_by_status(&[ExecutionStatus::Running, ExecutionStatus::Waiting])
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Get the IDs of steps that completed successfully.
    pub async fn get_completed_steps(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<String>, CheckpointError> {
        let results = self
            .repo
            .list_step_results(&execution_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        let mut completed: Vec<String> = results
            .into_iter()
            .filter(|r| r.status == StepStatus::Completed)
            .map(|r| r.step_id)
            .collect();
        completed.sort();
        Ok(completed)
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying repository operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    /// Execution not found (for load operations).
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryWorkflowRepository;
    use serde_json::json;
    use stepwise_types::workflow::{StepDefinition, UserContext, WorkflowDefinition};

    fn manager() -> CheckpointManager<InMemoryWorkflowRepository> {
        CheckpointManager::new(Arc::new(InMemoryWorkflowRepository::new()))
    }

    fn execution() -> Execution {
        let def = WorkflowDefinition::new("flow", vec![StepDefinition::new("a", "noop")]);
        Execution::pending(def, json!({}), UserContext::default(), None)
    }

    #[test]
    fn checkpoint_error_display() {
        let err = CheckpointError::Repository("connection lost".to_string());
        assert!(err.to_string().contains("connection lost"));

        let err = CheckpointError::ExecutionNotFound(Uuid::nil());
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn completed_steps_and_unfinished_executions() {
        let checkpoint = manager();
        let mut exec = execution();
        exec.status = ExecutionStatus::Running;
        checkpoint.create_execution(&exec).await.unwrap();

        let mut done = StepResult::running("a");
        done.status = StepStatus::Completed;
        checkpoint.checkpoint_step(exec.execution_id, &done).await.unwrap();
        checkpoint
            .checkpoint_step(exec.execution_id, &StepResult::running("b"))
            .await
            .unwrap();

        assert_eq!(
            checkpoint.get_completed_steps(exec.execution_id).await.unwrap(),
            vec!["a".to_string()]
        );
        assert_eq!(checkpoint.unfinished_executions().await.unwrap().len(), 1);

        exec.status = ExecutionStatus::Completed;
        checkpoint.checkpoint_execution(&exec).await.unwrap();
        assert!(checkpoint.unfinished_executions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_missing_execution_fails() {
        let checkpoint = manager();
        let err = checkpoint.load_execution(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, CheckpointError::ExecutionNotFound(_)));
    }

    #[tokio::test]
    async fn signals_round_trip_once() {
        let checkpoint = manager();
        let id = Uuid::now_v7();
        checkpoint
            .store_signal(id, "approval", &json!({"decision": "denied"}))
            .await
            .unwrap();
        assert!(checkpoint.take_signal(id, "approval").await.unwrap().is_some());
        assert!(checkpoint.take_signal(id, "approval").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_signals_drops_unconsumed() {
        let checkpoint = manager();
        let id = Uuid::now_v7();
        checkpoint.store_signal(id, "a", &json!({})).await.unwrap();
        checkpoint.store_signal(id, "b", &json!({})).await.unwrap();

        checkpoint.clear_signals(id, Some("a")).await.unwrap();
        assert!(checkpoint.take_signal(id, "a").await.unwrap().is_none());
        checkpoint.clear_signals(id, None).await.unwrap();
        assert!(checkpoint.take_signal(id, "b").await.unwrap().is_none());
    }
}
