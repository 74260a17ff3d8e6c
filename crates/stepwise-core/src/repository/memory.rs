//! In-memory repository implementations backed by `DashMap`.
//!
//! Suitable for tests and for embedding the engine in a single process where
//! crash recovery is not needed. Cloning shares the underlying maps.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use stepwise_types::approval::{ApprovalDecision, ApprovalRequest};
use stepwise_types::error::RepositoryError;
use stepwise_types::workflow::{Execution, ExecutionStatus, StepResult, WorkflowDefinition};
use uuid::Uuid;

use super::approval::ApprovalRepository;
use super::workflow::WorkflowRepository;

// ---------------------------------------------------------------------------
// InMemoryWorkflowRepository
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct InMemoryWorkflowRepository {
    definitions: Arc<DashMap<String, WorkflowDefinition>>,
    /// Execution rows without their step results.
    executions: Arc<DashMap<Uuid, Execution>>,
    step_results: Arc<DashMap<Uuid, BTreeMap<String, StepResult>>>,
    signals: Arc<DashMap<(Uuid, String), Value>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn assemble(&self, row: &Execution) -> Execution {
        let mut execution = row.clone();
        execution.step_results = self
            .step_results
            .get(&row.execution_id)
            .map(|r| r.value().clone())
            .unwrap_or_default();
        execution
    }
}

impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.definitions.insert(def.id.clone(), def.clone());
        Ok(())
    }

    async fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.definitions.get(id).map(|d| d.value().clone()))
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut defs: Vec<_> = self.definitions.iter().map(|d| d.value().clone()).collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(defs)
    }

    async fn delete_definition(&self, id: &str) -> Result<bool, RepositoryError> {
        Ok(self.definitions.remove(id).is_some())
    }

    async fn create_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        if self.executions.contains_key(&execution.execution_id) {
            return Err(RepositoryError::Conflict(format!(
                "execution {} already exists",
                execution.execution_id
            )));
        }
        let mut row = execution.clone();
        let results = std::mem::take(&mut row.step_results);
        self.step_results.insert(execution.execution_id, results);
        self.executions.insert(execution.execution_id, row);
        Ok(())
    }

    async fn update_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let mut row = self
            .executions
            .get_mut(&execution.execution_id)
            .ok_or(RepositoryError::NotFound)?;
        row.status = execution.status;
        row.context = execution.context.clone();
        row.error = execution.error.clone();
        row.started_at = execution.started_at;
        row.completed_at = execution.completed_at;
        Ok(())
    }

    async fn get_execution(&self, execution_id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        let row = self.executions.get(execution_id).map(|r| r.value().clone());
        Ok(row.map(|r| self.assemble(&r)))
    }

    async fn list_executions(
        &self,
        workflow_id: Option<&str>,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let rows: Vec<Execution> = self
            .executions
            .iter()
            .filter(|e| workflow_id.is_none_or(|id| e.workflow_id == id))
            .map(|e| e.value().clone())
            .collect();
        let mut executions: Vec<_> = rows.iter().map(|r| self.assemble(r)).collect();
        executions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(executions)
    }

    async fn list_executions_by_status(
        &self,
        statuses: &[ExecutionStatus],
    ) -> Result<Vec<Execution>, RepositoryError> {
        let rows: Vec<Execution> = self
            .executions
            .iter()
            .filter(|e| statuses.contains(&e.status))
            .map(|e| e.value().clone())
            .collect();
        let mut executions: Vec<_> = rows.iter().map(|r| self.assemble(r)).collect();
        executions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(executions)
    }

    async fn upsert_step_result(
        &self,
        execution_id: &Uuid,
        result: &StepResult,
    ) -> Result<(), RepositoryError> {
        let mut results = self
            .step_results
            .get_mut(execution_id)
            .ok_or(RepositoryError::NotFound)?;
        results.insert(result.step_id.clone(), result.clone());
        Ok(())
    }

    async fn list_step_results(&self, execution_id: &Uuid) -> Result<Vec<StepResult>, RepositoryError> {
        Ok(self
            .step_results
            .get(execution_id)
            .map(|r| r.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn put_signal(
        &self,
        execution_id: &Uuid,
        step_id: &str,
        payload: &Value,
    ) -> Result<(), RepositoryError> {
        self.signals
            .insert((*execution_id, step_id.to_string()), payload.clone());
        Ok(())
    }

    async fn take_signal(
        &self,
        execution_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<Value>, RepositoryError> {
        Ok(self
            .signals
            .remove(&(*execution_id, step_id.to_string()))
            .map(|(_, v)| v))
    }

    async fn clear_signals(
        &self,
        execution_id: &Uuid,
        step_id: Option<&str>,
    ) -> Result<u64, RepositoryError> {
        let before = self.signals.len();
        self.signals.retain(|(id, step), _| {
            id != execution_id || step_id.is_some_and(|s| s != step.as_str())
        });
        Ok((before - self.signals.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// InMemoryApprovalRepository
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct InMemoryApprovalRepository {
    requests: Arc<DashMap<Uuid, ApprovalRequest>>,
}

impl InMemoryApprovalRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ApprovalRepository for InMemoryApprovalRepository {
    async fn create_approval(&self, request: &ApprovalRequest) -> Result<(), RepositoryError> {
        if self.requests.contains_key(&request.approval_id) {
            return Err(RepositoryError::Conflict(format!(
                "approval {} already exists",
                request.approval_id
            )));
        }
        self.requests.insert(request.approval_id, request.clone());
        Ok(())
    }

    async fn get_approval(&self, approval_id: &Uuid) -> Result<Option<ApprovalRequest>, RepositoryError> {
        Ok(self.requests.get(approval_id).map(|r| r.value().clone()))
    }

    async fn find_approval_for_step(
        &self,
        execution_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        Ok(self
            .requests
            .iter()
            .filter(|r| r.execution_id == *execution_id && r.step_id == step_id)
            .max_by_key(|r| (r.requested_at, r.approval_id))
            .map(|r| r.value().clone()))
    }

    async fn list_approvals(
        &self,
        execution_id: Option<&Uuid>,
        decision: Option<ApprovalDecision>,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let mut requests: Vec<_> = self
            .requests
            .iter()
            .filter(|r| execution_id.is_none_or(|id| r.execution_id == *id))
            .filter(|r| decision.is_none_or(|d| r.decision == d))
            .map(|r| r.value().clone())
            .collect();
        requests.sort_by_key(|r| (r.requested_at, r.approval_id));
        Ok(requests)
    }

    async fn record_decision(
        &self,
        approval_id: &Uuid,
        decision: ApprovalDecision,
        payload: Option<&Value>,
        decided_by: Option<&str>,
        decided_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut request = self
            .requests
            .get_mut(approval_id)
            .ok_or(RepositoryError::NotFound)?;
        if !request.is_pending() {
            return Ok(false);
        }
        request.decision = decision;
        request.payload = payload.cloned();
        request.decided_by = decided_by.map(str::to_string);
        request.decided_at = Some(decided_at);
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_types::workflow::{StepDefinition, StepStatus, UserContext};

    fn execution(workflow_id: &str) -> Execution {
        let def = WorkflowDefinition::new(workflow_id, vec![StepDefinition::new("a", "noop")]);
        Execution::pending(def, json!({"n": 1}), UserContext::default(), None)
    }

    #[tokio::test]
    async fn test_execution_lifecycle() {
        let repo = InMemoryWorkflowRepository::new();
        let mut exec = execution("flow");
        exec.step_results
            .insert("a".to_string(), StepResult::running("a"));
        repo.create_execution(&exec).await.unwrap();
        assert!(repo.create_execution(&exec).await.is_err());

        exec.status = ExecutionStatus::Waiting;
        exec.context = json!({"step_io_data": {}});
        repo.update_execution(&exec).await.unwrap();

        let mut result = StepResult::running("a");
        result.status = StepStatus::Waiting;
        repo.upsert_step_result(&exec.execution_id, &result).await.unwrap();

        let loaded = repo.get_execution(&exec.execution_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Waiting);
        assert_eq!(loaded.step_status("a"), Some(StepStatus::Waiting));

        let waiting = repo
            .list_executions_by_status(&[ExecutionStatus::Running, ExecutionStatus::Waiting])
            .await
            .unwrap();
        assert_eq!(waiting.len(), 1);
    }

    #[tokio::test]
    async fn test_update_unknown_execution_is_not_found() {
        let repo = InMemoryWorkflowRepository::new();
        let exec = execution("flow");
        assert!(matches!(
            repo.update_execution(&exec).await,
            Err(RepositoryError::NotFound)
        ));
        assert!(repo.get_execution(&exec.execution_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_executions_filters_by_workflow() {
        let repo = InMemoryWorkflowRepository::new();
        repo.create_execution(&execution("a")).await.unwrap();
        repo.create_execution(&execution("a")).await.unwrap();
        repo.create_execution(&execution("b")).await.unwrap();
        assert_eq!(repo.list_executions(Some("a")).await.unwrap().len(), 2);
        assert_eq!(repo.list_executions(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_signals_are_consumed_once() {
        let repo = InMemoryWorkflowRepository::new();
        let id = Uuid::now_v7();
        repo.put_signal(&id, "approval", &json!({"decision": "approved"}))
            .await
            .unwrap();
        let first = repo.take_signal(&id, "approval").await.unwrap();
        assert_eq!(first.unwrap()["decision"], "approved");
        assert!(repo.take_signal(&id, "approval").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_signals_by_step_and_execution() {
        let repo = InMemoryWorkflowRepository::new();
        let id = Uuid::now_v7();
        let other = Uuid::now_v7();
        for (execution, step) in [(id, "a"), (id, "b"), (id, "c"), (other, "a")] {
            repo.put_signal(&execution, step, &json!({})).await.unwrap();
        }

        assert_eq!(repo.clear_signals(&id, Some("a")).await.unwrap(), 1);
        assert!(repo.take_signal(&id, "a").await.unwrap().is_none());
        assert_eq!(repo.clear_signals(&id, None).await.unwrap(), 2);
        assert!(repo.take_signal(&id, "b").await.unwrap().is_none());
        assert!(repo.take_signal(&other, "a").await.unwrap().is_some());
        assert_eq!(repo.clear_signals(&id, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_definitions_crud() {
        let repo = InMemoryWorkflowRepository::new();
        let def = WorkflowDefinition::new("flow", vec![StepDefinition::new("a", "noop")]);
        repo.save_definition(&def).await.unwrap();
        assert_eq!(repo.get_definition("flow").await.unwrap(), Some(def));
        assert_eq!(repo.list_definitions().await.unwrap().len(), 1);
        assert!(repo.delete_definition("flow").await.unwrap());
        assert!(!repo.delete_definition("flow").await.unwrap());
    }

    #[tokio::test]
    async fn test_decision_recorded_once() {
        let repo = InMemoryApprovalRepository::new();
        let request = ApprovalRequest::new(Uuid::now_v7(), "approval", "ok?", None);
        repo.create_approval(&request).await.unwrap();

        let first = repo
            .record_decision(
                &request.approval_id,
                ApprovalDecision::Approved,
                Some(&json!({"note": "fine"})),
                Some("alice"),
                Utc::now(),
            )
            .await
            .unwrap();
        assert!(first);
        let second = repo
            .record_decision(&request.approval_id, ApprovalDecision::Denied, None, None, Utc::now())
            .await
            .unwrap();
        assert!(!second);

        let stored = repo.get_approval(&request.approval_id).await.unwrap().unwrap();
        assert_eq!(stored.decision, ApprovalDecision::Approved);
        assert_eq!(stored.decided_by.as_deref(), Some("alice"));

        let pending = repo
            .list_approvals(None, Some(ApprovalDecision::Pending))
            .await
            .unwrap();
        assert!(pending.is_empty());
        let for_step = repo
            .find_approval_for_step(&request.execution_id, "approval")
            .await
            .unwrap();
        assert_eq!(for_step.map(|r| r.approval_id), Some(request.approval_id));
    }
}
