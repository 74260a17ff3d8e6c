//! Workflow repository trait definition.
//!
//! Defines the storage interface for workflow definitions, executions, step
//! results, and pending resume signals. The infrastructure layer
//! (stepwise-infra) implements this trait with SQLite persistence.

use serde_json::Value;
use stepwise_types::error::RepositoryError;
use stepwise_types::workflow::{Execution, ExecutionStatus, StepResult, WorkflowDefinition};
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// Covers four entity families:
/// - **Definitions:** CRUD for workflow definitions, keyed by their string ID.
/// - **Executions:** Create/update/query execution records.
/// - **Step results:** Upsert/query per-step outcomes of an execution.
/// - **Signals:** Resume payloads delivered for `(execution_id, step_id)`
///   that have not been consumed yet.
///
/// Reads must reflect the latest write (read-your-writes), since the
/// scheduler reloads state before dispatch decisions on resume and recovery.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Upsert a workflow definition (insert or replace by ID).
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow definition by its ID.
    fn get_definition(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// List all workflow definitions, ordered by ID.
    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// Delete a workflow definition by ID. Returns `true` if it existed.
    fn delete_definition(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Insert a new execution record together with any step results it holds.
    fn create_execution(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Overwrite an execution's status, context, error and timestamps.
    /// Step results are written separately.
    fn update_execution(
        &self,
        execution: &Execution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an execution with all its step results.
    fn get_execution(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Execution>, RepositoryError>> + Send;

    /// List executions, optionally for one workflow, newest first.
    fn list_executions(
        &self,
        workflow_id: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    /// List executions in any of the given statuses, oldest first (crash recovery).
    fn list_executions_by_status(
        &self,
        statuses: &[ExecutionStatus],
    ) -> impl std::future::Future<Output = Result<Vec<Execution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step results
    // -----------------------------------------------------------------------

    /// Insert or replace the result of one step.
    fn upsert_step_result(
        &self,
        execution_id: &Uuid,
        result: &StepResult,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All step results of an execution.
    fn list_step_results(
        &self,
        execution_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepResult>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Signals
    // -----------------------------------------------------------------------

    /// Store a resume payload for a step, replacing any unconsumed one.
    fn put_signal(
        &self,
        execution_id: &Uuid,
        step_id: &str,
        payload: &Value,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Remove and return the pending resume payload for a step.
    fn take_signal(
        &self,
        execution_id: &Uuid,
        step_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<Value>, RepositoryError>> + Send;

    /// Drop unconsumed signals of one step, or of the whole execution when
    /// `step_id` is `None`. Returns how many were removed.
    fn clear_signals(
        &self,
        execution_id: &Uuid,
        step_id: Option<&str>,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;
}
