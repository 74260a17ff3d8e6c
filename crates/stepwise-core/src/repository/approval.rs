//! Approval repository trait definition.

use chrono::{DateTime, Utc};
use stepwise_types::approval::{ApprovalDecision, ApprovalRequest};
use stepwise_types::error::RepositoryError;
use uuid::Uuid;

/// Storage for approval requests created by `human_approval` steps.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ApprovalRepository: Send + Sync {
    fn create_approval(
        &self,
        request: &ApprovalRequest,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_approval(
        &self,
        approval_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ApprovalRequest>, RepositoryError>> + Send;

    /// Most recent request created for a step of an execution.
    fn find_approval_for_step(
        &self,
        execution_id: &Uuid,
        step_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<ApprovalRequest>, RepositoryError>> + Send;

    /// List requests, optionally filtered by execution and decision, oldest first.
    fn list_approvals(
        &self,
        execution_id: Option<&Uuid>,
        decision: Option<ApprovalDecision>,
    ) -> impl std::future::Future<Output = Result<Vec<ApprovalRequest>, RepositoryError>> + Send;

    /// Record a decision on a request that is still pending.
    ///
    /// Returns `false` (and writes nothing) if the request was already decided.
    fn record_decision(
        &self,
        approval_id: &Uuid,
        decision: ApprovalDecision,
        payload: Option<&serde_json::Value>,
        decided_by: Option<&str>,
        decided_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
