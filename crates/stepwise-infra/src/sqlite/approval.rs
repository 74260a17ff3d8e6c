//! SQLite approval repository implementation.

use chrono::{DateTime, Utc};
use sqlx::Row;
use stepwise_core::repository::approval::ApprovalRepository;
use stepwise_types::approval::{ApprovalDecision, ApprovalRequest};
use stepwise_types::error::RepositoryError;
use uuid::Uuid;

use super::pool::DatabasePool;
use super::workflow::{format_datetime, parse_datetime, parse_json, parse_uuid, to_json};

/// SQLite-backed implementation of `ApprovalRepository`.
pub struct SqliteApprovalRepository {
    pool: DatabasePool,
}

impl SqliteApprovalRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

struct ApprovalRow {
    id: String,
    execution_id: String,
    step_id: String,
    prompt: String,
    decision: String,
    payload: Option<String>,
    requested_at: String,
    expires_at: Option<String>,
    decided_at: Option<String>,
    decided_by: Option<String>,
}

impl ApprovalRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            step_id: row.try_get("step_id")?,
            prompt: row.try_get("prompt")?,
            decision: row.try_get("decision")?,
            payload: row.try_get("payload")?,
            requested_at: row.try_get("requested_at")?,
            expires_at: row.try_get("expires_at")?,
            decided_at: row.try_get("decided_at")?,
            decided_by: row.try_get("decided_by")?,
        })
    }

    fn into_request(self) -> Result<ApprovalRequest, RepositoryError> {
        Ok(ApprovalRequest {
            approval_id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            step_id: self.step_id,
            prompt: self.prompt,
            decision: self
                .decision
                .parse()
                .map_err(|e: String| RepositoryError::Query(e))?,
            payload: self
                .payload
                .as_deref()
                .map(|s| parse_json(s, "payload"))
                .transpose()?,
            requested_at: parse_datetime(&self.requested_at)?,
            expires_at: self.expires_at.as_deref().map(parse_datetime).transpose()?,
            decided_at: self.decided_at.as_deref().map(parse_datetime).transpose()?,
            decided_by: self.decided_by,
        })
    }
}

fn collect(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<ApprovalRequest>, RepositoryError> {
    let mut requests = Vec::with_capacity(rows.len());
    for row in rows {
        let r = ApprovalRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
        requests.push(r.into_request()?);
    }
    Ok(requests)
}

impl ApprovalRepository for SqliteApprovalRepository {
    async fn create_approval(&self, request: &ApprovalRequest) -> Result<(), RepositoryError> {
        let payload = request.payload.as_ref().map(to_json).transpose()?;

        sqlx::query(
            r#"INSERT INTO approval_requests
               (id, execution_id, step_id, prompt, decision, payload,
                requested_at, expires_at, decided_at, decided_by)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(request.approval_id.to_string())
        .bind(request.execution_id.to_string())
        .bind(&request.step_id)
        .bind(&request.prompt)
        .bind(request.decision.as_str())
        .bind(&payload)
        .bind(format_datetime(&request.requested_at))
        .bind(request.expires_at.as_ref().map(format_datetime))
        .bind(request.decided_at.as_ref().map(format_datetime))
        .bind(&request.decided_by)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict(
                format!("approval {} already exists", request.approval_id),
            ),
            other => RepositoryError::Query(other.to_string()),
        })?;

        Ok(())
    }

    async fn get_approval(&self, approval_id: &Uuid) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM approval_requests WHERE id = ?")
            .bind(approval_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(collect(row.as_slice())?.pop())
    }

    async fn find_approval_for_step(
        &self,
        execution_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        let row = sqlx::query(
            r#"SELECT * FROM approval_requests
               WHERE execution_id = ? AND step_id = ?
               ORDER BY requested_at DESC, id DESC
               LIMIT 1"#,
        )
        .bind(execution_id.to_string())
        .bind(step_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(collect(row.as_slice())?.pop())
    }

    async fn list_approvals(
        &self,
        execution_id: Option<&Uuid>,
        decision: Option<ApprovalDecision>,
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT * FROM approval_requests
               WHERE (?1 IS NULL OR execution_id = ?1)
                 AND (?2 IS NULL OR decision = ?2)
               ORDER BY requested_at ASC, id ASC"#,
        )
        .bind(execution_id.map(|id| id.to_string()))
        .bind(decision.map(|d| d.as_str()))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        collect(&rows)
    }

    async fn record_decision(
        &self,
        approval_id: &Uuid,
        decision: ApprovalDecision,
        payload: Option<&serde_json::Value>,
        decided_by: Option<&str>,
        decided_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let payload = payload.map(to_json).transpose()?;

        // Only a pending request may be decided; the WHERE clause makes the
        // first writer win.
        let result = sqlx::query(
            r#"UPDATE approval_requests
               SET decision = ?, payload = ?, decided_by = ?, decided_at = ?
               WHERE id = ? AND decision = 'pending'"#,
        )
        .bind(decision.as_str())
        .bind(&payload)
        .bind(decided_by)
        .bind(format_datetime(&decided_at))
        .bind(approval_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let exists = sqlx::query("SELECT 1 FROM approval_requests WHERE id = ?")
            .bind(approval_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        match exists {
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::test_pool;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_and_get() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteApprovalRepository::new(pool);

        let request = ApprovalRequest::new(Uuid::now_v7(), "approval", "Ship it?", Some(Utc::now()));
        repo.create_approval(&request).await.unwrap();

        let loaded = repo.get_approval(&request.approval_id).await.unwrap().unwrap();
        assert_eq!(loaded.prompt, "Ship it?");
        assert_eq!(loaded.decision, ApprovalDecision::Pending);
        assert!(loaded.expires_at.is_some());
        assert!(repo.get_approval(&Uuid::now_v7()).await.unwrap().is_none());

        let err = repo.create_approval(&request).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_first_decision_wins() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteApprovalRepository::new(pool);
        let request = ApprovalRequest::new(Uuid::now_v7(), "approval", "Ship it?", None);
        repo.create_approval(&request).await.unwrap();

        let payload = json!({"note": "lgtm"});
        let first = repo
            .record_decision(&request.approval_id, ApprovalDecision::Approved, Some(&payload), Some("ops"), Utc::now())
            .await
            .unwrap();
        let second = repo
            .record_decision(&request.approval_id, ApprovalDecision::Denied, None, Some("timeout"), Utc::now())
            .await
            .unwrap();
        assert!(first);
        assert!(!second);

        let loaded = repo.get_approval(&request.approval_id).await.unwrap().unwrap();
        assert_eq!(loaded.decision, ApprovalDecision::Approved);
        assert_eq!(loaded.payload, Some(payload));
        assert_eq!(loaded.decided_by.as_deref(), Some("ops"));
        assert!(loaded.decided_at.is_some());

        let err = repo
            .record_decision(&Uuid::now_v7(), ApprovalDecision::Approved, None, None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn test_find_and_list() {
        let (pool, _dir) = test_pool().await;
        let repo = SqliteApprovalRepository::new(pool);
        let execution_id = Uuid::now_v7();

        let mut older = ApprovalRequest::new(execution_id, "approval", "first", None);
        older.requested_at = Utc::now() - chrono::Duration::seconds(10);
        let newer = ApprovalRequest::new(execution_id, "approval", "second", None);
        let elsewhere = ApprovalRequest::new(Uuid::now_v7(), "approval", "other", None);
        for request in [&older, &newer, &elsewhere] {
            repo.create_approval(request).await.unwrap();
        }
        repo.record_decision(&older.approval_id, ApprovalDecision::Denied, None, None, Utc::now())
            .await
            .unwrap();

        let latest = repo
            .find_approval_for_step(&execution_id, "approval")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.approval_id, newer.approval_id);

        let for_execution = repo.list_approvals(Some(&execution_id), None).await.unwrap();
        let prompts: Vec<&str> = for_execution.iter().map(|r| r.prompt.as_str()).collect();
        assert_eq!(prompts, vec!["first", "second"]);

        let pending = repo
            .list_approvals(None, Some(ApprovalDecision::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);

        let denied = repo
            .list_approvals(Some(&execution_id), Some(ApprovalDecision::Denied))
            .await
            .unwrap();
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].approval_id, older.approval_id);
    }
}
