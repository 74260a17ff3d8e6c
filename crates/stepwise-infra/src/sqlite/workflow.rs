//! SQLite workflow repository implementation.
//!
//! Implements `WorkflowRepository` from `stepwise-core` using sqlx with split
//! read/write pools. Definitions and execution snapshots are stored as JSON
//! blobs; step results and pending resume signals get their own tables so
//! each transition is a single-row write.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::Row;
use stepwise_core::repository::workflow::WorkflowRepository;
use stepwise_types::error::RepositoryError;
use stepwise_types::workflow::{
    Execution, ExecutionStatus, ParentLink, StepResult, StepStatus, UserContext,
    WorkflowDefinition,
};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    async fn load_step_results(
        &self,
        execution_id: &str,
    ) -> Result<Vec<StepResult>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM step_results WHERE execution_id = ? ORDER BY step_id ASC")
            .bind(execution_id)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = StepResultRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            results.push(r.into_step_result()?);
        }
        Ok(results)
    }

    async fn assemble(&self, rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<Execution>, RepositoryError> {
        let mut executions = Vec::with_capacity(rows.len());
        for row in rows {
            let r = ExecutionRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            let step_results = self.load_step_results(&r.id).await?;
            executions.push(r.into_execution(step_results)?);
        }
        Ok(executions)
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct ExecutionRow {
    id: String,
    workflow_id: String,
    status: String,
    definition: String,
    trigger_data: String,
    user_context: String,
    context: String,
    parent_execution_id: Option<String>,
    parent_step_id: Option<String>,
    depth: i64,
    error: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl ExecutionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            status: row.try_get("status")?,
            definition: row.try_get("definition")?,
            trigger_data: row.try_get("trigger_data")?,
            user_context: row.try_get("user_context")?,
            context: row.try_get("context")?,
            parent_execution_id: row.try_get("parent_execution_id")?,
            parent_step_id: row.try_get("parent_step_id")?,
            depth: row.try_get("depth")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn into_execution(self, step_results: Vec<StepResult>) -> Result<Execution, RepositoryError> {
        let status: ExecutionStatus = self
            .status
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;
        let definition: WorkflowDefinition = parse_json(&self.definition, "definition")?;
        let user: UserContext = parse_json(&self.user_context, "user_context")?;

        let parent = match (self.parent_execution_id, self.parent_step_id) {
            (Some(execution_id), Some(step_id)) => Some(ParentLink {
                execution_id: parse_uuid(&execution_id)?,
                step_id,
                depth: u32::try_from(self.depth).unwrap_or_default(),
            }),
            _ => None,
        };

        Ok(Execution {
            execution_id: parse_uuid(&self.id)?,
            workflow_id: self.workflow_id,
            status,
            definition,
            trigger_data: parse_json(&self.trigger_data, "trigger_data")?,
            user,
            context: parse_json(&self.context, "context")?,
            step_results: step_results
                .into_iter()
                .map(|r| (r.step_id.clone(), r))
                .collect(),
            parent,
            error: self.error,
            created_at: parse_datetime(&self.created_at)?,
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

struct StepResultRow {
    step_id: String,
    status: String,
    output_data: String,
    error: Option<String>,
    attempts: i64,
    started_at: Option<String>,
    completed_at: Option<String>,
    wake_at: Option<String>,
}

impl StepResultRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            step_id: row.try_get("step_id")?,
            status: row.try_get("status")?,
            output_data: row.try_get("output_data")?,
            error: row.try_get("error")?,
            attempts: row.try_get("attempts")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            wake_at: row.try_get("wake_at")?,
        })
    }

    fn into_step_result(self) -> Result<StepResult, RepositoryError> {
        let status: StepStatus = self
            .status
            .parse()
            .map_err(|e: String| RepositoryError::Query(e))?;
        Ok(StepResult {
            step_id: self.step_id,
            status,
            output_data: parse_json(&self.output_data, "output_data")?,
            error: self.error,
            attempts: u32::try_from(self.attempts).unwrap_or_default(),
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            wake_at: self.wake_at.as_deref().map(parse_datetime).transpose()?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
pub(crate) fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    s: &str,
    column: &str,
) -> Result<T, RepositoryError> {
    serde_json::from_str(s).map_err(|e| RepositoryError::Query(format!("invalid {column} JSON: {e}")))
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let definition_json = to_json(def)?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflow_definitions (id, name, definition, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 definition = excluded.definition,
                 updated_at = excluded.updated_at"#,
        )
        .bind(&def.id)
        .bind(&def.name)
        .bind(&definition_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_definition(&self, id: &str) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT definition FROM workflow_definitions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let definition: String = row
                    .try_get("definition")
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(parse_json(&definition, "definition")?))
            }
            None => Ok(None),
        }
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query("SELECT definition FROM workflow_definitions ORDER BY id ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut defs = Vec::with_capacity(rows.len());
        for row in &rows {
            let definition: String = row
                .try_get("definition")
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
            defs.push(parse_json(&definition, "definition")?);
        }
        Ok(defs)
    }

    async fn delete_definition(&self, id: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_definitions WHERE id = ?")
            .bind(id)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn create_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let inserted = sqlx::query(
            r#"INSERT INTO executions
               (id, workflow_id, status, definition, trigger_data, user_context, context,
                parent_execution_id, parent_step_id, depth, error, created_at, started_at, completed_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(execution.execution_id.to_string())
        .bind(&execution.workflow_id)
        .bind(execution.status.as_str())
        .bind(to_json(&execution.definition)?)
        .bind(to_json(&execution.trigger_data)?)
        .bind(to_json(&execution.user)?)
        .bind(to_json(&execution.context)?)
        .bind(execution.parent.as_ref().map(|p| p.execution_id.to_string()))
        .bind(execution.parent.as_ref().map(|p| p.step_id.clone()))
        .bind(execution.parent.as_ref().map_or(0, |p| i64::from(p.depth)))
        .bind(&execution.error)
        .bind(format_datetime(&execution.created_at))
        .bind(execution.started_at.as_ref().map(format_datetime))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            return Err(match e {
                sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict(
                    format!("execution {} already exists", execution.execution_id),
                ),
                other => RepositoryError::Query(other.to_string()),
            });
        }

        for result in execution.step_results.values() {
            upsert_step_result_query(&execution.execution_id, result)?
                .execute(&mut *tx)
                .await
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(())
    }

    async fn update_execution(&self, execution: &Execution) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE executions
               SET status = ?, context = ?, error = ?, started_at = ?, completed_at = ?
               WHERE id = ?"#,
        )
        .bind(execution.status.as_str())
        .bind(to_json(&execution.context)?)
        .bind(&execution.error)
        .bind(execution.started_at.as_ref().map(format_datetime))
        .bind(execution.completed_at.as_ref().map(format_datetime))
        .bind(execution.execution_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn get_execution(&self, execution_id: &Uuid) -> Result<Option<Execution>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => Ok(self.assemble(std::slice::from_ref(&row)).await?.pop()),
            None => Ok(None),
        }
    }

    async fn list_executions(
        &self,
        workflow_id: Option<&str>,
    ) -> Result<Vec<Execution>, RepositoryError> {
        let rows = match workflow_id {
            Some(id) => {
                sqlx::query(
                    "SELECT * FROM executions WHERE workflow_id = ? ORDER BY created_at DESC, id DESC",
                )
                .bind(id)
                .fetch_all(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM executions ORDER BY created_at DESC, id DESC")
                    .fetch_all(&self.pool.reader)
                    .await
            }
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        self.assemble(&rows).await
    }

    async fn list_executions_by_status(
        &self,
        statuses: &[ExecutionStatus],
    ) -> Result<Vec<Execution>, RepositoryError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!(
            "SELECT * FROM executions WHERE status IN ({placeholders}) ORDER BY created_at ASC, id ASC"
        );
        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows = query
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        self.assemble(&rows).await
    }

    async fn upsert_step_result(
        &self,
        execution_id: &Uuid,
        result: &StepResult,
    ) -> Result<(), RepositoryError> {
        upsert_step_result_query(execution_id, result)?
            .execute(&self.pool.writer)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.is_foreign_key_violation() => RepositoryError::NotFound,
                other => RepositoryError::Query(other.to_string()),
            })?;
        Ok(())
    }

    async fn list_step_results(&self, execution_id: &Uuid) -> Result<Vec<StepResult>, RepositoryError> {
        self.load_step_results(&execution_id.to_string()).await
    }

    async fn put_signal(
        &self,
        execution_id: &Uuid,
        step_id: &str,
        payload: &Value,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO execution_signals (execution_id, step_id, payload, created_at)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(execution_id, step_id) DO UPDATE SET
                 payload = excluded.payload,
                 created_at = excluded.created_at"#,
        )
        .bind(execution_id.to_string())
        .bind(step_id)
        .bind(to_json(payload)?)
        .bind(format_datetime(&Utc::now()))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => RepositoryError::NotFound,
            other => RepositoryError::Query(other.to_string()),
        })?;
        Ok(())
    }

    async fn take_signal(
        &self,
        execution_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<Value>, RepositoryError> {
        // Delete-and-return on the writer so a signal is consumed exactly once.
        let row = sqlx::query(
            "DELETE FROM execution_signals WHERE execution_id = ? AND step_id = ? RETURNING payload",
        )
        .bind(execution_id.to_string())
        .bind(step_id)
        .fetch_optional(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let payload: String = row
                    .try_get("payload")
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(parse_json(&payload, "payload")?))
            }
            None => Ok(None),
        }
    }

    async fn clear_signals(
        &self,
        execution_id: &Uuid,
        step_id: Option<&str>,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            r#"DELETE FROM execution_signals
               WHERE execution_id = ?1 AND (?2 IS NULL OR step_id = ?2)"#,
        )
        .bind(execution_id.to_string())
        .bind(step_id)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(result.rows_affected())
    }
}

fn upsert_step_result_query<'q>(
    execution_id: &Uuid,
    result: &'q StepResult,
) -> Result<sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>, RepositoryError> {
    Ok(sqlx::query(
        r#"INSERT INTO step_results
           (execution_id, step_id, status, output_data, error, attempts, started_at, completed_at, wake_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
           ON CONFLICT(execution_id, step_id) DO UPDATE SET
             status = excluded.status,
             output_data = excluded.output_data,
             error = excluded.error,
             attempts = excluded.attempts,
             started_at = excluded.started_at,
             completed_at = excluded.completed_at,
             wake_at = excluded.wake_at"#,
    )
    .bind(execution_id.to_string())
    .bind(result.step_id.as_str())
    .bind(result.status.as_str())
    .bind(to_json(&result.output_data)?)
    .bind(result.error.as_deref())
    .bind(i64::from(result.attempts))
    .bind(result.started_at.as_ref().map(format_datetime))
    .bind(result.completed_at.as_ref().map(format_datetime))
    .bind(result.wake_at.as_ref().map(format_datetime)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
