//! Worker state wiring the durable executor to the SQLite repositories.
//!
//! The executor is generic over repository traits; `WorkerState` pins it to
//! the concrete infra implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use stepwise_core::event::EventBus;
use stepwise_core::workflow::approval::ApprovalService;
use stepwise_core::workflow::builtin::register_builtin_steps;
use stepwise_core::workflow::definition::discover_workflows;
use stepwise_core::workflow::{DurableExecutor, StepRegistry};
use stepwise_infra::config::load_engine_config;
use stepwise_infra::sqlite::pool::default_database_url;
use stepwise_infra::sqlite::{DatabasePool, SqliteApprovalRepository, SqliteWorkflowRepository};
use stepwise_types::config::EngineConfig;

pub type ConcreteExecutor = DurableExecutor<SqliteWorkflowRepository, SqliteApprovalRepository>;

/// Everything the worker loop needs.
pub struct WorkerState {
    pub executor: ConcreteExecutor,
    pub config: EngineConfig,
    pub data_dir: PathBuf,
}

impl WorkerState {
    /// Load config, open the database, and register the built-in steps.
    ///
    /// `database_url` overrides the config file, which overrides
    /// `{data_dir}/stepwise.db`.
    pub async fn init(data_dir: PathBuf, database_url: Option<String>) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;
        let url = database_url
            .or_else(|| config.database_url.clone())
            .unwrap_or_else(|| default_database_url(&data_dir));
        let pool = DatabasePool::new(&url)
            .await
            .with_context(|| format!("failed to open database {url}"))?;

        let approvals = Arc::new(ApprovalService::new(Arc::new(
            SqliteApprovalRepository::new(pool.clone()),
        )));
        let mut registry = StepRegistry::new();
        register_builtin_steps(&mut registry, Arc::clone(&approvals), &config)?;

        let executor = DurableExecutor::new(
            Arc::new(SqliteWorkflowRepository::new(pool)),
            approvals,
            Arc::new(registry),
            EventBus::new(config.event_bus_capacity),
            config.clone(),
        );

        Ok(Self {
            executor,
            config,
            data_dir,
        })
    }

    /// Store every definition file found under `dir` so subflow steps can
    /// resolve them by id. Returns how many were stored.
    pub async fn import_definitions(&self, dir: &Path) -> anyhow::Result<usize> {
        let found = discover_workflows(dir)
            .with_context(|| format!("failed to scan {}", dir.display()))?;
        let mut stored = 0;
        for (path, definition) in found {
            match self.executor.save_definition(&definition).await {
                Ok(()) => stored += 1,
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping invalid workflow definition"),
            }
        }
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_types::workflow::{ExecutionStatus, UserContext};

    #[tokio::test]
    async fn init_creates_database_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let state = WorkerState::init(dir.path().join("data"), None).await.unwrap();
        assert!(state.data_dir.join("stepwise.db").exists());
        assert_eq!(state.config, EngineConfig::default());
    }

    #[tokio::test]
    async fn imported_definitions_run_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let workflows = dir.path().join("workflows");
        std::fs::create_dir_all(&workflows).unwrap();
        std::fs::write(
            workflows.join("greet.yaml"),
            r#"
id: greet
steps:
  - step_id: render
    step_type: prompt_template
    parameters:
      template: "Hello {{ trigger_data.name }}"
"#,
        )
        .unwrap();
        std::fs::write(workflows.join("broken.yaml"), "steps: [").unwrap();

        let state = WorkerState::init(dir.path().join("data"), None).await.unwrap();
        assert_eq!(state.import_definitions(&workflows).await.unwrap(), 1);

        let result = state
            .executor
            .execute_workflow("greet", serde_json::json!({"name": "Ana"}), UserContext::default())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.step_output("render").unwrap()["text"], "Hello Ana");

        let stored = state.executor.engine().list_executions(Some("greet")).await.unwrap();
        assert_eq!(stored.len(), 1);
    }
}
