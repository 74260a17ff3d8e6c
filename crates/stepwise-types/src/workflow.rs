//! Workflow domain types for the stepwise engine.
//!
//! Defines the declarative workflow representation (`WorkflowDefinition`,
//! `StepDefinition`) that JSON/YAML documents deserialize into, plus the
//! execution tracking types (`Execution`, `StepResult`) persisted by the
//! scheduler and read back on resume or crash recovery.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Reserved `step_io_data` key holding the raw trigger payload of an execution.
pub const TRIGGER_DATA_KEY: &str = "trigger_data";

/// Step type of the single entry step that exposes the trigger payload.
pub const TRIGGER_STEP_TYPE: &str = "trigger";

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A declarative graph of steps. Immutable once an execution starts: every
/// `Execution` stores its own snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable identifier, also used by subflow steps to reference this workflow.
    pub id: String,
    /// Human-readable name (defaults to empty).
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// How ready steps are dispatched.
    #[serde(default)]
    pub execution_pattern: ExecutionPattern,
    /// Wall-clock limit for the whole execution, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Global configuration passed through to handlers untouched.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub config: Map<String, Value>,
    /// Workflow-global template variables.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,
    /// Steps in declaration order. Declaration order is the dispatch tie-break.
    pub steps: Vec<StepDefinition>,
}

impl WorkflowDefinition {
    /// Create a definition with default settings.
    pub fn new(id: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            execution_pattern: ExecutionPattern::default(),
            timeout_secs: None,
            config: Map::new(),
            variables: Map::new(),
            steps,
        }
    }

    pub fn with_pattern(mut self, pattern: ExecutionPattern) -> Self {
        self.execution_pattern = pattern;
        self
    }

    /// Find a step by its ID.
    pub fn step(&self, step_id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}

/// Dispatch strategy declared by a workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPattern {
    /// One ready step per dispatch round, in declaration order.
    Sequential,
    /// All ready steps of a round run concurrently.
    Parallel,
    /// Same dispatch as `Parallel`; the graph alone decides ordering.
    #[default]
    DependencyBased,
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within the workflow.
    pub step_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Dispatch key into the step registry.
    pub step_type: String,
    /// Step IDs that must be terminal before this step is dispatched.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Opaque handler parameters.
    #[serde(default, alias = "config", skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    /// Handler input key -> source path resolved by the variable resolver.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_mapping: BTreeMap<String, String>,
    /// Output key -> source path restricting what the step exposes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_mapping: Option<BTreeMap<String, String>>,
    /// Boolean guard; a false (or malformed) condition skips the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// A failed critical step fails the whole execution.
    #[serde(default = "default_critical")]
    pub critical: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

fn default_critical() -> bool {
    true
}

impl StepDefinition {
    pub fn new(step_id: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            name: None,
            step_type: step_type.into(),
            dependencies: Vec::new(),
            parameters: Map::new(),
            input_mapping: BTreeMap::new(),
            output_mapping: None,
            condition: None,
            timeout_secs: None,
            critical: true,
            retry: None,
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn map_input(mut self, key: impl Into<String>, source: impl Into<String>) -> Self {
        self.input_mapping.insert(key.into(), source.into());
        self
    }

    pub fn map_output(mut self, key: impl Into<String>, source: impl Into<String>) -> Self {
        self.output_mapping
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), source.into());
        self
    }

    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }

    /// Display name, falling back to the step ID.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.step_id)
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Retry configuration for a step. Absent means a single attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub strategy: RetryStrategy,
    /// Base delay between attempts in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
    /// Upper bound for computed delays in milliseconds.
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_max_retry_delay_ms() -> u64 {
    60_000
}

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    None,
    FixedDelay,
    #[default]
    ExponentialBackoff,
    LinearBackoff,
}

// ---------------------------------------------------------------------------
// Variable Definition
// ---------------------------------------------------------------------------

/// A named value resolved from trigger data, a prior step output, or input
/// data, with an optional fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDefinition {
    pub name: String,
    /// Dotted path, e.g. `trigger_data.user.name` or `fetch.body`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Overall status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "waiting" => Ok(Self::Waiting),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "timeout" => Ok(Self::Timeout),
            other => Err(format!("invalid execution status: '{other}'")),
        }
    }
}

/// Status of a single step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Waiting,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "waiting" => Ok(Self::Waiting),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("invalid step status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Step Result
// ---------------------------------------------------------------------------

/// Per-step outcome, created on first dispatch and immutable once terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    /// Handler output, or the partial resume state while `waiting`.
    #[serde(default)]
    pub output_data: Map<String, Value>,
    /// Present iff `status == Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of handler invocations so far (retries and resumes included).
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// When a waiting step should be woken with a timeout signal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_at: Option<DateTime<Utc>>,
}

impl StepResult {
    /// A freshly dispatched step.
    pub fn running(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Running,
            output_data: Map::new(),
            error: None,
            attempts: 0,
            started_at: Some(Utc::now()),
            completed_at: None,
            wake_at: None,
        }
    }

    /// A step whose condition evaluated to false.
    pub fn skipped(step_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.into(),
            status: StepStatus::Skipped,
            output_data: Map::new(),
            error: None,
            attempts: 0,
            started_at: Some(now),
            completed_at: Some(now),
            wake_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// User/session identifiers carried by an execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            session_id: Some(session_id.into()),
        }
    }
}

/// Link from a child (subflow) execution to the parent step awaiting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub execution_id: Uuid,
    pub step_id: String,
    /// Nesting depth of the child (1 for a direct subflow).
    pub depth: u32,
}

/// One run of a workflow definition against one trigger payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    /// Definition snapshot taken when the execution was created.
    pub definition: WorkflowDefinition,
    pub trigger_data: Value,
    #[serde(default)]
    pub user: UserContext,
    /// Serialized execution context (`step_io_data`, variables).
    pub context: Value,
    #[serde(default)]
    pub step_results: BTreeMap<String, StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    /// A new execution in `pending` state.
    pub fn pending(
        definition: WorkflowDefinition,
        trigger_data: Value,
        user: UserContext,
        parent: Option<ParentLink>,
    ) -> Self {
        Self {
            execution_id: Uuid::now_v7(),
            workflow_id: definition.id.clone(),
            status: ExecutionStatus::Pending,
            definition,
            trigger_data,
            user,
            context: Value::Object(Map::new()),
            step_results: BTreeMap::new(),
            parent,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.step_results.get(step_id).map(|r| r.status)
    }

    /// IDs of steps currently suspended.
    pub fn waiting_steps(&self) -> Vec<String> {
        self.step_results
            .values()
            .filter(|r| r.status == StepStatus::Waiting)
            .map(|r| r.step_id.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
