//! Engine configuration types.
//!
//! `EngineConfig` represents `engine.toml` in the data directory. Every field
//! has a default so a missing or partial file is valid.

use serde::{Deserialize, Serialize};

/// What a `human_approval` step does when its timeout elapses without a decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalTimeoutPolicy {
    /// Complete the step with a `denied` decision so denied-branches run.
    #[default]
    Deny,
    /// Fail the step and terminate the execution with status `timeout`.
    Timeout,
    /// Fail the step like any other handler failure.
    Fail,
}

/// Tunables for the workflow engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-step timeout when a step declares none.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// Wall-clock limit for executions whose definition declares none.
    #[serde(default)]
    pub default_execution_timeout_secs: Option<u64>,

    #[serde(default)]
    pub approval_timeout_policy: ApprovalTimeoutPolicy,

    /// Maximum subflow nesting depth.
    #[serde(default = "default_max_subflow_depth")]
    pub max_subflow_depth: u32,

    /// Step outputs above this serialized size are replaced by a marker.
    #[serde(default = "default_max_step_output_bytes")]
    pub max_step_output_bytes: usize,

    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Consecutive failed attempts of one step type that open its circuit.
    /// 0 disables circuit breaking.
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,

    /// How long an open circuit rejects attempts before admitting a trial.
    #[serde(default = "default_circuit_breaker_cooldown_secs")]
    pub circuit_breaker_cooldown_secs: u64,

    /// Database URL for the worker; defaults to `stepwise.db` in the data dir.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_max_subflow_depth() -> u32 {
    5
}

fn default_max_step_output_bytes() -> usize {
    1_048_576
}

fn default_event_bus_capacity() -> usize {
    1024
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

fn default_circuit_breaker_cooldown_secs() -> u64 {
    60
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: default_step_timeout_secs(),
            default_execution_timeout_secs: None,
            approval_timeout_policy: ApprovalTimeoutPolicy::default(),
            max_subflow_depth: default_max_subflow_depth(),
            max_step_output_bytes: default_max_step_output_bytes(),
            event_bus_capacity: default_event_bus_capacity(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_cooldown_secs: default_circuit_breaker_cooldown_secs(),
            database_url: None,
        }
    }
}
