//! Workflow engine core: definitions, scheduling, and the two execution backends.
//!
//! - `definition` -- YAML/JSON parsing, validation, filesystem load/save
//! - `dag` -- dependency graph, cycle detection, dispatch order
//! - `context` -- per-execution data store (trigger payload and step outputs)
//! - `variables` -- dotted-path resolution and `{{ }}` template injection
//! - `condition` -- boolean condition language for `condition` fields
//! - `registry` -- step handler trait and the type-name registry
//! - `retry` -- retry policy evaluation and backoff
//! - `breaker` -- per step type circuit breakers and failure counters
//! - `analytics` -- status distribution and timings over stored executions
//! - `checkpoint` -- persistence of every execution and step transition
//! - `engine` -- the scheduler shared by both backends
//! - `in_process` -- backend that returns control on suspension
//! - `durable` -- backend whose drivers park on suspension and survive restarts
//! - `approval`, `subflow`, `builtin` -- built-in step types

pub mod analytics;
pub mod approval;
pub mod breaker;
pub mod builtin;
pub mod checkpoint;
pub mod condition;
pub mod context;
pub mod dag;
pub mod definition;
pub mod durable;
pub mod engine;
pub mod in_process;
pub mod registry;
pub mod retry;
pub mod signal;
pub mod subflow;
pub mod variables;

pub use analytics::ExecutionAnalytics;
pub use breaker::{CircuitState, StepTypeStats};
pub use durable::DurableExecutor;
pub use engine::{ExecutionResult, ExecutorError, WorkflowEngine, WorkflowExecutor};
pub use in_process::InProcessExecutor;
pub use registry::{StepHandler, StepOutcome, StepRegistry};
