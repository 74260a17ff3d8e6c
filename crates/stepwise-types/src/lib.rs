//! Shared domain types for the stepwise workflow engine.
//!
//! Workflow definitions, executions, step results, approval requests,
//! lifecycle events, engine configuration, and the repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod approval;
pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
