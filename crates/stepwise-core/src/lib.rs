//! Workflow execution engine for stepwise.
//!
//! This crate holds the scheduler, the step registry, the built-in step
//! types, and the repository traits (ports) that `stepwise-infra`
//! implements. It depends only on `stepwise-types` -- never on
//! `stepwise-infra` or any database crate.

pub mod event;
pub mod repository;
pub mod workflow;
