//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (stepwise-infra) implements. The core crate never depends on any
//! specific storage technology; `memory` provides dashmap-backed
//! implementations for tests and single-process embedding.

pub mod approval;
pub mod memory;
pub mod workflow;

pub use approval::ApprovalRepository;
pub use memory::{InMemoryApprovalRepository, InMemoryWorkflowRepository};
pub use workflow::WorkflowRepository;
