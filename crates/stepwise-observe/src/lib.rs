//! Observability setup for stepwise binaries.

pub mod tracing_setup;
