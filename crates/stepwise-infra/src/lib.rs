//! Infrastructure layer for stepwise.
//!
//! Contains the SQLite implementations of the repository traits defined in
//! `stepwise-core` and the engine configuration loader.

pub mod config;
pub mod sqlite;
