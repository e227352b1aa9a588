//! Shared domain types for the Conflux workflow engine.
//!
//! Execution records, the state vocabulary and its transition table, workflow
//! definition types, engine configuration and the store error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod definition;
pub mod error;
pub mod execution;
pub mod state;
