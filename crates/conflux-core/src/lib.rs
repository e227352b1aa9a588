//! Workflow engine coordinators and storage ports for Conflux.
//!
//! This crate defines the "ports" (store and executor traits) that the
//! infrastructure layer implements. It depends only on `conflux-types` --
//! never on `conflux-infra` or any database/IO crate.

pub mod engine;
pub mod repository;
pub mod workflow;

pub use engine::{Engine, EngineError, ExecutionRecord};
