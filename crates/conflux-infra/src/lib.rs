//! Infrastructure layer for Conflux.
//!
//! Contains implementations of the ports defined in `conflux-core`: the
//! SQLite execution store, the in-process action executor, and the engine
//! configuration loader.

pub mod config;
pub mod executor;
pub mod sqlite;
