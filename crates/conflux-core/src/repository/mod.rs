//! Store trait definitions (ports) and the in-memory store.
//!
//! These traits define the transactional storage interface that the
//! infrastructure layer (conflux-infra) implements. The engine never depends
//! on any specific storage technology.

pub mod execution;
pub mod memory;

pub use execution::{ExecutionStore, StoreTransaction};
pub use memory::InMemoryStore;
