//! Workflow definition handling and expression evaluation.
//!
//! - `definition` -- YAML parsing, validation, filesystem load/save
//! - `dag` -- Task transition graph (start tasks, inbound lookups)
//! - `context` -- Layered context views for expression evaluation
//! - `expression` -- JEXL evaluator and `<% %>` expression handling
//! - `retry` -- Transaction retry policy

pub mod context;
pub mod dag;
pub mod definition;
pub mod expression;
pub mod retry;
