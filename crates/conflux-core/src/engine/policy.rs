//! Task policies: wait-before, wait-after, timeout, pause-before, fail-on
//! and retry.
//!
//! This module only holds the policy vocabulary and condition evaluation.
//! The task coordinator decides when each policy applies and persists the
//! delayed work through [`ExecutionScope::schedule`](super::scope::ExecutionScope::schedule).

use serde_json::Value;

use crate::workflow::expression::{evaluate_bool, is_truthy, ExpressionEvaluator};

use super::error::EngineError;

pub const PAUSE_BEFORE_MESSAGE: &str = "Set by 'pause-before' policy";
pub const FAIL_ON_MESSAGE: &str = "Failed by 'fail-on' policy";

/// State info of a task held in RUNNING_DELAYED by `policy`.
pub fn delayed_message(policy: &str, delay: u64) -> String {
    format!("Delayed by '{policy}' policy [delay={delay}]")
}

pub fn timeout_message(timeout_secs: u64) -> String {
    format!("Task timed out [timeout(s)={timeout_secs}].")
}

/// Evaluate a boolean policy value: a literal, or an expression over `ctx`.
pub fn condition_holds(
    evaluator: &dyn ExpressionEvaluator,
    condition: &Value,
    ctx: &Value,
) -> Result<bool, EngineError> {
    match condition {
        Value::String(expr) => expression_holds(evaluator, expr, ctx),
        other => Ok(is_truthy(other)),
    }
}

/// Evaluate a condition written as an expression over `ctx`.
pub fn expression_holds(
    evaluator: &dyn ExpressionEvaluator,
    expr: &str,
    ctx: &Value,
) -> Result<bool, EngineError> {
    Ok(evaluate_bool(evaluator, expr, ctx)?)
}

/// Positive delay, if any.
pub fn positive(delay: Option<u64>) -> Option<u64> {
    delay.filter(|d| *d > 0)
}
