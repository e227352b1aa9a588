//! With-items bookkeeping.
//!
//! A with-items task runs its invocation once per item. Progress lives in
//! the task's runtime context as `{count, capacity}`; capacity is the number
//! of free concurrency slots and is only tracked when concurrency is limited.

use std::collections::BTreeSet;

use conflux_types::definition::ItemsClause;
use conflux_types::execution::WithItemsProgress;
use conflux_types::state::ExecutionState;
use serde_json::{Map, Value};

use crate::workflow::expression::{evaluate_recursively, ExpressionEvaluator};

use super::data_flow::ChildExecution;
use super::error::EngineError;

pub const FAILED_MESSAGE: &str = "One or more actions had failed.";
pub const CANCELLED_MESSAGE: &str = "One or more actions was cancelled.";

/// Name of the lock guarding a task's capacity updates.
pub fn lock_name(task_execution_id: impl std::fmt::Display) -> String {
    format!("with-items-{task_execution_id}")
}

/// Evaluate the items clauses into one variable map per item.
///
/// Every clause must evaluate to a list and all lists must have the same
/// length.
pub fn evaluate_items(
    evaluator: &dyn ExpressionEvaluator,
    clauses: &[ItemsClause],
    context: &Value,
) -> Result<Vec<Map<String, Value>>, EngineError> {
    let mut lists: Vec<(&str, Vec<Value>)> = Vec::with_capacity(clauses.len());

    for clause in clauses {
        match evaluate_recursively(evaluator, &clause.expression, context)? {
            Value::Array(items) => lists.push((clause.var.as_str(), items)),
            other => {
                return Err(EngineError::Input(format!(
                    "Wrong input format for: {}. List type is expected, got: {other}",
                    clause.var
                )));
            }
        }
    }

    let len = lists.first().map_or(0, |(_, items)| items.len());
    if lists.iter().any(|(_, items)| items.len() != len) {
        let lens: Vec<String> = lists
            .iter()
            .map(|(var, items)| format!("{var}={}", items.len()))
            .collect();
        return Err(EngineError::Input(format!(
            "Wrong input format for with-items. All lists must have the same length [{}]",
            lens.join(", ")
        )));
    }

    Ok((0..len)
        .map(|i| {
            lists
                .iter()
                .map(|(var, items)| (var.to_string(), items[i].clone()))
                .collect()
        })
        .collect())
}

/// Indexes to schedule next.
///
/// Completed-but-invalidated items (after a rerun) come first, followed by
/// any later index that is neither accepted nor in flight. Without such
/// candidates, scheduling continues from the first untouched index. The
/// result is capped by the free capacity.
pub fn next_indexes(progress: &WithItemsProgress, children: &[ChildExecution]) -> Vec<usize> {
    let accepted: BTreeSet<usize> = children
        .iter()
        .filter(|c| c.accepted && c.state.is_completed())
        .map(|c| c.index)
        .collect();
    let busy: BTreeSet<usize> = children
        .iter()
        .filter(|c| c.accepted || c.state.is_running() || c.state == ExecutionState::Idle)
        .map(|c| c.index)
        .collect();
    let candidates: Vec<usize> = children
        .iter()
        .filter(|c| !c.accepted && c.state.is_completed())
        .map(|c| c.index)
        .collect::<BTreeSet<_>>()
        .difference(&accepted)
        .copied()
        .filter(|i| !busy.contains(i))
        .collect();

    let indexes: Vec<usize> = match candidates.last() {
        Some(&last) => candidates
            .iter()
            .copied()
            .chain((last + 1..progress.count).filter(|i| !busy.contains(i)))
            .collect(),
        None => {
            let start = children
                .iter()
                .filter(|c| c.accepted || c.state.is_running() || c.state == ExecutionState::Idle)
                .count();
            (start..progress.count).collect()
        }
    };

    match progress.capacity {
        Some(capacity) => indexes.into_iter().take(capacity).collect(),
        None => indexes,
    }
}

/// Whether every item has been accepted and every slot handed back.
pub fn is_completed(
    progress: &WithItemsProgress,
    concurrency: Option<usize>,
    children: &[ChildExecution],
) -> bool {
    if children
        .iter()
        .any(|c| c.accepted && c.state == ExecutionState::Cancelled)
    {
        return true;
    }

    let accepted = children.iter().filter(|c| c.accepted).count();
    let full_capacity = match concurrency {
        None => true,
        Some(concurrency) => progress.capacity == Some(concurrency),
    };
    accepted == progress.count.max(1) && full_capacity
}

/// Whether items remain that are neither accepted nor running.
pub fn has_more_iterations(progress: &WithItemsProgress, children: &[ChildExecution]) -> bool {
    let started = children
        .iter()
        .filter(|c| c.accepted || c.state == ExecutionState::Running)
        .count();
    progress.count > started
}

/// Task state once all items are done, with its state info.
pub fn final_state(children: &[ChildExecution]) -> (ExecutionState, Option<String>) {
    let accepted = || children.iter().filter(|c| c.accepted);

    if accepted().any(|c| c.state == ExecutionState::Cancelled) {
        (ExecutionState::Cancelled, Some(CANCELLED_MESSAGE.to_string()))
    } else if accepted().any(|c| c.state == ExecutionState::Error) {
        (ExecutionState::Error, Some(FAILED_MESSAGE.to_string()))
    } else {
        (ExecutionState::Success, None)
    }
}

/// Hand one slot back.
pub fn increase_capacity(progress: &mut WithItemsProgress, concurrency: Option<usize>) {
    if let (Some(concurrency), Some(capacity)) = (concurrency, progress.capacity.as_mut()) {
        if *capacity < concurrency {
            *capacity += 1;
        }
    }
}

/// Take one slot.
pub fn decrease_capacity(progress: &mut WithItemsProgress) -> Result<(), EngineError> {
    if let Some(capacity) = progress.capacity.as_mut() {
        *capacity = capacity.checked_sub(1).ok_or_else(|| {
            EngineError::Validation("Can't decrease with-items capacity [capacity=0, count=1]".into())
        })?;
    }
    Ok(())
}
