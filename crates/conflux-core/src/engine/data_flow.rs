//! Data flow between tasks.
//!
//! Builds the layered expression contexts tasks evaluate against, publishes
//! task variables, aggregates the contexts of upstream tasks and computes
//! task results from child executions.

use std::borrow::Cow;
use std::collections::HashSet;

use conflux_types::config::ContextStrategy;
use conflux_types::definition::Invocation;
use conflux_types::execution::{ActionExecution, TaskExecution, WorkflowExecution};
use conflux_types::state::ExecutionState;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::repository::StoreTransaction;
use crate::workflow::context::{merge_maps, ContextView, LayeredContext};
use crate::workflow::expression::{evaluate_map, evaluate_recursively, ExpressionEvaluator};

use super::error::{EngineError, EntityKind};

pub const TASK_EXECUTION_KEY: &str = "__task_execution";
pub const EXECUTION_KEY: &str = "__execution";
pub const ENV_KEY: &str = "__env";
pub const TASK_KEY: &str = "task";

// ---------------------------------------------------------------------------
// Child executions and task results
// ---------------------------------------------------------------------------

/// One action or sub-workflow execution of a task, normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildExecution {
    pub id: Uuid,
    pub index: usize,
    pub state: ExecutionState,
    pub state_info: Option<String>,
    pub accepted: bool,
    pub result: Value,
}

impl ChildExecution {
    pub fn from_action(action_ex: &ActionExecution) -> Self {
        Self {
            id: action_ex.id,
            index: action_ex.runtime_context.index,
            state: action_ex.state,
            state_info: action_ex.state_info.clone(),
            accepted: action_ex.accepted,
            result: action_ex.output.get("result").cloned().unwrap_or(Value::Null),
        }
    }

    pub fn from_workflow(wf_ex: &WorkflowExecution) -> Self {
        Self {
            id: wf_ex.id,
            index: wf_ex.index(),
            state: wf_ex.state,
            state_info: wf_ex.state_info.clone(),
            accepted: wf_ex.accepted,
            result: Value::Object(wf_ex.output.clone()),
        }
    }
}

/// Load every child execution of a task, in creation order.
pub async fn load_children<T: StoreTransaction>(
    tx: &mut T,
    task_ex: &TaskExecution,
) -> Result<Vec<ChildExecution>, EngineError> {
    let children = match task_ex.spec.invocation() {
        Invocation::Action(_) => tx
            .list_action_executions(task_ex.id)
            .await?
            .iter()
            .map(ChildExecution::from_action)
            .collect(),
        Invocation::Workflow(_) => tx
            .list_child_workflow_executions(task_ex.id)
            .await?
            .iter()
            .map(ChildExecution::from_workflow)
            .collect(),
    };
    Ok(children)
}

/// Aggregate task result: accepted children ordered by index. With-items
/// tasks always yield a list; otherwise a single child yields its value.
pub fn task_result(children: &[ChildExecution], with_items: bool) -> Value {
    let mut accepted: Vec<&ChildExecution> = children.iter().filter(|c| c.accepted).collect();
    accepted.sort_by_key(|c| c.index);

    if with_items {
        return Value::Array(accepted.iter().map(|c| c.result.clone()).collect());
    }
    match accepted.as_slice() {
        [] => Value::Null,
        [single] => single.result.clone(),
        many => Value::Array(many.iter().map(|c| c.result.clone()).collect()),
    }
}

// ---------------------------------------------------------------------------
// Expression contexts
// ---------------------------------------------------------------------------

/// Current-task marker layer: `__task_execution` plus `task`.
pub fn task_marker(task_ex: &TaskExecution, result: Option<&Value>) -> Map<String, Value> {
    let mut marker = Map::new();
    marker.insert(
        TASK_EXECUTION_KEY.to_string(),
        json!({"id": task_ex.id, "name": task_ex.name}),
    );
    marker.insert(
        TASK_KEY.to_string(),
        json!({
            "id": task_ex.id,
            "name": task_ex.name,
            "state": task_ex.state,
            "state_info": task_ex.state_info,
            "result": result.cloned().unwrap_or(Value::Null),
        }),
    );
    marker
}

/// The environment as a context layer.
pub fn env_layer(env: Map<String, Value>) -> Map<String, Value> {
    let mut layer = Map::new();
    layer.insert(ENV_KEY.to_string(), Value::Object(env));
    layer
}

/// Context a task evaluates against: marker, optional item variables,
/// inbound context, environment, workflow context, workflow input.
pub fn task_view<'a>(
    strategy: ContextStrategy,
    marker: &'a Map<String, Value>,
    items: Option<&'a Map<String, Value>>,
    in_context: &'a Map<String, Value>,
    env: &'a Map<String, Value>,
    wf_ex: &'a WorkflowExecution,
) -> LayeredContext<'a> {
    let mut layers = Vec::with_capacity(6);
    layers.push(Cow::Borrowed(marker));
    if let Some(items) = items {
        layers.push(Cow::Borrowed(items));
    }
    layers.push(Cow::Borrowed(in_context));
    layers.push(Cow::Borrowed(env));
    layers.push(Cow::Borrowed(&wf_ex.context));
    layers.push(Cow::Borrowed(&wf_ex.input));
    LayeredContext::build(strategy, layers)
}

/// Context workflow-level expressions evaluate against: the given top
/// layer, environment, workflow context, workflow input.
pub fn workflow_view<'a>(
    strategy: ContextStrategy,
    top: &'a Map<String, Value>,
    env: &'a Map<String, Value>,
    wf_ex: &'a WorkflowExecution,
) -> LayeredContext<'a> {
    LayeredContext::build(
        strategy,
        vec![
            Cow::Borrowed(top),
            Cow::Borrowed(env),
            Cow::Borrowed(&wf_ex.context),
            Cow::Borrowed(&wf_ex.input),
        ],
    )
}

// ---------------------------------------------------------------------------
// Outbound and upstream contexts
// ---------------------------------------------------------------------------

/// What a task passes to its successors: its inbound context plus its
/// branch-published variables.
pub fn outbound_context(strategy: ContextStrategy, task_ex: &TaskExecution) -> Map<String, Value> {
    let mut ctx = task_ex.in_context.clone();
    match strategy {
        ContextStrategy::Merge => merge_maps(&mut ctx, &task_ex.published),
        ContextStrategy::Precedence => {
            for (key, value) in &task_ex.published {
                ctx.insert(key.clone(), value.clone());
            }
        }
    }
    ctx
}

/// Fold the outbound contexts of several finished tasks.
///
/// Tasks are applied in completion order `(finished_at, id)`; on conflicting
/// keys the last applied wins. Published variables are applied once more on
/// top so that a later task's inherited context cannot shadow what an
/// earlier task published.
pub fn evaluate_upstream_context(
    strategy: ContextStrategy,
    upstream: &[&TaskExecution],
) -> Map<String, Value> {
    let mut ordered: Vec<&TaskExecution> = upstream.to_vec();
    ordered.sort_by_key(|t| (t.finished_at, t.id));

    let mut ctx = Map::new();
    let mut published = Map::new();
    for task_ex in ordered {
        merge_maps(&mut published, &task_ex.published);
        merge_maps(&mut ctx, &outbound_context(strategy, task_ex));
    }
    merge_maps(&mut ctx, &published);
    ctx
}

// ---------------------------------------------------------------------------
// Publish
// ---------------------------------------------------------------------------

/// Evaluate the task's publish clause for its (terminal) state.
///
/// Branch variables are stored on the task; global variables are
/// deep-merged into the workflow context. Tasks that are not in SUCCESS,
/// ERROR or SKIPPED publish nothing.
pub fn publish_variables(
    evaluator: &dyn ExpressionEvaluator,
    strategy: ContextStrategy,
    task_ex: &mut TaskExecution,
    wf_ex: &mut WorkflowExecution,
    env: &Map<String, Value>,
    result: &Value,
) -> Result<(), EngineError> {
    let publish = match task_ex.state {
        ExecutionState::Success | ExecutionState::Skipped => task_ex.spec.publish.clone(),
        ExecutionState::Error => task_ex.spec.publish_on_error.clone(),
        _ => return Ok(()),
    };
    let Some(publish) = publish else {
        return Ok(());
    };

    let ctx = {
        let marker = task_marker(task_ex, Some(result));
        let view = task_view(strategy, &marker, None, &task_ex.in_context, env, wf_ex);
        if view.contains_key(&task_ex.name) {
            tracing::warn!(
                task = %task_ex.name,
                "shadowing context variable with task name while publishing"
            );
        }
        view.to_value()
    };

    let branch = evaluate_map(evaluator, &publish.branch, &ctx)?;
    let global = evaluate_map(evaluator, &publish.global, &ctx)?;

    task_ex.published = branch;
    merge_maps(&mut wf_ex.context, &global);
    task_ex.published_global = global;
    Ok(())
}

/// The workflow's published globals: its context without internal keys
/// and initial `vars`.
pub fn published_globals(wf_ex: &WorkflowExecution) -> Map<String, Value> {
    wf_ex
        .context
        .iter()
        .filter(|(key, _)| key.as_str() != EXECUTION_KEY && !wf_ex.spec.vars.contains_key(*key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// Workflow-level evaluation
// ---------------------------------------------------------------------------

/// Initial workflow context: `vars` evaluated over the input, plus the
/// execution marker.
pub fn initial_context(
    evaluator: &dyn ExpressionEvaluator,
    wf_ex: &WorkflowExecution,
    env: &Map<String, Value>,
) -> Result<Map<String, Value>, EngineError> {
    let ctx = {
        let empty = Map::new();
        workflow_view(ContextStrategy::Precedence, &empty, env, wf_ex).to_value()
    };
    let mut context = evaluate_map(evaluator, &wf_ex.spec.vars, &ctx)?;
    context.insert(EXECUTION_KEY.to_string(), json!({"id": wf_ex.id}));
    Ok(context)
}

/// Evaluate the workflow output over its final context.
///
/// Without a declared output clause, the final context (internal keys
/// removed) is the output on success and an empty map on error.
pub fn evaluate_workflow_output(
    evaluator: &dyn ExpressionEvaluator,
    strategy: ContextStrategy,
    wf_ex: &WorkflowExecution,
    final_context: &Map<String, Value>,
    env: &Map<String, Value>,
    on_error: bool,
) -> Result<Map<String, Value>, EngineError> {
    let declared = if on_error {
        wf_ex.spec.output_on_error.as_ref()
    } else {
        wf_ex.spec.output.as_ref()
    };

    let Some(declared) = declared else {
        if on_error {
            return Ok(Map::new());
        }
        return Ok(final_context
            .iter()
            .filter(|(key, _)| !key.starts_with("__"))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect());
    };

    let ctx = workflow_view(strategy, final_context, env, wf_ex).to_value();
    match evaluate_recursively(evaluator, declared, &ctx)? {
        Value::Object(map) => Ok(map),
        other => Err(EngineError::Input(format!(
            "Workflow output must evaluate to a map, got: {other}"
        ))),
    }
}

/// Environment of a workflow execution. Sub-workflows share the env of
/// their root execution.
pub async fn workflow_environment<T: StoreTransaction>(
    tx: &mut T,
    wf_ex: &WorkflowExecution,
    max_depth: usize,
) -> Result<Map<String, Value>, EngineError> {
    let Some(mut next) = wf_ex.root_execution_id else {
        return Ok(wf_ex.params.env.clone().unwrap_or_default());
    };

    let mut visited = HashSet::from([wf_ex.id]);
    for _ in 0..max_depth {
        if !visited.insert(next) {
            return Err(EngineError::Validation(format!(
                "cycle in root execution chain of workflow execution {}",
                wf_ex.id
            )));
        }
        let root = tx
            .get_workflow_execution(next)
            .await?
            .ok_or_else(|| EngineError::not_found(EntityKind::WorkflowExecution, next))?;
        match root.root_execution_id {
            Some(id) => next = id,
            None => return Ok(root.params.env.unwrap_or_default()),
        }
    }

    Err(EngineError::Validation(format!(
        "environment lookup for workflow execution {} exceeded depth {}",
        wf_ex.id, max_depth
    )))
}
