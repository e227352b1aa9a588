//! Workflow execution coordinator.
//!
//! Starts workflow and sub-workflow executions, decides when a workflow is
//! finished and evaluates its output, and implements the operator-facing
//! lifecycle calls: pause, resume, stop and rerun.

use chrono::Utc;
use conflux_types::definition::{Invocation, WorkflowDefinition};
use conflux_types::error::RepositoryError;
use conflux_types::execution::{
    ActionResult, JobKind, TaskExecution, WorkflowExecution, WorkflowParams, DEFAULT_PROJECT,
};
use conflux_types::state::ExecutionState;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::repository::StoreTransaction;
use crate::workflow::context::merge_maps;
use crate::workflow::expression::evaluate_map;

use super::action::describe;
use super::controller;
use super::data_flow::{env_layer, evaluate_workflow_output, initial_context, workflow_environment};
use super::error::{ensure_transition, EngineError, EntityKind};
use super::input::{split_undeclared, validate_input};
use super::scope::{Effect, ExecutionScope};
use super::task::TaskCoordinator;

const ENV_UPDATE_MESSAGE: &str = "Updating env to workflow execution is only permitted if it is in IDLE, PAUSED, or ERROR state.";

/// Where a workflow execution's environment comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvSource {
    /// Variables given with the start request.
    Inline(Map<String, Value>),
    /// A stored environment, looked up by name.
    Named(String),
}

/// Request to start a workflow execution.
#[derive(Debug, Clone, Default)]
pub struct StartWorkflow {
    /// Workflow definition name.
    pub workflow: String,
    pub namespace: String,
    /// Caller-chosen id. Starting twice with the same id returns the
    /// existing execution.
    pub execution_id: Option<Uuid>,
    pub input: Map<String, Value>,
    pub description: String,
    pub env: Option<EnvSource>,
    /// Evaluate expressions inside the env (default: yes).
    pub evaluate_env: Option<bool>,
    /// Additional options stored with the execution.
    pub params: Map<String, Value>,
}

impl StartWorkflow {
    pub fn new(workflow: impl Into<String>) -> Self {
        Self {
            workflow: workflow.into(),
            ..Self::default()
        }
    }

    pub fn with_input(mut self, input: Map<String, Value>) -> Self {
        self.input = input;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_execution_id(mut self, id: Uuid) -> Self {
        self.execution_id = Some(id);
        self
    }

    pub fn with_env(mut self, env: EnvSource) -> Self {
        self.env = Some(env);
        self
    }
}

fn result_map(message: Option<&str>) -> Map<String, Value> {
    Map::from_iter([("result".to_string(), json!(message.unwrap_or_default()))])
}

pub struct WorkflowCoordinator;

impl WorkflowCoordinator {
    // -----------------------------------------------------------------------
    // Start
    // -----------------------------------------------------------------------

    pub async fn start<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        request: StartWorkflow,
    ) -> Result<WorkflowExecution, EngineError> {
        if let Some(id) = request.execution_id {
            if let Some(existing) = scope.tx.get_workflow_execution(id).await? {
                tracing::debug!(workflow_execution_id = %id, "workflow execution already exists");
                return Ok(existing);
            }
        }

        let def = scope
            .tx
            .get_workflow_definition(&request.workflow, &request.namespace)
            .await?
            .ok_or_else(|| {
                EngineError::not_found(
                    EntityKind::WorkflowDefinition,
                    qualified(&request.workflow, &request.namespace),
                )
            })?;
        let input = validate_input(&def.name, "workflow", &def.spec.input, request.input)?;

        let env = match request.env {
            None => None,
            Some(EnvSource::Inline(variables)) => Some(variables),
            Some(EnvSource::Named(name)) => Some(
                scope
                    .tx
                    .get_environment(&name)
                    .await?
                    .ok_or_else(|| EngineError::not_found(EntityKind::Environment, &name))?
                    .variables,
            ),
        };
        let env = match env {
            Some(env) if request.evaluate_env != Some(false) => {
                Some(evaluate_map(scope.evaluator(), &env, &Value::Object(input.clone()))?)
            }
            other => other,
        };

        let params = WorkflowParams {
            env,
            evaluate_env: request.evaluate_env,
            task_execution_id: None,
            index: None,
            extra: request.params,
        };
        let id = request.execution_id.unwrap_or_else(Uuid::now_v7);
        let wf_ex = new_workflow_execution(id, def, input, params, request.description);

        match Self::launch(scope, wf_ex).await {
            Err(EngineError::Storage(RepositoryError::Duplicate(_))) => {
                tracing::debug!(workflow_execution_id = %id, "concurrent start, returning existing execution");
                scope.workflow_execution(id).await
            }
            other => other,
        }
    }

    /// Start a sub-workflow for one run of `task_ex`.
    pub async fn create_subworkflow<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        parent: &WorkflowExecution,
        task_ex: &TaskExecution,
        name: &str,
        input: Map<String, Value>,
        index: usize,
    ) -> Result<WorkflowExecution, EngineError> {
        let def = match scope.tx.get_workflow_definition(name, &task_ex.namespace).await? {
            Some(def) => def,
            None => scope
                .tx
                .get_workflow_definition(name, "")
                .await?
                .ok_or_else(|| {
                    EngineError::not_found(
                        EntityKind::WorkflowDefinition,
                        qualified(name, &task_ex.namespace),
                    )
                })?,
        };

        let (declared, mut extra) = split_undeclared(&def.spec.input, input);
        let input = validate_input(&def.name, "workflow", &def.spec.input, declared)?;
        extra.insert("namespace".to_string(), json!(task_ex.namespace));

        let params = WorkflowParams {
            env: None,
            evaluate_env: None,
            task_execution_id: Some(task_ex.id),
            index: Some(index),
            extra,
        };
        let mut wf_ex = new_workflow_execution(Uuid::now_v7(), def, input, params, String::new());
        wf_ex.project_id = parent.project_id.clone();
        wf_ex.root_execution_id = Some(parent.root_execution_id.unwrap_or(parent.id));
        wf_ex.task_execution_id = Some(task_ex.id);

        tracing::info!(
            parent_execution_id = %parent.id,
            task = %task_ex.name,
            workflow = %wf_ex.name,
            index,
            "starting sub-workflow"
        );
        Self::launch(scope, wf_ex).await
    }

    async fn launch<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        mut wf_ex: WorkflowExecution,
    ) -> Result<WorkflowExecution, EngineError> {
        let depth = scope.config().max_env_depth;
        let env = env_layer(workflow_environment(&mut scope.tx, &wf_ex, depth).await?);
        wf_ex.context = initial_context(scope.evaluator(), &wf_ex, &env)?;
        scope.tx.insert_workflow_execution(&wf_ex).await?;

        ensure_transition(
            EntityKind::WorkflowExecution,
            wf_ex.id,
            wf_ex.state,
            ExecutionState::Running,
        )?;
        wf_ex.state = ExecutionState::Running;
        wf_ex.updated_at = Utc::now();
        scope.tx.update_workflow_execution(&wf_ex).await?;

        tracing::info!(
            workflow_execution_id = %wf_ex.id,
            workflow = %wf_ex.name,
            "workflow started"
        );

        for spec in controller::start_tasks(&wf_ex.spec)? {
            TaskCoordinator::create(scope, &wf_ex, spec, Map::new(), Vec::new()).await?;
        }

        Self::check_and_complete(scope, wf_ex.id).await?;
        scope.workflow_execution(wf_ex.id).await
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Finish a RUNNING workflow once none of its tasks has work left.
    pub async fn check_and_complete<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        id: Uuid,
    ) -> Result<(), EngineError> {
        let mut wf_ex = scope.workflow_execution(id).await?;
        if wf_ex.state != ExecutionState::Running {
            return Ok(());
        }

        let tasks = scope.tx.list_task_executions(id).await?;
        if controller::has_incomplete_tasks(&tasks) {
            return Ok(());
        }

        let failed = controller::unhandled_errors(&tasks);
        let (state, state_info) = if !failed.is_empty() {
            (ExecutionState::Error, Some(controller::failure_message(&failed)))
        } else if tasks.iter().any(|t| t.state == ExecutionState::Cancelled) {
            let cancelled: Vec<&str> = tasks
                .iter()
                .filter(|t| t.state == ExecutionState::Cancelled)
                .map(|t| t.name.as_str())
                .collect();
            (
                ExecutionState::Cancelled,
                Some(format!("Cancelled tasks: {}", cancelled.join(", "))),
            )
        } else {
            (ExecutionState::Success, None)
        };

        Self::finish(scope, &mut wf_ex, state, state_info, &tasks).await
    }

    /// Move the workflow to a terminal state and compute its output. A
    /// sub-workflow reports back to its parent task after commit.
    async fn finish<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        wf_ex: &mut WorkflowExecution,
        state: ExecutionState,
        state_info: Option<String>,
        tasks: &[TaskExecution],
    ) -> Result<(), EngineError> {
        ensure_transition(EntityKind::WorkflowExecution, wf_ex.id, wf_ex.state, state)?;

        let depth = scope.config().max_env_depth;
        let env = env_layer(workflow_environment(&mut scope.tx, wf_ex, depth).await?);
        let strategy = scope.strategy();

        let (state, state_info, output) = match state {
            ExecutionState::Success => {
                let final_context = controller::final_context(strategy, tasks);
                match evaluate_workflow_output(
                    scope.evaluator(),
                    strategy,
                    wf_ex,
                    &final_context,
                    &env,
                    false,
                ) {
                    Ok(output) => (state, state_info, output),
                    Err(e) => {
                        let message = format!("Failed to evaluate workflow output: {e}");
                        tracing::warn!(workflow_execution_id = %wf_ex.id, error = %e, "workflow output evaluation failed");
                        let output = result_map(Some(&message));
                        (ExecutionState::Error, Some(message), output)
                    }
                }
            }
            ExecutionState::Error => {
                let mut output = result_map(state_info.as_deref());
                let final_context = controller::final_context(strategy, tasks);
                match evaluate_workflow_output(
                    scope.evaluator(),
                    strategy,
                    wf_ex,
                    &final_context,
                    &env,
                    true,
                ) {
                    Ok(extra) => merge_maps(&mut output, &extra),
                    Err(e) => {
                        tracing::warn!(workflow_execution_id = %wf_ex.id, error = %e, "output-on-error evaluation failed");
                    }
                }
                (state, state_info, output)
            }
            _ => {
                let output = result_map(state_info.as_deref());
                (state, state_info, output)
            }
        };

        wf_ex.state = state;
        wf_ex.state_info = state_info;
        wf_ex.output = output;
        wf_ex.updated_at = Utc::now();
        scope.tx.update_workflow_execution(wf_ex).await?;

        tracing::info!(
            workflow_execution_id = %wf_ex.id,
            workflow = %wf_ex.name,
            state = %wf_ex.state,
            "workflow finished"
        );

        if wf_ex.is_subworkflow() {
            let output = Value::Object(wf_ex.output.clone());
            let result = match wf_ex.state {
                ExecutionState::Success => ActionResult::Success(output),
                ExecutionState::Cancelled => ActionResult::Cancelled,
                _ => ActionResult::Error(output),
            };
            scope.defer(Effect::CompleteAction {
                id: wf_ex.id,
                result,
                is_workflow: true,
            });
        }
        Ok(())
    }

    /// A sub-workflow's result reaches its parent task.
    ///
    /// Completing a sub-workflow that is still running stops it with the
    /// state of `result`.
    pub async fn on_workflow_action_complete<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        id: Uuid,
        result: ActionResult,
    ) -> Result<WorkflowExecution, EngineError> {
        let mut wf_ex = scope.workflow_execution(id).await?;

        if !wf_ex.state.is_completed() {
            let message = match &result {
                ActionResult::Error(payload) => describe(payload),
                _ => None,
            };
            return Self::stop(scope, id, result.state(), message).await;
        }
        if wf_ex.accepted {
            tracing::debug!(workflow_execution_id = %id, "sub-workflow result already accepted");
            return Ok(wf_ex);
        }

        wf_ex.accepted = true;
        wf_ex.updated_at = Utc::now();
        scope.tx.update_workflow_execution(&wf_ex).await?;

        if let Some(task_id) = wf_ex.task_execution_id {
            TaskCoordinator::on_action_complete(scope, task_id).await?;
        }
        Ok(wf_ex)
    }

    /// Out-of-band state change of a sub-workflow.
    pub async fn on_workflow_action_update<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        id: Uuid,
        state: ExecutionState,
    ) -> Result<WorkflowExecution, EngineError> {
        match state {
            ExecutionState::Paused => Self::pause(scope, id).await,
            ExecutionState::Running => Self::resume(scope, id, None).await,
            other => {
                let wf_ex = scope.workflow_execution(id).await?;
                Err(EngineError::InvalidStateTransition {
                    kind: EntityKind::WorkflowExecution,
                    id,
                    from: wf_ex.state,
                    to: other,
                    reason: Some("only PAUSED and RUNNING apply to a workflow action".to_string()),
                })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle control
    // -----------------------------------------------------------------------

    pub async fn pause<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        id: Uuid,
    ) -> Result<WorkflowExecution, EngineError> {
        let mut wf_ex = scope.workflow_execution(id).await?;
        if wf_ex.state == ExecutionState::Paused {
            return Ok(wf_ex);
        }
        ensure_transition(
            EntityKind::WorkflowExecution,
            id,
            wf_ex.state,
            ExecutionState::Paused,
        )?;

        wf_ex.state = ExecutionState::Paused;
        wf_ex.updated_at = Utc::now();
        scope.tx.update_workflow_execution(&wf_ex).await?;
        tracing::info!(workflow_execution_id = %id, "workflow paused");

        for child in Self::running_children(scope, id).await? {
            scope.defer(Effect::PauseWorkflow(child.id));
        }
        Ok(wf_ex)
    }

    pub async fn resume<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        id: Uuid,
        env: Option<Map<String, Value>>,
    ) -> Result<WorkflowExecution, EngineError> {
        let mut wf_ex = scope.workflow_execution(id).await?;

        if wf_ex.state == ExecutionState::Error {
            // A failed workflow takes env updates for a later rerun.
            let Some(env) = env else {
                return Err(EngineError::NotAllowed(
                    "A workflow execution in ERROR can only be continued by rerunning a task."
                        .to_string(),
                ));
            };
            update_env(&mut wf_ex, env)?;
            wf_ex.updated_at = Utc::now();
            scope.tx.update_workflow_execution(&wf_ex).await?;
            tracing::info!(workflow_execution_id = %id, "env updated on failed workflow");
            return Ok(wf_ex);
        }

        if !wf_ex.state.is_paused_or_idle() {
            if env.is_some() {
                return Err(EngineError::NotAllowed(ENV_UPDATE_MESSAGE.to_string()));
            }
            tracing::debug!(workflow_execution_id = %id, state = %wf_ex.state, "workflow not paused, nothing to resume");
            return Ok(wf_ex);
        }

        if let Some(env) = env {
            update_env(&mut wf_ex, env)?;
        }
        ensure_transition(
            EntityKind::WorkflowExecution,
            id,
            wf_ex.state,
            ExecutionState::Running,
        )?;
        wf_ex.state = ExecutionState::Running;
        wf_ex.state_info = None;
        wf_ex.updated_at = Utc::now();
        scope.tx.update_workflow_execution(&wf_ex).await?;
        tracing::info!(workflow_execution_id = %id, "workflow resumed");

        let now = Utc::now();
        for mut task_ex in scope.tx.list_task_executions(id).await? {
            match task_ex.state {
                ExecutionState::Idle => scope.defer(Effect::RunTask(task_ex.id)),
                ExecutionState::Waiting => scope.defer(Effect::RefreshJoin(task_ex.id)),
                ExecutionState::RunningDelayed => {
                    if task_ex
                        .runtime_context
                        .policies
                        .continue_at
                        .is_some_and(|at| at <= now)
                    {
                        scope.defer(Effect::RunJob(JobKind::ContinueTask {
                            task_execution_id: task_ex.id,
                        }));
                    }
                }
                state
                    if state.is_completed()
                        && !task_ex.processed
                        && wf_ex.state == ExecutionState::Running =>
                {
                    TaskCoordinator::process_completed(scope, &mut wf_ex, &mut task_ex).await?;
                }
                _ => {}
            }
        }
        for child in Self::running_children(scope, id).await? {
            if child.state == ExecutionState::Paused {
                scope.defer(Effect::ResumeWorkflow(child.id));
            }
        }

        scope.defer(Effect::CheckAndComplete(id));
        scope.workflow_execution(id).await
    }

    /// Force the workflow into SUCCESS, ERROR or CANCELLED. Cancelling also
    /// cancels unfinished tasks and their children.
    pub async fn stop<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        id: Uuid,
        state: ExecutionState,
        message: Option<String>,
    ) -> Result<WorkflowExecution, EngineError> {
        if !matches!(
            state,
            ExecutionState::Success | ExecutionState::Error | ExecutionState::Cancelled
        ) {
            return Err(EngineError::Validation(format!(
                "Invalid state for stopping a workflow execution: {state}"
            )));
        }

        let mut wf_ex = scope.workflow_execution(id).await?;
        if wf_ex.state == state {
            return Ok(wf_ex);
        }
        ensure_transition(EntityKind::WorkflowExecution, id, wf_ex.state, state)?;

        if state == ExecutionState::Cancelled {
            for mut task_ex in scope.tx.list_task_executions(id).await? {
                TaskCoordinator::cancel(scope, &mut task_ex, message.clone()).await?;
            }
        }

        let tasks = scope.tx.list_task_executions(id).await?;
        Self::finish(scope, &mut wf_ex, state, message, &tasks).await?;
        Ok(wf_ex)
    }

    /// Re-run a failed task and reopen the workflow (and its failed
    /// ancestors).
    pub async fn rerun<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        task_id: Uuid,
        reset: Option<bool>,
        skip: bool,
        env: Option<Map<String, Value>>,
    ) -> Result<WorkflowExecution, EngineError> {
        let mut task_ex = scope.task_execution(task_id).await?;
        let mut wf_ex = scope.workflow_execution(task_ex.workflow_execution_id).await?;

        if task_ex.state != ExecutionState::Error {
            return Err(EngineError::Validation(format!(
                "The current task execution must be in ERROR for rerun. [task_execution_id={}, state={}]",
                task_ex.id, task_ex.state
            )));
        }
        if task_ex.workflow_name != wf_ex.name {
            return Err(EngineError::Validation(format!(
                "Workflow name does not match. [task_workflow={}, workflow={}]",
                task_ex.workflow_name, wf_ex.name
            )));
        }
        if wf_ex.spec.task(&task_ex.name).is_none() {
            return Err(EngineError::Validation(format!(
                "Task name does not match. [task={}, workflow={}]",
                task_ex.name, wf_ex.name
            )));
        }

        let reset = if skip {
            false
        } else {
            match (task_ex.spec.is_with_items(), reset) {
                (true, None) => {
                    return Err(EngineError::Validation(
                        "Reset field is mandatory to rerun task.".to_string(),
                    ));
                }
                (false, Some(false)) => {
                    return Err(EngineError::Validation(
                        "Only with-items task has the option to not reset.".to_string(),
                    ));
                }
                (_, reset) => reset.unwrap_or(true),
            }
        };

        if wf_ex.state == ExecutionState::Paused {
            tracing::debug!(workflow_execution_id = %wf_ex.id, "workflow is paused, rerun ignored");
            return Ok(wf_ex);
        }

        if let Some(env) = env {
            update_env(&mut wf_ex, env)?;
        }
        if wf_ex.state != ExecutionState::Running {
            ensure_transition(
                EntityKind::WorkflowExecution,
                wf_ex.id,
                wf_ex.state,
                ExecutionState::Running,
            )?;
            wf_ex.state = ExecutionState::Running;
            wf_ex.state_info = None;
        }
        wf_ex.accepted = false;
        wf_ex.updated_at = Utc::now();
        scope.tx.update_workflow_execution(&wf_ex).await?;

        Self::reopen_ancestors(scope, wf_ex.task_execution_id).await?;
        TaskCoordinator::rerun(scope, &mut wf_ex, &mut task_ex, reset, skip).await?;

        scope.defer(Effect::CheckAndComplete(wf_ex.id));
        scope.workflow_execution(wf_ex.id).await
    }

    /// Walk up the parent chain, putting failed parent tasks and workflows
    /// back into RUNNING.
    async fn reopen_ancestors<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        mut parent_task: Option<Uuid>,
    ) -> Result<(), EngineError> {
        let max_depth = scope.config().max_env_depth;

        for _ in 0..max_depth {
            let Some(task_id) = parent_task else {
                return Ok(());
            };

            let mut task_ex = scope.task_execution(task_id).await?;
            if task_ex.state == ExecutionState::Error {
                TaskCoordinator::reopen(&mut task_ex);
                scope.tx.update_task_execution(&task_ex).await?;
            }

            let mut wf_ex = scope.workflow_execution(task_ex.workflow_execution_id).await?;
            if wf_ex.state == ExecutionState::Error {
                wf_ex.state = ExecutionState::Running;
                wf_ex.state_info = None;
            }
            wf_ex.accepted = false;
            wf_ex.updated_at = Utc::now();
            scope.tx.update_workflow_execution(&wf_ex).await?;

            parent_task = wf_ex.task_execution_id;
        }

        Err(EngineError::Validation(format!(
            "workflow execution parent chain is deeper than {max_depth}"
        )))
    }

    async fn running_children<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        id: Uuid,
    ) -> Result<Vec<WorkflowExecution>, EngineError> {
        let mut children = Vec::new();
        for task_ex in scope.tx.list_task_executions(id).await? {
            if task_ex.state.is_completed()
                || !matches!(task_ex.spec.invocation(), Invocation::Workflow(_))
            {
                continue;
            }
            for child in scope.tx.list_child_workflow_executions(task_ex.id).await? {
                if !child.state.is_completed() {
                    children.push(child);
                }
            }
        }
        Ok(children)
    }
}

fn qualified(name: &str, namespace: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}.{name}")
    }
}

fn new_workflow_execution(
    id: Uuid,
    def: WorkflowDefinition,
    input: Map<String, Value>,
    params: WorkflowParams,
    description: String,
) -> WorkflowExecution {
    let now = Utc::now();
    WorkflowExecution {
        id,
        name: def.name,
        workflow_id: def.id,
        namespace: def.namespace,
        description,
        project_id: DEFAULT_PROJECT.to_string(),
        state: ExecutionState::Idle,
        state_info: None,
        spec: def.spec,
        input,
        params,
        context: Map::new(),
        output: Map::new(),
        root_execution_id: None,
        task_execution_id: None,
        accepted: false,
        created_at: now,
        updated_at: now,
    }
}

/// Merge new env variables into a workflow that is IDLE, PAUSED or in
/// ERROR.
fn update_env(wf_ex: &mut WorkflowExecution, env: Map<String, Value>) -> Result<(), EngineError> {
    if !matches!(
        wf_ex.state,
        ExecutionState::Idle | ExecutionState::Paused | ExecutionState::Error
    ) {
        return Err(EngineError::NotAllowed(ENV_UPDATE_MESSAGE.to_string()));
    }
    merge_maps(wf_ex.params.env.get_or_insert_with(Map::new), &env);
    Ok(())
}
