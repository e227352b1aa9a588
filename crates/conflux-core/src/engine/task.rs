//! Task execution coordinator.
//!
//! Owns one task's lifecycle: creation (including join bookkeeping), first
//! run, with-items fan-out, task policies, completion with publish and
//! successor dispatch (engine commands included), rerun and cancellation.
//! Work for other tasks is never done inline; it is queued on the scope as
//! effects. Delayed policy work is persisted as scheduled jobs.

use std::time::Duration;

use chrono::Utc;
use conflux_types::definition::{EngineCommand, Invocation, PolicySpec, TaskKind, TaskSpec};
use conflux_types::execution::{
    JobKind, PolicyState, TaskExecution, TaskRuntimeContext, TriggeredBy, WithItemsProgress,
    WorkflowExecution,
};
use conflux_types::state::ExecutionState;
use serde_json::{Map, Value};

use crate::repository::StoreTransaction;
use crate::workflow::context::ContextView;
use crate::workflow::definition::WorkflowError;
use crate::workflow::expression::{evaluate_map, evaluate_str};
use crate::workflow::retry::RetryHandler;

use super::action::{describe, ActionCoordinator, NewAction};
use super::controller::{self, NextTasks};
use super::data_flow::{
    env_layer, evaluate_upstream_context, load_children, outbound_context, publish_variables,
    task_marker, task_result, task_view, workflow_environment,
};
use super::error::{ensure_transition, EngineError, EntityKind};
use super::policy::{self, condition_holds, FAIL_ON_MESSAGE, PAUSE_BEFORE_MESSAGE};
use super::scope::{Effect, ExecutionScope};
use super::with_items;
use super::workflow::WorkflowCoordinator;

const WAITING_MESSAGE: &str = "Task is waiting.";

/// Build a new task execution record for `spec`.
pub(crate) fn new_task_execution(
    wf_ex: &WorkflowExecution,
    spec: &TaskSpec,
    state: ExecutionState,
    in_context: Map<String, Value>,
    triggered_by: Vec<TriggeredBy>,
) -> TaskExecution {
    let now = Utc::now();
    TaskExecution {
        id: uuid::Uuid::now_v7(),
        name: spec.name.clone(),
        workflow_execution_id: wf_ex.id,
        workflow_name: wf_ex.name.clone(),
        workflow_id: wf_ex.workflow_id,
        namespace: wf_ex.namespace.clone(),
        project_id: wf_ex.project_id.clone(),
        spec: spec.clone(),
        state,
        state_info: None,
        in_context,
        published: Map::new(),
        published_global: Map::new(),
        runtime_context: TaskRuntimeContext {
            triggered_by,
            ..TaskRuntimeContext::default()
        },
        processed: false,
        next_tasks: Vec::new(),
        has_next_tasks: false,
        error_handled: false,
        unique_key: None,
        started_at: None,
        finished_at: None,
        created_at: now,
        updated_at: now,
    }
}

pub struct TaskCoordinator;

impl TaskCoordinator {
    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Create the execution for a task the workflow should run next.
    ///
    /// Regular tasks are created IDLE and started after commit. All triggers
    /// of a join task share one WAITING execution found by its unique key.
    pub async fn create<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        wf_ex: &WorkflowExecution,
        spec: &TaskSpec,
        in_context: Map<String, Value>,
        triggered_by: Vec<TriggeredBy>,
    ) -> Result<(), EngineError> {
        if !spec.is_join() {
            let task_ex =
                new_task_execution(wf_ex, spec, ExecutionState::Idle, in_context, triggered_by);
            scope.tx.insert_task_execution(&task_ex).await?;
            tracing::debug!(
                workflow_execution_id = %wf_ex.id,
                task = %task_ex.name,
                task_execution_id = %task_ex.id,
                "created task execution"
            );
            scope.defer(Effect::RunTask(task_ex.id));
            return Ok(());
        }

        let key = controller::join_key(wf_ex.id, &spec.name);
        scope.tx.acquire_named_lock(&key).await?;

        match scope.tx.find_task_execution_by_unique_key(&key).await? {
            Some(mut existing) => {
                if existing.state.is_completed() {
                    tracing::debug!(task = %spec.name, "join task already completed");
                    return Ok(());
                }
                for trigger in triggered_by {
                    if !existing.runtime_context.triggered_by.contains(&trigger) {
                        existing.runtime_context.triggered_by.push(trigger);
                    }
                }
                existing.updated_at = Utc::now();
                scope.tx.update_task_execution(&existing).await?;
                scope.defer(Effect::RefreshJoin(existing.id));
            }
            None => {
                let mut task_ex = new_task_execution(
                    wf_ex,
                    spec,
                    ExecutionState::Waiting,
                    Map::new(),
                    triggered_by,
                );
                task_ex.unique_key = Some(key);
                task_ex.state_info = Some(WAITING_MESSAGE.to_string());
                scope.tx.insert_task_execution(&task_ex).await?;
                tracing::debug!(
                    workflow_execution_id = %wf_ex.id,
                    task = %task_ex.name,
                    "created waiting join task"
                );
                scope.defer(Effect::RefreshJoin(task_ex.id));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Running
    // -----------------------------------------------------------------------

    /// Start an IDLE task. Tasks of a workflow that is not running stay
    /// IDLE and are picked up on resume.
    pub async fn run<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        task_id: uuid::Uuid,
    ) -> Result<TaskExecution, EngineError> {
        let mut task_ex = scope.task_execution(task_id).await?;
        let mut wf_ex = scope.workflow_execution(task_ex.workflow_execution_id).await?;

        if wf_ex.state != ExecutionState::Running {
            tracing::debug!(
                task = %task_ex.name,
                workflow_state = %wf_ex.state,
                "workflow is not running, task not started"
            );
            return Ok(task_ex);
        }

        match task_ex.state {
            ExecutionState::Idle => Self::start(scope, &mut wf_ex, &mut task_ex).await?,
            ExecutionState::Waiting => return Self::refresh_join(scope, task_id).await,
            state => {
                tracing::debug!(task = %task_ex.name, state = %state, "task already started");
            }
        }
        Ok(task_ex)
    }

    async fn start<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        wf_ex: &mut WorkflowExecution,
        task_ex: &mut TaskExecution,
    ) -> Result<(), EngineError> {
        let policies = wf_ex.spec.effective_policies(&task_ex.spec);

        let pause = match &policies.pause_before {
            Some(condition) if !task_ex.runtime_context.policies.pause_before_done => {
                let ctx = Self::policy_context(scope, wf_ex, task_ex, None).await?;
                condition_holds(scope.evaluator(), condition, &ctx)
            }
            _ => Ok(false),
        };
        if let Ok(true) = pause {
            return Self::pause_before(scope, wf_ex, task_ex).await;
        }

        ensure_transition(
            EntityKind::TaskExecution,
            task_ex.id,
            task_ex.state,
            ExecutionState::Running,
        )?;
        let now = Utc::now();
        task_ex.state = ExecutionState::Running;
        task_ex.state_info = None;
        task_ex.started_at = Some(now);
        task_ex.updated_at = now;
        task_ex.runtime_context.policies.run += 1;
        scope.tx.update_task_execution(task_ex).await?;

        tracing::info!(
            workflow_execution_id = %wf_ex.id,
            task = %task_ex.name,
            task_execution_id = %task_ex.id,
            "task started"
        );

        let outcome = match pause {
            Err(e) => Err(e),
            _ => Self::begin_work(scope, wf_ex, task_ex, &policies).await,
        };
        Self::fail_on_task_error(scope, wf_ex, task_ex, outcome).await
    }

    /// Arm the timeout, honour wait-before, then schedule the work.
    async fn begin_work<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        wf_ex: &mut WorkflowExecution,
        task_ex: &mut TaskExecution,
        policies: &PolicySpec,
    ) -> Result<(), EngineError> {
        if let Some(timeout_secs) = policy::positive(policies.timeout_secs) {
            let job = JobKind::FailTaskIfIncomplete {
                task_execution_id: task_ex.id,
                timeout_secs,
                run: task_ex.runtime_context.policies.run,
            };
            scope.schedule(timeout_secs, job).await?;
        }

        if let Some(delay) = policy::positive(policies.wait_before) {
            if !task_ex.runtime_context.policies.wait_before_done {
                task_ex.runtime_context.policies.wait_before_done = true;
                let job = JobKind::ContinueTask {
                    task_execution_id: task_ex.id,
                };
                return Self::hold(scope, task_ex, "wait-before", delay, job).await;
            }
        }

        Self::schedule_work(scope, wf_ex, task_ex).await
    }

    /// Park a task that is about to start and pause its workflow. The task
    /// starts normally once the workflow is resumed.
    async fn pause_before<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        wf_ex: &mut WorkflowExecution,
        task_ex: &mut TaskExecution,
    ) -> Result<(), EngineError> {
        task_ex.state = ExecutionState::Idle;
        task_ex.state_info = Some(PAUSE_BEFORE_MESSAGE.to_string());
        task_ex.runtime_context.policies.pause_before_done = true;
        task_ex.updated_at = Utc::now();
        scope.tx.update_task_execution(task_ex).await?;

        tracing::info!(
            workflow_execution_id = %wf_ex.id,
            task = %task_ex.name,
            "pausing workflow before task"
        );
        *wf_ex = WorkflowCoordinator::pause(scope, wf_ex.id).await?;
        Ok(())
    }

    /// Move a RUNNING task to RUNNING_DELAYED and schedule `job` to pick it
    /// up after `delay` seconds.
    async fn hold<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        task_ex: &mut TaskExecution,
        policy_name: &str,
        delay: u64,
        job: JobKind,
    ) -> Result<(), EngineError> {
        ensure_transition(
            EntityKind::TaskExecution,
            task_ex.id,
            task_ex.state,
            ExecutionState::RunningDelayed,
        )?;
        let continues = matches!(job, JobKind::ContinueTask { .. });
        let run_at = scope.schedule(delay, job).await?;

        task_ex.state = ExecutionState::RunningDelayed;
        task_ex.state_info = Some(policy::delayed_message(policy_name, delay));
        task_ex.runtime_context.policies.continue_at = continues.then_some(run_at);
        task_ex.updated_at = Utc::now();
        scope.tx.update_task_execution(task_ex).await?;

        tracing::info!(
            task = %task_ex.name,
            task_execution_id = %task_ex.id,
            policy = policy_name,
            delay,
            "task delayed"
        );
        Ok(())
    }

    /// Context policy conditions are evaluated over.
    async fn policy_context<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        wf_ex: &WorkflowExecution,
        task_ex: &TaskExecution,
        result: Option<&Value>,
    ) -> Result<Value, EngineError> {
        let env = Self::environment(scope, wf_ex).await?;
        let marker = task_marker(task_ex, result);
        Ok(task_view(scope.strategy(), &marker, None, &task_ex.in_context, &env, wf_ex).to_value())
    }

    /// Schedule the task's action(s) or sub-workflow(s). Bad input fails
    /// the task instead of the transaction.
    async fn schedule_work<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        wf_ex: &mut WorkflowExecution,
        task_ex: &mut TaskExecution,
    ) -> Result<(), EngineError> {
        let outcome = if task_ex.spec.is_with_items() {
            Self::schedule_items(scope, wf_ex, task_ex).await
        } else {
            Self::schedule_single(scope, wf_ex, task_ex).await
        };
        Self::fail_on_task_error(scope, wf_ex, task_ex, outcome).await
    }

    async fn fail_on_task_error<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        wf_ex: &mut WorkflowExecution,
        task_ex: &mut TaskExecution,
        outcome: Result<(), EngineError>,
    ) -> Result<(), EngineError> {
        match outcome {
            Err(e) if e.fails_task() => {
                tracing::warn!(
                    task = %task_ex.name,
                    task_execution_id = %task_ex.id,
                    error = %e,
                    "failed to schedule task work"
                );
                Self::complete(scope, wf_ex, task_ex, ExecutionState::Error, Some(e.to_string()))
                    .await
            }
            other => other,
        }
    }

    async fn environment<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        wf_ex: &WorkflowExecution,
    ) -> Result<Map<String, Value>, EngineError> {
        let depth = scope.config().max_env_depth;
        let env = workflow_environment(&mut scope.tx, wf_ex, depth).await?;
        Ok(env_layer(env))
    }

    async fn schedule_single<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        wf_ex: &WorkflowExecution,
        task_ex: &TaskExecution,
    ) -> Result<(), EngineError> {
        let env = Self::environment(scope, wf_ex).await?;
        let ctx = {
            let marker = task_marker(task_ex, None);
            task_view(scope.strategy(), &marker, None, &task_ex.in_context, &env, wf_ex).to_value()
        };
        Self::invoke(scope, wf_ex, task_ex, &ctx, 0).await
    }

    /// Evaluate the invocation input over `ctx` and schedule one action or
    /// sub-workflow run.
    async fn invoke<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        wf_ex: &WorkflowExecution,
        task_ex: &TaskExecution,
        ctx: &Value,
        index: usize,
    ) -> Result<(), EngineError> {
        let invocation = task_ex.spec.invocation();
        let input = evaluate_map(scope.evaluator(), invocation.input(), ctx)?;
        let target = match &task_ex.spec.target {
            Some(target) => describe(&evaluate_str(scope.evaluator(), target, ctx)?),
            None => None,
        };

        match invocation {
            Invocation::Action(action) => {
                ActionCoordinator::schedule(
                    scope,
                    NewAction {
                        name: &action.action,
                        namespace: &task_ex.namespace,
                        description: String::new(),
                        input,
                        index,
                        safe_rerun: task_ex.spec.safe_rerun,
                        target,
                        timeout: wf_ex
                            .spec
                            .effective_policies(&task_ex.spec)
                            .timeout_secs
                            .map(Duration::from_secs),
                        task: Some(task_ex),
                        root_execution_id: Some(wf_ex.root_execution_id.unwrap_or(wf_ex.id)),
                    },
                )
                .await?;
            }
            Invocation::Workflow(workflow) => {
                WorkflowCoordinator::create_subworkflow(
                    scope,
                    wf_ex,
                    task_ex,
                    &workflow.workflow,
                    input,
                    index,
                )
                .await?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // With-items
    // -----------------------------------------------------------------------

    async fn schedule_items<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        wf_ex: &mut WorkflowExecution,
        task_ex: &mut TaskExecution,
    ) -> Result<(), EngineError> {
        let TaskKind::WithItems(spec) = &task_ex.spec.kind else {
            return Self::schedule_single(scope, wf_ex, task_ex).await;
        };
        let clauses = spec.items.clone();
        let concurrency = spec.concurrency;

        scope
            .tx
            .acquire_named_lock(&with_items::lock_name(task_ex.id))
            .await?;

        let env = Self::environment(scope, wf_ex).await?;
        let strategy = scope.strategy();
        let marker = task_marker(task_ex, None);
        let base = task_view(strategy, &marker, None, &task_ex.in_context, &env, wf_ex).to_value();
        let items = with_items::evaluate_items(scope.evaluator(), &clauses, &base)?;

        let mut progress = *task_ex
            .runtime_context
            .with_items
            .get_or_insert(WithItemsProgress {
                count: items.len(),
                capacity: concurrency,
            });

        if items.is_empty() {
            return Self::complete(scope, wf_ex, task_ex, ExecutionState::Success, None).await;
        }

        let children = load_children(&mut scope.tx, task_ex).await?;
        let indexes = with_items::next_indexes(&progress, &children);

        for index in indexes {
            let Some(item) = items.get(index) else {
                break;
            };
            let ctx = task_view(
                strategy,
                &marker,
                Some(item),
                &task_ex.in_context,
                &env,
                wf_ex,
            )
            .to_value();
            Self::invoke(scope, wf_ex, task_ex, &ctx, index).await?;
            with_items::decrease_capacity(&mut progress)?;
        }

        task_ex.runtime_context.with_items = Some(progress);
        task_ex.updated_at = Utc::now();
        scope.tx.update_task_execution(task_ex).await?;
        Ok(())
    }

    async fn on_item_complete<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        wf_ex: &mut WorkflowExecution,
        task_ex: &mut TaskExecution,
    ) -> Result<(), EngineError> {
        scope
            .tx
            .acquire_named_lock(&with_items::lock_name(task_ex.id))
            .await?;

        let concurrency = match &task_ex.spec.kind {
            TaskKind::WithItems(spec) => spec.concurrency,
            _ => None,
        };
        let mut progress = task_ex
            .runtime_context
            .with_items
            .unwrap_or(WithItemsProgress {
                count: 0,
                capacity: concurrency,
            });
        with_items::increase_capacity(&mut progress, concurrency);
        task_ex.runtime_context.with_items = Some(progress);

        let children = load_children(&mut scope.tx, task_ex).await?;
        if with_items::is_completed(&progress, concurrency, &children) {
            let (state, state_info) = with_items::final_state(&children);
            return Self::complete(scope, wf_ex, task_ex, state, state_info).await;
        }

        task_ex.updated_at = Utc::now();
        scope.tx.update_task_execution(task_ex).await?;

        if concurrency.is_some() && with_items::has_more_iterations(&progress, &children) {
            let outcome = Self::schedule_items(scope, wf_ex, task_ex).await;
            return Self::fail_on_task_error(scope, wf_ex, task_ex, outcome).await;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Child notifications
    // -----------------------------------------------------------------------

    /// React to one of the task's actions or sub-workflows completing.
    pub async fn on_action_complete<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        task_id: uuid::Uuid,
    ) -> Result<(), EngineError> {
        let mut task_ex = scope.task_execution(task_id).await?;
        if task_ex.state.is_completed() || task_ex.state == ExecutionState::RunningDelayed {
            tracing::debug!(
                task = %task_ex.name,
                state = %task_ex.state,
                "task is not running, ignoring child result"
            );
            return Ok(());
        }
        let mut wf_ex = scope.workflow_execution(task_ex.workflow_execution_id).await?;

        if task_ex.spec.is_with_items() {
            return Self::on_item_complete(scope, &mut wf_ex, &mut task_ex).await;
        }

        let children = load_children(&mut scope.tx, &task_ex).await?;
        let Some(child) = children
            .iter()
            .rev()
            .find(|c| c.accepted && c.state.is_completed())
        else {
            tracing::debug!(task = %task_ex.name, "no accepted result yet");
            return Ok(());
        };

        let state = child.state;
        let state_info = match state {
            ExecutionState::Success => None,
            _ => child.state_info.clone().or_else(|| describe(&child.result)),
        };
        Self::complete(scope, &mut wf_ex, &mut task_ex, state, state_info).await
    }

    /// Mirror a child's out-of-band state change on the task.
    pub async fn on_action_update<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        task_id: uuid::Uuid,
        state: ExecutionState,
    ) -> Result<(), EngineError> {
        let mut task_ex = scope.task_execution(task_id).await?;

        if task_ex.state.is_completed()
            || task_ex.state == ExecutionState::RunningDelayed
            || task_ex.state == state
            || !task_ex.state.can_transition_to(state)
        {
            tracing::debug!(
                task = %task_ex.name,
                from = %task_ex.state,
                to = %state,
                "ignoring task update"
            );
            return Ok(());
        }

        if state == ExecutionState::Running {
            let children = load_children(&mut scope.tx, &task_ex).await?;
            if children.iter().any(|c| c.state == ExecutionState::Paused) {
                return Ok(());
            }
        }

        task_ex.state = state;
        task_ex.updated_at = Utc::now();
        scope.tx.update_task_execution(&task_ex).await?;

        match state {
            ExecutionState::Paused => scope.defer(Effect::PauseWorkflow(task_ex.workflow_execution_id)),
            ExecutionState::Running => {
                scope.defer(Effect::ResumeWorkflow(task_ex.workflow_execution_id))
            }
            _ => {}
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Joins
    // -----------------------------------------------------------------------

    /// Re-evaluate a WAITING join task: start it, fail it or record what
    /// it is blocked by.
    pub async fn refresh_join<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        task_id: uuid::Uuid,
    ) -> Result<TaskExecution, EngineError> {
        let mut task_ex = scope.task_execution(task_id).await?;
        if task_ex.state != ExecutionState::Waiting {
            return Ok(task_ex);
        }
        let mut wf_ex = scope.workflow_execution(task_ex.workflow_execution_id).await?;
        if wf_ex.state != ExecutionState::Running {
            return Ok(task_ex);
        }

        let tasks = scope.tx.list_task_executions(wf_ex.id).await?;
        let join = controller::join_state(&wf_ex.spec, &task_ex.spec, &tasks)?;

        match join.state {
            ExecutionState::Running => {
                let upstream: Vec<&TaskExecution> = tasks
                    .iter()
                    .filter(|t| join.triggered_by.iter().any(|tb| tb.task_id == t.id))
                    .collect();
                task_ex.in_context = evaluate_upstream_context(scope.strategy(), &upstream);
                task_ex.runtime_context.triggered_by = join.triggered_by;
                Self::start(scope, &mut wf_ex, &mut task_ex).await?;
            }
            ExecutionState::Error => {
                Self::complete(
                    scope,
                    &mut wf_ex,
                    &mut task_ex,
                    ExecutionState::Error,
                    join.state_info,
                )
                .await?;
            }
            _ => {
                if task_ex.state_info != join.state_info {
                    task_ex.state_info = join.state_info;
                    task_ex.updated_at = Utc::now();
                    scope.tx.update_task_execution(&task_ex).await?;
                }
            }
        }
        Ok(task_ex)
    }

    async fn refresh_waiting<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        wf_ex_id: uuid::Uuid,
    ) -> Result<(), EngineError> {
        for task_ex in scope.tx.list_task_executions(wf_ex_id).await? {
            if task_ex.state == ExecutionState::Waiting {
                scope.defer(Effect::RefreshJoin(task_ex.id));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Policy jobs
    // -----------------------------------------------------------------------

    /// Run a due policy job. Jobs for tasks that moved on in the meantime
    /// are dropped.
    pub async fn run_job<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        job: JobKind,
    ) -> Result<(), EngineError> {
        match job {
            JobKind::ContinueTask { task_execution_id } => {
                Self::continue_task(scope, task_execution_id).await
            }
            JobKind::CompleteTask {
                task_execution_id,
                state,
                state_info,
            } => Self::complete_delayed(scope, task_execution_id, state, state_info).await,
            JobKind::FailTaskIfIncomplete {
                task_execution_id,
                timeout_secs,
                run,
            } => Self::fail_if_incomplete(scope, task_execution_id, timeout_secs, run).await,
        }
    }

    async fn continue_task<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        task_id: uuid::Uuid,
    ) -> Result<(), EngineError> {
        let Some(mut task_ex) = scope.tx.get_task_execution(task_id).await? else {
            return Ok(());
        };
        if task_ex.state != ExecutionState::RunningDelayed
            || task_ex.runtime_context.policies.continue_at.is_none()
        {
            tracing::debug!(task = %task_ex.name, state = %task_ex.state, "task is not waiting to continue");
            return Ok(());
        }
        let mut wf_ex = scope.workflow_execution(task_ex.workflow_execution_id).await?;
        // Resume continues delayed tasks that came due while paused.
        if wf_ex.state != ExecutionState::Running {
            return Ok(());
        }

        ensure_transition(
            EntityKind::TaskExecution,
            task_ex.id,
            task_ex.state,
            ExecutionState::Running,
        )?;
        task_ex.state = ExecutionState::Running;
        task_ex.state_info = None;
        task_ex.runtime_context.policies.continue_at = None;
        task_ex.updated_at = Utc::now();
        scope.tx.update_task_execution(&task_ex).await?;

        tracing::info!(task = %task_ex.name, task_execution_id = %task_ex.id, "task continued");
        Self::schedule_work(scope, &mut wf_ex, &mut task_ex).await
    }

    async fn complete_delayed<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        task_id: uuid::Uuid,
        state: ExecutionState,
        state_info: Option<String>,
    ) -> Result<(), EngineError> {
        let Some(mut task_ex) = scope.tx.get_task_execution(task_id).await? else {
            return Ok(());
        };
        if task_ex.state != ExecutionState::RunningDelayed
            || task_ex.runtime_context.policies.continue_at.is_some()
        {
            return Ok(());
        }
        let mut wf_ex = scope.workflow_execution(task_ex.workflow_execution_id).await?;
        task_ex.state = ExecutionState::Running;
        Self::complete(scope, &mut wf_ex, &mut task_ex, state, state_info).await
    }

    async fn fail_if_incomplete<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        task_id: uuid::Uuid,
        timeout_secs: u64,
        run: u32,
    ) -> Result<(), EngineError> {
        let Some(mut task_ex) = scope.tx.get_task_execution(task_id).await? else {
            return Ok(());
        };
        if task_ex.state.is_completed() || task_ex.runtime_context.policies.run != run {
            return Ok(());
        }
        let mut wf_ex = scope.workflow_execution(task_ex.workflow_execution_id).await?;
        if wf_ex.state.is_completed() {
            return Ok(());
        }

        let message = policy::timeout_message(timeout_secs);
        tracing::info!(
            workflow_execution_id = %wf_ex.id,
            task = %task_ex.name,
            timeout_secs,
            "task timed out"
        );
        Self::cancel_children(scope, &task_ex, Some(message.clone())).await?;
        Self::complete(
            scope,
            &mut wf_ex,
            &mut task_ex,
            ExecutionState::Error,
            Some(message),
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Move the task to a terminal state: publish, pick successors and
    /// dispatch them unless the workflow is paused.
    ///
    /// A finished attempt of a RUNNING task first goes through wait-after,
    /// fail-on and retry, which may hold it in RUNNING_DELAYED instead.
    /// Completing an already completed task is a no-op, except ERROR ->
    /// SKIPPED on rerun.
    pub async fn complete<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        wf_ex: &mut WorkflowExecution,
        task_ex: &mut TaskExecution,
        state: ExecutionState,
        state_info: Option<String>,
    ) -> Result<(), EngineError> {
        let skipping = task_ex.state == ExecutionState::Error && state == ExecutionState::Skipped;
        if task_ex.state.is_completed() && !skipping {
            tracing::debug!(
                task = %task_ex.name,
                state = %task_ex.state,
                "task already completed"
            );
            return Ok(());
        }

        let attempt_finished = task_ex.state == ExecutionState::Running
            && matches!(state, ExecutionState::Success | ExecutionState::Error);
        if matches!(
            task_ex.state,
            ExecutionState::Waiting | ExecutionState::RunningDelayed
        ) {
            task_ex.state = ExecutionState::Running;
        }
        ensure_transition(EntityKind::TaskExecution, task_ex.id, task_ex.state, state)?;

        let (state, state_info) = if attempt_finished {
            match Self::completion_policies(scope, wf_ex, task_ex, state, state_info).await? {
                Some(outcome) => outcome,
                None => return Ok(()),
            }
        } else {
            (state, state_info)
        };

        let now = Utc::now();
        task_ex.runtime_context.policies.continue_at = None;
        task_ex.state = state;
        task_ex.state_info = state_info;
        task_ex.finished_at = Some(now);
        task_ex.updated_at = now;

        let strategy = scope.strategy();
        let env = Self::environment(scope, wf_ex).await?;
        let children = load_children(&mut scope.tx, task_ex).await?;
        let result = task_result(&children, task_ex.spec.is_with_items());

        if let Err(e) = publish_variables(scope.evaluator(), strategy, task_ex, wf_ex, &env, &result) {
            tracing::warn!(task = %task_ex.name, error = %e, "failed to publish task variables");
            task_ex.state = ExecutionState::Error;
            task_ex.state_info = Some(format!("Failed to publish variables: {e}"));
            task_ex.published.clear();
        }

        if !task_ex.spec.keep_result {
            Self::clear_results(scope, task_ex).await?;
        }

        let outbound = outbound_context(strategy, task_ex);
        let next = {
            let marker = task_marker(task_ex, task_ex.spec.keep_result.then_some(&result));
            let ctx = task_view(strategy, &marker, None, &outbound, &env, wf_ex).to_value();
            controller::find_next_tasks(scope.evaluator(), task_ex, &ctx)
        };
        let next = next.unwrap_or_else(|e| {
            tracing::warn!(task = %task_ex.name, error = %e, "failed to evaluate transitions");
            task_ex.state = ExecutionState::Error;
            task_ex.state_info = Some(e.to_string());
            NextTasks::default()
        });
        task_ex.has_next_tasks = next
            .tasks
            .iter()
            .any(|t| EngineCommand::parse(&t.name).is_none());
        task_ex.error_handled = next.error_handled;
        task_ex.next_tasks = next.tasks;

        tracing::info!(
            workflow_execution_id = %wf_ex.id,
            task = %task_ex.name,
            state = %task_ex.state,
            "task completed"
        );

        let command = match wf_ex.state {
            ExecutionState::Paused => {
                task_ex.processed = false;
                None
            }
            s if s.is_completed() => {
                task_ex.processed = true;
                None
            }
            _ => {
                task_ex.processed = true;
                Self::dispatch(scope, wf_ex, task_ex, &outbound).await?
            }
        };

        scope.tx.update_task_execution(task_ex).await?;
        wf_ex.updated_at = now;
        scope.tx.update_workflow_execution(wf_ex).await?;

        Self::refresh_waiting(scope, wf_ex.id).await?;
        scope.defer(Effect::CheckAndComplete(wf_ex.id));

        if let Some(command) = command {
            *wf_ex = Self::run_command(scope, wf_ex, task_ex, command).await?;
        }
        Ok(())
    }

    /// Apply wait-after, fail-on and retry to a finished attempt. Returns
    /// the state to complete with, or `None` when the task was held back.
    async fn completion_policies<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        wf_ex: &WorkflowExecution,
        task_ex: &mut TaskExecution,
        state: ExecutionState,
        state_info: Option<String>,
    ) -> Result<Option<(ExecutionState, Option<String>)>, EngineError> {
        let policies = wf_ex.spec.effective_policies(&task_ex.spec);
        if policies.wait_after.is_none() && policies.fail_on.is_none() && policies.retry.is_none() {
            return Ok(Some((state, state_info)));
        }

        if let Some(delay) = policy::positive(policies.wait_after) {
            if !task_ex.runtime_context.policies.wait_after_done {
                task_ex.runtime_context.policies.wait_after_done = true;
                let job = JobKind::CompleteTask {
                    task_execution_id: task_ex.id,
                    state,
                    state_info,
                };
                Self::hold(scope, task_ex, "wait-after", delay, job).await?;
                return Ok(None);
            }
        }

        // Conditions see the outcome of this attempt.
        let ctx = {
            let children = load_children(&mut scope.tx, task_ex).await?;
            let result = task_result(&children, task_ex.spec.is_with_items());
            let mut attempt = task_ex.clone();
            attempt.state = state;
            attempt.state_info = state_info.clone();
            Self::policy_context(scope, wf_ex, &attempt, Some(&result)).await?
        };
        let failed = |policy: &str, e: EngineError| {
            Some((
                ExecutionState::Error,
                Some(format!("Failed to evaluate '{policy}' policy: {e}")),
            ))
        };

        let (mut state, mut state_info) = (state, state_info);
        if let (ExecutionState::Success, Some(condition)) = (state, &policies.fail_on) {
            match condition_holds(scope.evaluator(), condition, &ctx) {
                Ok(true) => {
                    state = ExecutionState::Error;
                    state_info = Some(FAIL_ON_MESSAGE.to_string());
                }
                Ok(false) => {}
                Err(e) => return Ok(failed("fail-on", e)),
            }
        }

        let Some(retry) = &policies.retry else {
            return Ok(Some((state, state_info)));
        };
        let break_on = match &retry.break_on {
            Some(expr) if state == ExecutionState::Error => {
                policy::expression_holds(scope.evaluator(), expr, &ctx)
            }
            _ => Ok(false),
        };
        let continue_on = retry
            .continue_on
            .as_deref()
            .map(|expr| policy::expression_holds(scope.evaluator(), expr, &ctx))
            .transpose();
        let (break_on, continue_on) = match (break_on, continue_on) {
            (Ok(break_on), Ok(continue_on)) => (break_on, continue_on),
            (Err(e), _) | (_, Err(e)) => return Ok(failed("retry", e)),
        };

        let retry_no = task_ex.runtime_context.policies.retry_no;
        if !RetryHandler::should_retry_task(retry, retry_no, state, break_on, continue_on) {
            return Ok(Some((state, state_info)));
        }

        let progress = &mut task_ex.runtime_context.policies;
        progress.retry_no += 1;
        progress.wait_after_done = false;
        Self::reset_children(scope, task_ex, true).await?;
        Self::restore_capacity(task_ex);

        tracing::info!(
            workflow_execution_id = %wf_ex.id,
            task = %task_ex.name,
            retry_no = retry_no + 1,
            count = retry.count,
            state = %state,
            "retrying task"
        );
        let job = JobKind::ContinueTask {
            task_execution_id: task_ex.id,
        };
        Self::hold(scope, task_ex, "retry", retry.delay, job).await?;
        Ok(None)
    }

    /// Apply an engine command reached through a transition.
    async fn run_command<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        wf_ex: &WorkflowExecution,
        task_ex: &TaskExecution,
        command: EngineCommand,
    ) -> Result<WorkflowExecution, EngineError> {
        tracing::info!(
            workflow_execution_id = %wf_ex.id,
            task = %task_ex.name,
            command = ?command,
            "running engine command"
        );
        match command {
            EngineCommand::Pause => WorkflowCoordinator::pause(scope, wf_ex.id).await,
            EngineCommand::Fail => {
                let message = if task_ex.state == ExecutionState::Error {
                    controller::failure_message(&[task_ex])
                } else {
                    format!("Failed by 'fail' command of task '{}'", task_ex.name)
                };
                WorkflowCoordinator::stop(scope, wf_ex.id, ExecutionState::Error, Some(message))
                    .await
            }
            EngineCommand::Succeed => {
                WorkflowCoordinator::stop(scope, wf_ex.id, ExecutionState::Success, None).await
            }
            EngineCommand::Noop => Ok(wf_ex.clone()),
        }
    }

    /// Dispatch successors of a task completed while its workflow was
    /// paused.
    pub async fn process_completed<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        wf_ex: &mut WorkflowExecution,
        task_ex: &mut TaskExecution,
    ) -> Result<(), EngineError> {
        let outbound = outbound_context(scope.strategy(), task_ex);
        task_ex.processed = true;
        task_ex.updated_at = Utc::now();
        scope.tx.update_task_execution(task_ex).await?;
        let command = Self::dispatch(scope, wf_ex, task_ex, &outbound).await?;
        Self::refresh_waiting(scope, wf_ex.id).await?;
        if let Some(command) = command {
            *wf_ex = Self::run_command(scope, wf_ex, task_ex, command).await?;
        }
        Ok(())
    }

    /// Create the successors of a completed task. Stops at a `fail` or
    /// `succeed` command and returns the command to run once the task is
    /// saved; successors listed around a `pause` are still created.
    async fn dispatch<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        wf_ex: &WorkflowExecution,
        task_ex: &TaskExecution,
        outbound: &Map<String, Value>,
    ) -> Result<Option<EngineCommand>, EngineError> {
        let mut pending = None;
        for next in &task_ex.next_tasks {
            match EngineCommand::parse(&next.name) {
                Some(EngineCommand::Noop) => continue,
                Some(EngineCommand::Pause) => {
                    pending = Some(EngineCommand::Pause);
                    continue;
                }
                Some(command) => return Ok(Some(command)),
                None => {}
            }
            let spec = wf_ex.spec.task(&next.name).ok_or_else(|| {
                WorkflowError::UnknownTask(format!(
                    "task '{}' transitions to unknown task '{}'",
                    task_ex.name, next.name
                ))
            })?;
            Self::create(
                scope,
                wf_ex,
                spec,
                outbound.clone(),
                vec![TriggeredBy {
                    task_id: task_ex.id,
                    event: next.event,
                }],
            )
            .await?;
        }
        Ok(pending)
    }

    async fn clear_results<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        task_ex: &TaskExecution,
    ) -> Result<(), EngineError> {
        match task_ex.spec.invocation() {
            Invocation::Action(_) => {
                for mut action_ex in scope.tx.list_action_executions(task_ex.id).await? {
                    if !action_ex.output.is_empty() {
                        action_ex.output.clear();
                        scope.tx.update_action_execution(&action_ex).await?;
                    }
                }
            }
            Invocation::Workflow(_) => {
                for mut child in scope.tx.list_child_workflow_executions(task_ex.id).await? {
                    if !child.output.is_empty() {
                        child.output.clear();
                        scope.tx.update_workflow_execution(&child).await?;
                    }
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Rerun and cancellation
    // -----------------------------------------------------------------------

    /// Re-run a failed task, or skip it. Preconditions are checked by the
    /// workflow coordinator.
    pub async fn rerun<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        wf_ex: &mut WorkflowExecution,
        task_ex: &mut TaskExecution,
        reset: bool,
        skip: bool,
    ) -> Result<(), EngineError> {
        if skip {
            tracing::info!(task = %task_ex.name, "skipping failed task");
            return Self::complete(scope, wf_ex, task_ex, ExecutionState::Skipped, None).await;
        }

        ensure_transition(
            EntityKind::TaskExecution,
            task_ex.id,
            task_ex.state,
            ExecutionState::Running,
        )?;
        Self::reopen(task_ex);
        let previous = &task_ex.runtime_context.policies;
        task_ex.runtime_context.policies = PolicyState {
            run: previous.run + 1,
            pause_before_done: previous.pause_before_done,
            ..PolicyState::default()
        };
        Self::reset_children(scope, task_ex, reset).await?;
        Self::restore_capacity(task_ex);
        scope.tx.update_task_execution(task_ex).await?;

        tracing::info!(
            workflow_execution_id = %wf_ex.id,
            task = %task_ex.name,
            reset,
            "rerunning task"
        );
        let policies = wf_ex.spec.effective_policies(&task_ex.spec);
        let outcome = Self::begin_work(scope, wf_ex, task_ex, &policies).await;
        Self::fail_on_task_error(scope, wf_ex, task_ex, outcome).await
    }

    /// Give a with-items task its full concurrency back.
    fn restore_capacity(task_ex: &mut TaskExecution) {
        if let TaskKind::WithItems(spec) = &task_ex.spec.kind {
            if let Some(progress) = task_ex.runtime_context.with_items.as_mut() {
                progress.capacity = spec.concurrency;
            }
        }
    }

    /// Put a failed task back into RUNNING without scheduling anything.
    pub(crate) fn reopen(task_ex: &mut TaskExecution) {
        task_ex.state = ExecutionState::Running;
        task_ex.state_info = None;
        task_ex.processed = false;
        task_ex.finished_at = None;
        task_ex.next_tasks.clear();
        task_ex.has_next_tasks = false;
        task_ex.error_handled = false;
        task_ex.updated_at = Utc::now();
    }

    /// Invalidate previous results: every child on reset, otherwise only
    /// accepted failed or cancelled ones.
    async fn reset_children<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        task_ex: &TaskExecution,
        reset: bool,
    ) -> Result<(), EngineError> {
        let invalidate = |accepted: bool, state: ExecutionState| {
            accepted
                && (reset || matches!(state, ExecutionState::Error | ExecutionState::Cancelled))
        };

        match task_ex.spec.invocation() {
            Invocation::Action(_) => {
                for mut action_ex in scope.tx.list_action_executions(task_ex.id).await? {
                    if invalidate(action_ex.accepted, action_ex.state) {
                        action_ex.accepted = false;
                        scope.tx.update_action_execution(&action_ex).await?;
                    }
                }
            }
            Invocation::Workflow(_) => {
                for mut child in scope.tx.list_child_workflow_executions(task_ex.id).await? {
                    if invalidate(child.accepted, child.state) {
                        child.accepted = false;
                        scope.tx.update_workflow_execution(&child).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Cancel a task that has not finished yet, along with its running
    /// actions and sub-workflows.
    pub async fn cancel<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        task_ex: &mut TaskExecution,
        message: Option<String>,
    ) -> Result<(), EngineError> {
        if task_ex.state.is_completed() {
            return Ok(());
        }
        if task_ex.state == ExecutionState::Waiting {
            task_ex.state = ExecutionState::Running;
        }
        ensure_transition(
            EntityKind::TaskExecution,
            task_ex.id,
            task_ex.state,
            ExecutionState::Cancelled,
        )?;

        let now = Utc::now();
        task_ex.state = ExecutionState::Cancelled;
        task_ex.state_info = message.clone();
        task_ex.processed = true;
        task_ex.finished_at = Some(now);
        task_ex.updated_at = now;
        scope.tx.update_task_execution(task_ex).await?;
        Self::cancel_children(scope, task_ex, message).await
    }

    /// Cancel the task's unfinished actions and sub-workflows.
    async fn cancel_children<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        task_ex: &TaskExecution,
        message: Option<String>,
    ) -> Result<(), EngineError> {
        match task_ex.spec.invocation() {
            Invocation::Action(_) => {
                for mut action_ex in scope.tx.list_action_executions(task_ex.id).await? {
                    ActionCoordinator::cancel(scope, &mut action_ex).await?;
                }
            }
            Invocation::Workflow(_) => {
                for child in scope.tx.list_child_workflow_executions(task_ex.id).await? {
                    if !child.state.is_completed() {
                        scope.defer(Effect::CancelWorkflow {
                            id: child.id,
                            message: message.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
