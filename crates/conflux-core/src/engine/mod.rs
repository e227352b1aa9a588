//! The workflow engine.
//!
//! [`Engine`] is the control surface: every operation opens a store
//! transaction, runs one coordinator call inside an [`ExecutionScope`],
//! commits, and then drains the effects the call queued. Each effect runs in
//! a transaction of its own, so one failed effect never undoes the operation
//! that queued it.
//!
//! - `action` -- action execution lifecycle
//! - `task` -- task execution lifecycle, joins and with-items
//! - `workflow` -- workflow execution lifecycle and output
//! - `controller` -- next-task, join and completion decisions
//! - `data_flow` -- expression contexts, publish, output
//! - `heartbeat` -- background expiry of silent asynchronous actions
//! - `policy` -- task policy vocabulary (retry, waits, timeout, pause, fail-on)
//! - `scheduler` -- background runner for due policy jobs

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use conflux_types::config::EngineConfig;
use conflux_types::definition::{Environment, WorkflowDefinition, WorkflowSpec};
use conflux_types::execution::{
    ActionExecution, ActionResult, TaskExecution, WorkflowExecution,
};
use conflux_types::state::ExecutionState;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::repository::{ExecutionStore, StoreTransaction};
use crate::workflow::definition::validate_spec;
use crate::workflow::expression::{ExpressionEvaluator, JexlEvaluator};
use crate::workflow::retry::RetryHandler;

/// Run `$body` in a fresh transaction, committing on success and rolling
/// back on error. Transient storage errors re-run the whole body with
/// backoff. Evaluates to `Result<(value, effects), EngineError>`.
///
/// `$body` must not use `?`: an early return would skip the rollback.
macro_rules! transactional {
    ($engine:expr, $op:literal, |$scope:ident| $body:expr) => {{
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let outcome = match $engine.store.begin().await {
                Err(e) => Err(EngineError::from(e)),
                Ok(tx) => {
                    #[allow(unused_mut)]
                    let mut $scope = ExecutionScope::new(tx, &$engine.services);
                    let result = $body;
                    match result {
                        Ok(value) => $scope.commit().await.map(|effects| (value, effects)),
                        Err(e) => {
                            $scope.rollback().await;
                            Err(e)
                        }
                    }
                }
            };
            match outcome {
                Err(e)
                    if RetryHandler::should_retry(
                        &$engine.services.config.transaction,
                        attempt,
                        e.is_transient(),
                    ) =>
                {
                    let delay =
                        RetryHandler::backoff_delay(&$engine.services.config.transaction, attempt);
                    tracing::warn!(
                        operation = $op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient storage error, retrying transaction"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => break other,
            }
        }
    }};
}

pub mod action;
pub mod controller;
pub mod data_flow;
pub mod error;
pub mod executor;
pub mod heartbeat;
pub mod input;
pub mod policy;
pub mod registry;
pub mod scheduler;
pub mod scope;
pub mod task;
pub mod with_items;
pub mod workflow;

#[cfg(test)]
mod tests;

pub use action::{ActionCoordinator, StartAction};
pub use error::{EngineError, EntityKind};
pub use executor::{ActionExecutor, ActionRequest, ExecutionContext, ExecutorError};
pub use heartbeat::{spawn_heartbeat_checker, HEARTBEAT_MESSAGE};
pub use registry::{ActionDescriptor, ActionRegistry};
pub use scheduler::spawn_job_scheduler;
pub use scope::{Effect, EngineServices, ExecutionScope};
pub use task::TaskCoordinator;
pub use workflow::{EnvSource, StartWorkflow, WorkflowCoordinator};

/// Record returned by completion and update calls, which accept either an
/// action execution or a sub-workflow execution.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionRecord {
    Action(ActionExecution),
    Workflow(WorkflowExecution),
}

impl ExecutionRecord {
    pub fn id(&self) -> Uuid {
        match self {
            ExecutionRecord::Action(a) => a.id,
            ExecutionRecord::Workflow(w) => w.id,
        }
    }

    pub fn state(&self) -> ExecutionState {
        match self {
            ExecutionRecord::Action(a) => a.state,
            ExecutionRecord::Workflow(w) => w.state,
        }
    }
}

/// Workflow engine over a transactional store and an action executor.
pub struct Engine<S, X> {
    store: S,
    executor: X,
    services: EngineServices,
}

impl<S: ExecutionStore, X: ActionExecutor> Engine<S, X> {
    pub fn new(store: S, executor: X, registry: ActionRegistry, config: EngineConfig) -> Self {
        Self {
            store,
            executor,
            services: EngineServices {
                registry,
                evaluator: Arc::new(JexlEvaluator::new()),
                config,
            },
        }
    }

    /// Replace the expression evaluator.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.services.evaluator = evaluator;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.services.registry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn executor(&self) -> &X {
        &self.executor
    }

    // -----------------------------------------------------------------------
    // Definitions and environments
    // -----------------------------------------------------------------------

    /// Validate and store a workflow definition. Re-registering a name in
    /// the same namespace replaces its tasks and keeps the definition id.
    pub async fn register_workflow(
        &self,
        spec: WorkflowSpec,
        namespace: &str,
    ) -> Result<WorkflowDefinition, EngineError> {
        validate_spec(&spec)?;
        let (def, _) = transactional!(self, "register_workflow", |scope| {
            save_definition(&mut scope.tx, spec.clone(), namespace).await
        })?;
        tracing::info!(workflow = %def.name, namespace = %def.namespace, "workflow definition registered");
        Ok(def)
    }

    pub async fn get_workflow_definition(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<WorkflowDefinition, EngineError> {
        let (def, _) = transactional!(self, "get_workflow_definition", |scope| {
            scope
                .tx
                .get_workflow_definition(name, namespace)
                .await
                .map_err(EngineError::from)
                .and_then(|def| {
                    def.ok_or_else(|| EngineError::not_found(EntityKind::WorkflowDefinition, name))
                })
        })?;
        Ok(def)
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>, EngineError> {
        let (defs, _) = transactional!(self, "list_workflows", |scope| {
            scope
                .tx
                .list_workflow_definitions()
                .await
                .map_err(EngineError::from)
        })?;
        Ok(defs)
    }

    /// Store a named environment, replacing the variables of an existing
    /// one.
    pub async fn create_environment(
        &self,
        name: &str,
        variables: Map<String, Value>,
        description: Option<String>,
    ) -> Result<Environment, EngineError> {
        let (env, _) = transactional!(self, "create_environment", |scope| {
            save_environment(&mut scope.tx, name, variables.clone(), description.clone()).await
        })?;
        tracing::info!(environment = %env.name, "environment saved");
        Ok(env)
    }

    pub async fn get_environment(&self, name: &str) -> Result<Environment, EngineError> {
        let (env, _) = transactional!(self, "get_environment", |scope| {
            scope
                .tx
                .get_environment(name)
                .await
                .map_err(EngineError::from)
                .and_then(|env| env.ok_or_else(|| EngineError::not_found(EntityKind::Environment, name)))
        })?;
        Ok(env)
    }

    // -----------------------------------------------------------------------
    // Control surface
    // -----------------------------------------------------------------------

    pub async fn start_workflow(
        &self,
        request: StartWorkflow,
    ) -> Result<WorkflowExecution, EngineError> {
        let (wf_ex, effects) = transactional!(self, "start_workflow", |scope| {
            WorkflowCoordinator::start(&mut scope, request.clone()).await
        })?;
        self.drain(effects).await;
        self.get_workflow_execution(wf_ex.id).await
    }

    /// Start (or re-evaluate) a created task execution.
    ///
    /// Everything the start depends on travels with the persisted record:
    /// an IDLE task is a first run, a WAITING join is re-evaluated, and the
    /// inbound context, `triggered_by` and policy progress stored in its
    /// runtime context are used as-is. Reruns and reset flags go through
    /// [`Engine::rerun_workflow`] instead, which reopens the record first.
    pub async fn start_task(&self, task_execution_id: Uuid) -> Result<TaskExecution, EngineError> {
        let (task_ex, effects) = transactional!(self, "start_task", |scope| {
            TaskCoordinator::run(&mut scope, task_execution_id).await
        })?;
        self.drain(effects).await;
        self.get_task_execution(task_ex.id).await
    }

    /// Run an action outside any workflow.
    ///
    /// Actions that are run asynchronously (or whose result should be
    /// saved) are persisted and scheduled like workflow actions. Otherwise
    /// the action runs inline and an unsaved record carrying the result is
    /// returned.
    pub async fn start_action(&self, request: StartAction) -> Result<ActionExecution, EngineError> {
        let descriptor = self.services.registry.resolve(&request.name)?;
        if request.run_sync && !descriptor.is_sync {
            return Err(EngineError::Input(format!(
                "Action does not support synchronous execution: {}",
                request.name
            )));
        }

        if !request.run_sync && (request.save_result || !descriptor.is_sync) {
            let (action_ex, effects) = transactional!(self, "start_action", |scope| {
                ActionCoordinator::schedule(&mut scope, request.as_new_action()).await
            })?;
            self.drain(effects).await;
            return self.get_action_execution(action_ex.id).await;
        }

        let mut action_ex = ActionCoordinator::prepare(&self.services, &request.as_new_action())?;
        let call =
            ActionCoordinator::request(&action_ex, request.target.clone(), request.timeout, None, false);
        let result = match self.executor.run_action(call).await {
            Ok(Some(result)) => result,
            Ok(None) => ActionResult::Error(json!("Action did not return a result")),
            Err(e) => ActionResult::Error(json!(e.to_string())),
        };
        ActionCoordinator::apply_result(&mut action_ex, &result);

        if request.save_result {
            transactional!(self, "save_action", |scope| {
                scope
                    .tx
                    .insert_action_execution(&action_ex)
                    .await
                    .map_err(EngineError::from)
            })?;
        }
        Ok(action_ex)
    }

    /// Deliver the result of an action, or of a sub-workflow when
    /// `is_workflow` is set.
    pub async fn on_action_complete(
        &self,
        id: Uuid,
        result: ActionResult,
        is_workflow: bool,
    ) -> Result<ExecutionRecord, EngineError> {
        let (record, effects) = self.complete_action(id, result, is_workflow).await?;
        self.drain(effects).await;
        Ok(record)
    }

    /// Out-of-band state change of an action or sub-workflow (pause,
    /// resume).
    pub async fn on_action_update(
        &self,
        id: Uuid,
        state: ExecutionState,
        is_workflow: bool,
    ) -> Result<ExecutionRecord, EngineError> {
        let (record, effects) = if is_workflow {
            transactional!(self, "on_workflow_action_update", |scope| {
                WorkflowCoordinator::on_workflow_action_update(&mut scope, id, state)
                    .await
                    .map(ExecutionRecord::Workflow)
            })?
        } else {
            transactional!(self, "on_action_update", |scope| {
                ActionCoordinator::on_update(&mut scope, id, state)
                    .await
                    .map(ExecutionRecord::Action)
            })?
        };
        self.drain(effects).await;
        Ok(record)
    }

    pub async fn pause_workflow(&self, id: Uuid) -> Result<WorkflowExecution, EngineError> {
        let (wf_ex, effects) = transactional!(self, "pause_workflow", |scope| {
            WorkflowCoordinator::pause(&mut scope, id).await
        })?;
        self.drain(effects).await;
        Ok(wf_ex)
    }

    pub async fn resume_workflow(
        &self,
        id: Uuid,
        env: Option<Map<String, Value>>,
    ) -> Result<WorkflowExecution, EngineError> {
        let (wf_ex, effects) = transactional!(self, "resume_workflow", |scope| {
            WorkflowCoordinator::resume(&mut scope, id, env.clone()).await
        })?;
        self.drain(effects).await;
        self.get_workflow_execution(wf_ex.id).await
    }

    pub async fn stop_workflow(
        &self,
        id: Uuid,
        state: ExecutionState,
        message: Option<String>,
    ) -> Result<WorkflowExecution, EngineError> {
        let (wf_ex, effects) = transactional!(self, "stop_workflow", |scope| {
            WorkflowCoordinator::stop(&mut scope, id, state, message.clone()).await
        })?;
        self.drain(effects).await;
        Ok(wf_ex)
    }

    /// Re-run (or skip) a failed task. `reset` is mandatory for with-items
    /// tasks and defaults to `true` otherwise.
    pub async fn rerun_workflow(
        &self,
        task_execution_id: Uuid,
        reset: Option<bool>,
        skip: bool,
        env: Option<Map<String, Value>>,
    ) -> Result<WorkflowExecution, EngineError> {
        let (wf_ex, effects) = transactional!(self, "rerun_workflow", |scope| {
            WorkflowCoordinator::rerun(&mut scope, task_execution_id, reset, skip, env.clone())
                .await
        })?;
        self.drain(effects).await;
        self.get_workflow_execution(wf_ex.id).await
    }

    /// Record heartbeats, one transaction per id. Unknown or finished ids
    /// are logged and skipped. Returns how many heartbeats were recorded.
    pub async fn process_action_heartbeats(&self, ids: &[Uuid]) -> usize {
        let mut recorded = 0;
        for &id in ids {
            match transactional!(self, "process_action_heartbeat", |scope| {
                ActionCoordinator::heartbeat(&mut scope, id).await
            }) {
                Ok((true, _)) => recorded += 1,
                Ok((false, _)) => {}
                Err(e) => {
                    tracing::warn!(action_execution_id = %id, error = %e, "failed to record heartbeat");
                }
            }
        }
        recorded
    }

    /// Handle asynchronous actions whose heartbeat has expired: safe-rerun
    /// actions are redelivered to the executor, all others fail. Returns
    /// how many were handled.
    pub async fn fail_expired_actions(&self) -> Result<usize, EngineError> {
        let heartbeat = &self.services.config.heartbeat;
        let expiry = chrono::Duration::from_std(heartbeat.expiry())
            .map_err(|e| EngineError::Validation(format!("invalid heartbeat expiry: {e}")))?;
        let before = Utc::now() - expiry;
        let batch_size = heartbeat.batch_size;

        let (expired, _) = transactional!(self, "list_expired_actions", |scope| {
            scope
                .tx
                .list_expired_action_executions(before, batch_size)
                .await
                .map_err(EngineError::from)
        })?;

        let mut handled = 0;
        for action_ex in expired {
            tracing::warn!(
                action_execution_id = %action_ex.id,
                action = %action_ex.name,
                last_heartbeat = ?action_ex.last_heartbeat,
                safe_rerun = action_ex.runtime_context.safe_rerun,
                "action heartbeat expired"
            );
            let outcome = if action_ex.runtime_context.safe_rerun {
                transactional!(self, "redeliver_expired_action", |scope| {
                    ActionCoordinator::redeliver(&mut scope, action_ex.id)
                        .await
                        .map(|_| ())
                })
            } else {
                transactional!(self, "fail_expired_action", |scope| {
                    ActionCoordinator::fail(&mut scope, action_ex.id, HEARTBEAT_MESSAGE)
                        .await
                        .map(|_| ())
                })
            };
            match outcome {
                Ok(((), effects)) => {
                    handled += 1;
                    self.drain(effects).await;
                }
                Err(e) => {
                    tracing::warn!(action_execution_id = %action_ex.id, error = %e, "failed to expire action");
                }
            }
        }
        Ok(handled)
    }

    /// Run the policy jobs due at `now`, earliest first, up to the
    /// configured batch size. Each job is claimed by deleting it, so a job
    /// runs at most once even with several pollers. Returns how many ran.
    pub async fn process_scheduled_jobs(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let batch_size = self.services.config.scheduler.batch_size;
        let (due, _) = transactional!(self, "list_due_jobs", |scope| {
            scope
                .tx
                .list_due_jobs(now, batch_size)
                .await
                .map_err(EngineError::from)
        })?;

        let mut ran = 0;
        for job in due {
            let outcome = transactional!(self, "run_scheduled_job", |scope| {
                match scope.tx.delete_scheduled_job(job.id).await {
                    Ok(true) => TaskCoordinator::run_job(&mut scope, job.kind.clone())
                        .await
                        .map(|()| true),
                    Ok(false) => Ok(false),
                    Err(e) => Err(EngineError::from(e)),
                }
            });
            match outcome {
                Ok((true, effects)) => {
                    ran += 1;
                    self.drain(effects).await;
                }
                Ok((false, _)) => {
                    tracing::debug!(job_id = %job.id, "scheduled job already claimed");
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %job.id,
                        job = job.kind.label(),
                        task_execution_id = %job.kind.task_execution_id(),
                        error = %e,
                        "scheduled job failed, discarding"
                    );
                    if let Err(e) = transactional!(self, "discard_scheduled_job", |scope| {
                        scope
                            .tx
                            .delete_scheduled_job(job.id)
                            .await
                            .map_err(EngineError::from)
                    }) {
                        tracing::warn!(job_id = %job.id, error = %e, "failed to discard scheduled job");
                    }
                }
            }
        }
        Ok(ran)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get_workflow_execution(&self, id: Uuid) -> Result<WorkflowExecution, EngineError> {
        transactional!(self, "get_workflow_execution", |scope| {
            scope.workflow_execution(id).await
        })
        .map(|(wf_ex, _)| wf_ex)
    }

    pub async fn get_task_execution(&self, id: Uuid) -> Result<TaskExecution, EngineError> {
        transactional!(self, "get_task_execution", |scope| {
            scope.task_execution(id).await
        })
        .map(|(task_ex, _)| task_ex)
    }

    pub async fn get_action_execution(&self, id: Uuid) -> Result<ActionExecution, EngineError> {
        transactional!(self, "get_action_execution", |scope| {
            scope.action_execution(id).await
        })
        .map(|(action_ex, _)| action_ex)
    }

    /// Most recently created first.
    pub async fn list_workflow_executions(
        &self,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, EngineError> {
        transactional!(self, "list_workflow_executions", |scope| {
            scope
                .tx
                .list_workflow_executions(limit)
                .await
                .map_err(EngineError::from)
        })
        .map(|(list, _)| list)
    }

    pub async fn list_task_executions(
        &self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<TaskExecution>, EngineError> {
        transactional!(self, "list_task_executions", |scope| {
            scope
                .tx
                .list_task_executions(workflow_execution_id)
                .await
                .map_err(EngineError::from)
        })
        .map(|(list, _)| list)
    }

    pub async fn list_action_executions(
        &self,
        task_execution_id: Uuid,
    ) -> Result<Vec<ActionExecution>, EngineError> {
        transactional!(self, "list_action_executions", |scope| {
            scope
                .tx
                .list_action_executions(task_execution_id)
                .await
                .map_err(EngineError::from)
        })
        .map(|(list, _)| list)
    }

    // -----------------------------------------------------------------------
    // Effects
    // -----------------------------------------------------------------------

    async fn complete_action(
        &self,
        id: Uuid,
        result: ActionResult,
        is_workflow: bool,
    ) -> Result<(ExecutionRecord, Vec<Effect>), EngineError> {
        if is_workflow {
            transactional!(self, "on_workflow_action_complete", |scope| {
                WorkflowCoordinator::on_workflow_action_complete(&mut scope, id, result.clone())
                    .await
                    .map(ExecutionRecord::Workflow)
            })
        } else {
            transactional!(self, "on_action_complete", |scope| {
                ActionCoordinator::on_complete(&mut scope, id, result.clone())
                    .await
                    .map(ExecutionRecord::Action)
            })
        }
    }

    /// Run queued effects until none are left. Failures are logged; they
    /// never reach the caller of the operation that queued them.
    async fn drain(&self, effects: Vec<Effect>) {
        let mut queue = VecDeque::from(effects);
        while let Some(effect) = queue.pop_front() {
            let label = effect.label();
            tracing::trace!(effect = label, "applying effect");
            match self.apply(effect).await {
                Ok(more) => queue.extend(more),
                Err(e) => tracing::warn!(effect = label, error = %e, "deferred engine work failed"),
            }
        }
    }

    async fn apply(&self, effect: Effect) -> Result<Vec<Effect>, EngineError> {
        let effects = match effect {
            Effect::RunAction(request) => return Ok(self.run_action(request).await.into_iter().collect()),
            Effect::RunTask(id) => {
                transactional!(self, "run_task", |scope| {
                    TaskCoordinator::run(&mut scope, id).await
                })?
                .1
            }
            Effect::RefreshJoin(id) => {
                transactional!(self, "refresh_join", |scope| {
                    TaskCoordinator::refresh_join(&mut scope, id).await
                })?
                .1
            }
            Effect::CompleteAction {
                id,
                result,
                is_workflow,
            } => self.complete_action(id, result, is_workflow).await?.1,
            Effect::CheckAndComplete(id) => {
                transactional!(self, "check_and_complete", |scope| {
                    WorkflowCoordinator::check_and_complete(&mut scope, id).await
                })?
                .1
            }
            Effect::PauseWorkflow(id) => {
                transactional!(self, "pause_workflow", |scope| {
                    WorkflowCoordinator::pause(&mut scope, id).await
                })?
                .1
            }
            Effect::ResumeWorkflow(id) => {
                transactional!(self, "resume_workflow", |scope| {
                    WorkflowCoordinator::resume(&mut scope, id, None).await
                })?
                .1
            }
            Effect::RunJob(kind) => {
                transactional!(self, "run_job", |scope| {
                    TaskCoordinator::run_job(&mut scope, kind.clone()).await
                })?
                .1
            }
            Effect::CancelWorkflow { id, message } => {
                transactional!(self, "cancel_workflow", |scope| {
                    WorkflowCoordinator::stop(&mut scope, id, ExecutionState::Cancelled, message.clone())
                        .await
                })?
                .1
            }
        };
        Ok(effects)
    }

    /// Hand an action to the executor. An inline result (or an executor
    /// failure) comes back as a completion effect.
    async fn run_action(&self, request: ActionRequest) -> Option<Effect> {
        let id = request.action_execution_id;
        let action = request.action.clone();
        match self.executor.run_action(request).await {
            Ok(Some(result)) => Some(Effect::CompleteAction {
                id,
                result,
                is_workflow: false,
            }),
            Ok(None) => {
                tracing::debug!(action_execution_id = %id, action = %action, "action running asynchronously");
                None
            }
            Err(e) => {
                tracing::warn!(action_execution_id = %id, action = %action, error = %e, "executor failed to run action");
                Some(Effect::CompleteAction {
                    id,
                    result: ActionResult::Error(json!(e.to_string())),
                    is_workflow: false,
                })
            }
        }
    }
}

async fn save_definition<T: StoreTransaction>(
    tx: &mut T,
    spec: WorkflowSpec,
    namespace: &str,
) -> Result<WorkflowDefinition, EngineError> {
    let now = Utc::now();
    let existing = tx.get_workflow_definition(&spec.name, namespace).await?;
    let def = WorkflowDefinition {
        id: existing.as_ref().map_or_else(Uuid::now_v7, |d| d.id),
        name: spec.name.clone(),
        namespace: namespace.to_string(),
        spec,
        created_at: existing.map_or(now, |d| d.created_at),
        updated_at: now,
    };
    tx.save_workflow_definition(&def).await?;
    Ok(def)
}

async fn save_environment<T: StoreTransaction>(
    tx: &mut T,
    name: &str,
    variables: Map<String, Value>,
    description: Option<String>,
) -> Result<Environment, EngineError> {
    let now = Utc::now();
    let existing = tx.get_environment(name).await?;
    let env = Environment {
        id: existing.as_ref().map_or_else(Uuid::now_v7, |e| e.id),
        name: name.to_string(),
        description,
        variables,
        created_at: existing.map_or(now, |e| e.created_at),
        updated_at: now,
    };
    tx.save_environment(&env).await?;
    Ok(env)
}
