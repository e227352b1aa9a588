//! Action execution coordinator.
//!
//! Creates action executions, records their results and forwards state
//! changes to the owning task. Knows nothing about workflow semantics beyond
//! "notify the task".

use std::time::Duration;

use chrono::Utc;
use conflux_types::execution::{
    ActionExecution, ActionResult, ActionRuntimeContext, TaskExecution, DEFAULT_PROJECT,
};
use conflux_types::state::ExecutionState;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::repository::StoreTransaction;

use super::error::{ensure_transition, EngineError, EntityKind};
use super::executor::{ActionRequest, ExecutionContext};
use super::scope::{Effect, EngineServices, ExecutionScope};
use super::task::TaskCoordinator;

/// An action run to create.
#[derive(Debug, Clone)]
pub struct NewAction<'a> {
    pub name: &'a str,
    pub namespace: &'a str,
    pub description: String,
    pub input: Map<String, Value>,
    pub index: usize,
    pub safe_rerun: bool,
    pub target: Option<String>,
    pub timeout: Option<Duration>,
    /// Owning task, if any.
    pub task: Option<&'a TaskExecution>,
    pub root_execution_id: Option<Uuid>,
}

impl<'a> NewAction<'a> {
    /// A standalone action run with no owning task.
    pub fn standalone(name: &'a str, namespace: &'a str, input: Map<String, Value>) -> Self {
        Self {
            name,
            namespace,
            description: String::new(),
            input,
            index: 0,
            safe_rerun: false,
            target: None,
            timeout: None,
            task: None,
            root_execution_id: None,
        }
    }
}

/// Request to run an action outside any workflow.
#[derive(Debug, Clone, Default)]
pub struct StartAction {
    pub name: String,
    pub input: Map<String, Value>,
    pub description: String,
    pub namespace: String,
    /// Run in the caller and return the result. Requires a synchronous
    /// action.
    pub run_sync: bool,
    /// Persist the execution record.
    pub save_result: bool,
    pub target: Option<String>,
    pub timeout: Option<Duration>,
}

impl StartAction {
    pub fn new(name: impl Into<String>, input: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            input,
            ..Self::default()
        }
    }

    pub(crate) fn as_new_action(&self) -> NewAction<'_> {
        NewAction {
            description: self.description.clone(),
            target: self.target.clone(),
            timeout: self.timeout,
            ..NewAction::standalone(&self.name, &self.namespace, self.input.clone())
        }
    }
}

/// Render an action result payload as diagnostic text.
pub(crate) fn describe(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

pub struct ActionCoordinator;

impl ActionCoordinator {
    /// Validate an action run and build its (unsaved) execution record.
    pub fn prepare(
        services: &EngineServices,
        new: &NewAction<'_>,
    ) -> Result<ActionExecution, EngineError> {
        let descriptor = services.registry.resolve(new.name)?;
        let input = services.registry.check_input(new.name, new.input.clone())?;
        let now = Utc::now();

        Ok(ActionExecution {
            id: Uuid::now_v7(),
            name: new.name.to_string(),
            namespace: new.namespace.to_string(),
            description: new.description.clone(),
            project_id: new
                .task
                .map_or_else(|| DEFAULT_PROJECT.to_string(), |t| t.project_id.clone()),
            workflow_execution_id: new.task.map(|t| t.workflow_execution_id),
            task_execution_id: new.task.map(|t| t.id),
            workflow_name: new.task.map(|t| t.workflow_name.clone()),
            state: ExecutionState::Running,
            state_info: None,
            input,
            output: Map::new(),
            accepted: false,
            is_sync: descriptor.is_sync,
            runtime_context: ActionRuntimeContext {
                index: new.index,
                safe_rerun: new.safe_rerun,
            },
            last_heartbeat: (!descriptor.is_sync).then_some(now),
            created_at: now,
            updated_at: now,
        })
    }

    /// What the executor receives for an action execution. `redelivered`
    /// marks a repeated hand-off of an action that may still be running.
    pub fn request(
        action_ex: &ActionExecution,
        target: Option<String>,
        timeout: Option<Duration>,
        root_execution_id: Option<Uuid>,
        redelivered: bool,
    ) -> ActionRequest {
        ActionRequest {
            action_execution_id: action_ex.id,
            action: action_ex.name.clone(),
            input: action_ex.input.clone(),
            is_sync: action_ex.is_sync,
            safe_rerun: action_ex.runtime_context.safe_rerun,
            redelivered,
            target,
            timeout,
            context: ExecutionContext {
                action_execution_id: action_ex.id,
                task_execution_id: action_ex.task_execution_id,
                workflow_execution_id: action_ex.workflow_execution_id,
                workflow_name: action_ex.workflow_name.clone(),
                root_execution_id,
                callback_url: Some(ExecutionContext::callback_path(action_ex.id)),
            },
        }
    }

    /// Persist a RUNNING action execution and hand it to the executor after
    /// commit.
    pub async fn schedule<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        new: NewAction<'_>,
    ) -> Result<ActionExecution, EngineError> {
        let action_ex = Self::prepare(scope.services, &new)?;
        scope.tx.insert_action_execution(&action_ex).await?;

        tracing::debug!(
            action_execution_id = %action_ex.id,
            action = %action_ex.name,
            index = action_ex.runtime_context.index,
            "scheduled action"
        );

        scope.defer(Effect::RunAction(Self::request(
            &action_ex,
            new.target,
            new.timeout,
            new.root_execution_id,
            false,
        )));
        Ok(action_ex)
    }

    /// Record an action result and let the owning task react.
    ///
    /// Completing an already completed action returns it unchanged.
    pub async fn on_complete<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        id: Uuid,
        result: ActionResult,
    ) -> Result<ActionExecution, EngineError> {
        let mut action_ex = scope.action_execution(id).await?;

        if action_ex.state.is_completed() {
            tracing::debug!(
                action_execution_id = %id,
                state = %action_ex.state,
                "action already completed, ignoring result"
            );
            return Ok(action_ex);
        }

        let state = result.state();
        ensure_transition(EntityKind::ActionExecution, id, action_ex.state, state)?;

        Self::apply_result(&mut action_ex, &result);
        scope.tx.update_action_execution(&action_ex).await?;

        tracing::debug!(action_execution_id = %id, state = %state, "action completed");

        if let Some(task_id) = action_ex.task_execution_id {
            TaskCoordinator::on_action_complete(scope, task_id).await?;
        }
        Ok(action_ex)
    }

    /// Record `result` on the execution record without persisting it.
    pub fn apply_result(action_ex: &mut ActionExecution, result: &ActionResult) {
        let payload = result.payload();
        action_ex.state = result.state();
        action_ex.state_info = match result {
            ActionResult::Success(_) => None,
            _ => describe(&payload),
        };
        action_ex.output = Map::from_iter([("result".to_string(), payload)]);
        action_ex.accepted = true;
        action_ex.updated_at = Utc::now();
    }

    /// Fail a running action with a message.
    pub async fn fail<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        id: Uuid,
        message: &str,
    ) -> Result<ActionExecution, EngineError> {
        Self::on_complete(scope, id, ActionResult::Error(json!(message))).await
    }

    /// Apply an out-of-band state change, e.g. pausing an asynchronous
    /// action.
    pub async fn on_update<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        id: Uuid,
        state: ExecutionState,
    ) -> Result<ActionExecution, EngineError> {
        let mut action_ex = scope.action_execution(id).await?;

        if state == ExecutionState::Paused && action_ex.is_sync {
            return Err(EngineError::InvalidStateTransition {
                kind: EntityKind::ActionExecution,
                id,
                from: action_ex.state,
                to: state,
                reason: Some(
                    "Transition to the PAUSED state is only supported for asynchronous action execution."
                        .to_string(),
                ),
            });
        }
        ensure_transition(EntityKind::ActionExecution, id, action_ex.state, state)?;

        if action_ex.state == state {
            return Ok(action_ex);
        }

        action_ex.state = state;
        action_ex.updated_at = Utc::now();
        scope.tx.update_action_execution(&action_ex).await?;

        tracing::debug!(action_execution_id = %id, state = %state, "action updated");

        if let Some(task_id) = action_ex.task_execution_id {
            TaskCoordinator::on_action_update(scope, task_id, state).await?;
        }
        Ok(action_ex)
    }

    /// Refresh the liveness timestamp of one action. Returns whether the
    /// heartbeat was recorded.
    pub async fn heartbeat<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        id: Uuid,
    ) -> Result<bool, EngineError> {
        let Some(mut action_ex) = scope.tx.get_action_execution(id).await? else {
            tracing::warn!(action_execution_id = %id, "heartbeat for unknown action execution");
            return Ok(false);
        };

        if action_ex.state.is_completed() {
            tracing::warn!(
                action_execution_id = %id,
                state = %action_ex.state,
                "heartbeat for completed action execution"
            );
            return Ok(false);
        }

        let now = Utc::now();
        action_ex.last_heartbeat = Some(now);
        action_ex.updated_at = now;
        scope.tx.update_action_execution(&action_ex).await?;
        Ok(true)
    }

    /// Hand a running safe-rerun action to the executor again after its
    /// executor went silent. Returns whether it was redelivered.
    pub async fn redeliver<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        id: Uuid,
    ) -> Result<bool, EngineError> {
        let mut action_ex = scope.action_execution(id).await?;
        if action_ex.state.is_completed() || !action_ex.runtime_context.safe_rerun {
            return Ok(false);
        }

        let root_execution_id = match action_ex.workflow_execution_id {
            Some(wf_id) => {
                let wf_ex = scope.workflow_execution(wf_id).await?;
                Some(wf_ex.root_execution_id.unwrap_or(wf_ex.id))
            }
            None => None,
        };

        let now = Utc::now();
        action_ex.last_heartbeat = Some(now);
        action_ex.updated_at = now;
        scope.tx.update_action_execution(&action_ex).await?;

        tracing::info!(action_execution_id = %id, action = %action_ex.name, "redelivering action");
        scope.defer(Effect::RunAction(Self::request(
            &action_ex,
            None,
            None,
            root_execution_id,
            true,
        )));
        Ok(true)
    }

    /// Cancel a still-running action. Used when its task is cancelled.
    pub async fn cancel<T: StoreTransaction>(
        scope: &mut ExecutionScope<'_, T>,
        action_ex: &mut ActionExecution,
    ) -> Result<(), EngineError> {
        if action_ex.state.is_completed() {
            return Ok(());
        }
        ensure_transition(
            EntityKind::ActionExecution,
            action_ex.id,
            action_ex.state,
            ExecutionState::Cancelled,
        )?;
        action_ex.state = ExecutionState::Cancelled;
        action_ex.updated_at = Utc::now();
        scope.tx.update_action_execution(action_ex).await?;
        Ok(())
    }
}
