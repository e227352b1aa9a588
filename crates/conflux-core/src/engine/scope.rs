//! Transaction scope and deferred effects.
//!
//! Every coordinator call runs inside an [`ExecutionScope`]: one open store
//! transaction plus the shared engine services. Work that must not happen
//! inside the transaction (handing actions to the executor, starting tasks
//! created by this transaction, notifying a parent workflow) is recorded as
//! an [`Effect`] and only runs after a successful commit. Work due later is
//! persisted as a [`ScheduledJob`] instead.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use conflux_types::config::{ContextStrategy, EngineConfig};
use conflux_types::execution::{
    ActionExecution, ActionResult, JobKind, ScheduledJob, TaskExecution, WorkflowExecution,
};
use uuid::Uuid;

use crate::repository::StoreTransaction;
use crate::workflow::expression::ExpressionEvaluator;

use super::error::{EngineError, EntityKind};
use super::executor::ActionRequest;
use super::registry::ActionRegistry;

/// Shared, read-only services available to every coordinator.
pub struct EngineServices {
    pub registry: ActionRegistry,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    pub config: EngineConfig,
}

/// Post-commit work queued by a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Start (or re-evaluate) a task execution.
    RunTask(Uuid),
    /// Re-evaluate a waiting join task.
    RefreshJoin(Uuid),
    /// Hand an action to the executor.
    RunAction(ActionRequest),
    /// Feed a result back into the engine.
    CompleteAction {
        id: Uuid,
        result: ActionResult,
        is_workflow: bool,
    },
    /// Check whether a workflow execution can complete.
    CheckAndComplete(Uuid),
    PauseWorkflow(Uuid),
    ResumeWorkflow(Uuid),
    CancelWorkflow { id: Uuid, message: Option<String> },
    /// Policy work that is already due.
    RunJob(JobKind),
}

impl Effect {
    /// Short name for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Effect::RunTask(_) => "run_task",
            Effect::RefreshJoin(_) => "refresh_join",
            Effect::RunAction(_) => "run_action",
            Effect::CompleteAction { .. } => "complete_action",
            Effect::CheckAndComplete(_) => "check_and_complete",
            Effect::PauseWorkflow(_) => "pause_workflow",
            Effect::ResumeWorkflow(_) => "resume_workflow",
            Effect::CancelWorkflow { .. } => "cancel_workflow",
            Effect::RunJob(_) => "run_job",
        }
    }
}

/// One open transaction plus the services coordinators need.
pub struct ExecutionScope<'a, T> {
    pub tx: T,
    pub services: &'a EngineServices,
    effects: Vec<Effect>,
}

impl<'a, T: StoreTransaction> ExecutionScope<'a, T> {
    pub fn new(tx: T, services: &'a EngineServices) -> Self {
        Self {
            tx,
            services,
            effects: Vec::new(),
        }
    }

    /// Queue work to run after commit.
    pub fn defer(&mut self, effect: Effect) {
        if !self.effects.contains(&effect) {
            self.effects.push(effect);
        }
    }

    /// Run `kind` after `delay_secs`: right after commit when the delay is
    /// zero, otherwise through the persisted job queue. Returns when the job
    /// is due.
    pub async fn schedule(
        &mut self,
        delay_secs: u64,
        kind: JobKind,
    ) -> Result<DateTime<Utc>, EngineError> {
        let now = Utc::now();
        if delay_secs == 0 {
            self.defer(Effect::RunJob(kind));
            return Ok(now);
        }
        let run_at = i64::try_from(delay_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|delay| now.checked_add_signed(delay))
            .ok_or_else(|| EngineError::Input(format!("delay out of range: {delay_secs}s")))?;
        let job = ScheduledJob::new(run_at, kind);
        tracing::debug!(
            job = job.kind.label(),
            task_execution_id = %job.kind.task_execution_id(),
            run_at = %job.run_at,
            "scheduled job"
        );
        self.tx.insert_scheduled_job(&job).await?;
        Ok(run_at)
    }

    pub async fn commit(self) -> Result<Vec<Effect>, EngineError> {
        self.tx.commit().await?;
        Ok(self.effects)
    }

    pub async fn rollback(self) {
        if let Err(e) = self.tx.rollback().await {
            tracing::warn!(error = %e, "transaction rollback failed");
        }
    }

    pub fn evaluator(&self) -> &dyn ExpressionEvaluator {
        self.services.evaluator.as_ref()
    }

    pub fn strategy(&self) -> ContextStrategy {
        self.services.config.context_strategy
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    // -----------------------------------------------------------------------
    // Loading helpers
    // -----------------------------------------------------------------------

    pub async fn workflow_execution(&mut self, id: Uuid) -> Result<WorkflowExecution, EngineError> {
        self.tx
            .get_workflow_execution(id)
            .await?
            .ok_or_else(|| EngineError::not_found(EntityKind::WorkflowExecution, id))
    }

    pub async fn task_execution(&mut self, id: Uuid) -> Result<TaskExecution, EngineError> {
        self.tx
            .get_task_execution(id)
            .await?
            .ok_or_else(|| EngineError::not_found(EntityKind::TaskExecution, id))
    }

    pub async fn action_execution(&mut self, id: Uuid) -> Result<ActionExecution, EngineError> {
        self.tx
            .get_action_execution(id)
            .await?
            .ok_or_else(|| EngineError::not_found(EntityKind::ActionExecution, id))
    }
}

