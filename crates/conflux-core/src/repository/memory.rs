//! Process-local execution store.
//!
//! Transactions are fully serialized: `begin` takes an owned lock on the
//! shared state and works on a copy, `commit` writes the copy back. Named
//! locks are therefore always uncontended. Used by tests and by ephemeral
//! (non-persistent) engine runs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use conflux_types::definition::{Environment, WorkflowDefinition};
use conflux_types::error::RepositoryError;
use conflux_types::execution::{ActionExecution, ScheduledJob, TaskExecution, WorkflowExecution};
use conflux_types::state::ExecutionState;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::execution::{ExecutionStore, StoreTransaction};

#[derive(Debug, Clone, Default)]
struct StoreState {
    definitions: Vec<WorkflowDefinition>,
    environments: Vec<Environment>,
    workflows: Vec<WorkflowExecution>,
    tasks: Vec<TaskExecution>,
    actions: Vec<ActionExecution>,
    jobs: Vec<ScheduledJob>,
}

/// In-memory [`ExecutionStore`]. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionStore for InMemoryStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<InMemoryTransaction, RepositoryError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(InMemoryTransaction { guard, working })
    }
}

/// Open transaction over an [`InMemoryStore`].
pub struct InMemoryTransaction {
    guard: OwnedMutexGuard<StoreState>,
    working: StoreState,
}

fn upsert<T>(items: &mut Vec<T>, item: &T, same: impl Fn(&T) -> bool)
where
    T: Clone,
{
    match items.iter_mut().find(|existing| same(existing)) {
        Some(existing) => *existing = item.clone(),
        None => items.push(item.clone()),
    }
}

fn replace<T>(items: &mut [T], item: &T, same: impl Fn(&T) -> bool) -> Result<(), RepositoryError>
where
    T: Clone,
{
    let existing = items
        .iter_mut()
        .find(|existing| same(existing))
        .ok_or(RepositoryError::NotFound)?;
    *existing = item.clone();
    Ok(())
}

impl StoreTransaction for InMemoryTransaction {
    // -----------------------------------------------------------------------
    // Definitions and environments
    // -----------------------------------------------------------------------

    async fn save_workflow_definition(
        &mut self,
        def: &WorkflowDefinition,
    ) -> Result<(), RepositoryError> {
        upsert(&mut self.working.definitions, def, |d| {
            d.name == def.name && d.namespace == def.namespace
        });
        Ok(())
    }

    async fn get_workflow_definition(
        &mut self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self
            .working
            .definitions
            .iter()
            .find(|d| d.name == name && d.namespace == namespace)
            .cloned())
    }

    async fn list_workflow_definitions(
        &mut self,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        Ok(self.working.definitions.clone())
    }

    async fn save_environment(&mut self, env: &Environment) -> Result<(), RepositoryError> {
        upsert(&mut self.working.environments, env, |e| e.name == env.name);
        Ok(())
    }

    async fn get_environment(&mut self, name: &str) -> Result<Option<Environment>, RepositoryError> {
        Ok(self
            .working
            .environments
            .iter()
            .find(|e| e.name == name)
            .cloned())
    }

    // -----------------------------------------------------------------------
    // Workflow executions
    // -----------------------------------------------------------------------

    async fn insert_workflow_execution(
        &mut self,
        wf_ex: &WorkflowExecution,
    ) -> Result<(), RepositoryError> {
        if self.working.workflows.iter().any(|w| w.id == wf_ex.id) {
            return Err(RepositoryError::Duplicate(format!(
                "workflow execution {}",
                wf_ex.id
            )));
        }
        self.working.workflows.push(wf_ex.clone());
        Ok(())
    }

    async fn get_workflow_execution(
        &mut self,
        id: Uuid,
    ) -> Result<Option<WorkflowExecution>, RepositoryError> {
        Ok(self.working.workflows.iter().find(|w| w.id == id).cloned())
    }

    async fn update_workflow_execution(
        &mut self,
        wf_ex: &WorkflowExecution,
    ) -> Result<(), RepositoryError> {
        replace(&mut self.working.workflows, wf_ex, |w| w.id == wf_ex.id)
    }

    async fn list_workflow_executions(
        &mut self,
        limit: usize,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        Ok(self
            .working
            .workflows
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_child_workflow_executions(
        &mut self,
        task_execution_id: Uuid,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        Ok(self
            .working
            .workflows
            .iter()
            .filter(|w| w.task_execution_id == Some(task_execution_id))
            .cloned()
            .collect())
    }

    // -----------------------------------------------------------------------
    // Task executions
    // -----------------------------------------------------------------------

    async fn insert_task_execution(&mut self, task_ex: &TaskExecution) -> Result<(), RepositoryError> {
        let duplicate = self.working.tasks.iter().any(|t| {
            t.id == task_ex.id
                || (task_ex.unique_key.is_some() && t.unique_key == task_ex.unique_key)
        });
        if duplicate {
            return Err(RepositoryError::Duplicate(format!(
                "task execution {}",
                task_ex.unique_key.as_deref().unwrap_or(&task_ex.name)
            )));
        }
        self.working.tasks.push(task_ex.clone());
        Ok(())
    }

    async fn get_task_execution(&mut self, id: Uuid) -> Result<Option<TaskExecution>, RepositoryError> {
        Ok(self.working.tasks.iter().find(|t| t.id == id).cloned())
    }

    async fn find_task_execution_by_unique_key(
        &mut self,
        unique_key: &str,
    ) -> Result<Option<TaskExecution>, RepositoryError> {
        Ok(self
            .working
            .tasks
            .iter()
            .find(|t| t.unique_key.as_deref() == Some(unique_key))
            .cloned())
    }

    async fn update_task_execution(&mut self, task_ex: &TaskExecution) -> Result<(), RepositoryError> {
        replace(&mut self.working.tasks, task_ex, |t| t.id == task_ex.id)
    }

    async fn list_task_executions(
        &mut self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<TaskExecution>, RepositoryError> {
        Ok(self
            .working
            .tasks
            .iter()
            .filter(|t| t.workflow_execution_id == workflow_execution_id)
            .cloned()
            .collect())
    }

    // -----------------------------------------------------------------------
    // Action executions
    // -----------------------------------------------------------------------

    async fn insert_action_execution(
        &mut self,
        action_ex: &ActionExecution,
    ) -> Result<(), RepositoryError> {
        if self.working.actions.iter().any(|a| a.id == action_ex.id) {
            return Err(RepositoryError::Duplicate(format!(
                "action execution {}",
                action_ex.id
            )));
        }
        self.working.actions.push(action_ex.clone());
        Ok(())
    }

    async fn get_action_execution(
        &mut self,
        id: Uuid,
    ) -> Result<Option<ActionExecution>, RepositoryError> {
        Ok(self.working.actions.iter().find(|a| a.id == id).cloned())
    }

    async fn update_action_execution(
        &mut self,
        action_ex: &ActionExecution,
    ) -> Result<(), RepositoryError> {
        replace(&mut self.working.actions, action_ex, |a| a.id == action_ex.id)
    }

    async fn list_action_executions(
        &mut self,
        task_execution_id: Uuid,
    ) -> Result<Vec<ActionExecution>, RepositoryError> {
        Ok(self
            .working
            .actions
            .iter()
            .filter(|a| a.task_execution_id == Some(task_execution_id))
            .cloned()
            .collect())
    }

    async fn list_expired_action_executions(
        &mut self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ActionExecution>, RepositoryError> {
        Ok(self
            .working
            .actions
            .iter()
            .filter(|a| {
                a.state == ExecutionState::Running
                    && !a.is_sync
                    && a.last_heartbeat.is_some_and(|hb| hb < before)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    // -----------------------------------------------------------------------
    // Scheduled jobs
    // -----------------------------------------------------------------------

    async fn insert_scheduled_job(&mut self, job: &ScheduledJob) -> Result<(), RepositoryError> {
        if self.working.jobs.iter().any(|j| j.id == job.id) {
            return Err(RepositoryError::Duplicate(format!("scheduled job {}", job.id)));
        }
        self.working.jobs.push(job.clone());
        Ok(())
    }

    async fn list_due_jobs(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, RepositoryError> {
        let mut due: Vec<ScheduledJob> = self
            .working
            .jobs
            .iter()
            .filter(|j| j.run_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|j| (j.run_at, j.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn delete_scheduled_job(&mut self, id: Uuid) -> Result<bool, RepositoryError> {
        let before = self.working.jobs.len();
        self.working.jobs.retain(|j| j.id != id);
        Ok(self.working.jobs.len() < before)
    }

    // -----------------------------------------------------------------------
    // Locking and completion
    // -----------------------------------------------------------------------

    async fn acquire_named_lock(&mut self, _name: &str) -> Result<(), RepositoryError> {
        Ok(())
    }

    async fn commit(mut self) -> Result<(), RepositoryError> {
        *self.guard = self.working;
        Ok(())
    }

    async fn rollback(self) -> Result<(), RepositoryError> {
        Ok(())
    }
}
