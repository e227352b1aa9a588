//! Transactional execution store trait definitions.
//!
//! The engine never touches storage outside a transaction. A store hands out
//! [`StoreTransaction`] handles; everything read or written through a handle
//! becomes visible to others only after [`StoreTransaction::commit`]. Dropping
//! a handle without committing rolls it back.
//!
//! The infrastructure layer (conflux-infra) implements these traits with
//! SQLite persistence; [`super::memory::InMemoryStore`] is a process-local
//! implementation.

use chrono::{DateTime, Utc};
use conflux_types::definition::{Environment, WorkflowDefinition};
use conflux_types::error::RepositoryError;
use conflux_types::execution::{ActionExecution, ScheduledJob, TaskExecution, WorkflowExecution};
use uuid::Uuid;

/// Factory for transactions against the persistent store.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ExecutionStore: Send + Sync {
    type Tx: StoreTransaction;

    /// Begin a new transaction.
    fn begin(&self) -> impl std::future::Future<Output = Result<Self::Tx, RepositoryError>> + Send;
}

/// One open transaction.
///
/// `insert_*` methods fail with [`RepositoryError::Duplicate`] when the id
/// (or a task's `unique_key`) already exists; `update_*` methods fail with
/// [`RepositoryError::NotFound`] when the record does not exist.
pub trait StoreTransaction: Send + Sized {
    // -----------------------------------------------------------------------
    // Definitions and environments
    // -----------------------------------------------------------------------

    /// Upsert a workflow definition by `(name, namespace)`.
    fn save_workflow_definition(
        &mut self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_workflow_definition(
        &mut self,
        name: &str,
        namespace: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    fn list_workflow_definitions(
        &mut self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// Upsert a named environment.
    fn save_environment(
        &mut self,
        env: &Environment,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_environment(
        &mut self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<Environment>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Workflow executions
    // -----------------------------------------------------------------------

    fn insert_workflow_execution(
        &mut self,
        wf_ex: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_workflow_execution(
        &mut self,
        id: Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowExecution>, RepositoryError>> + Send;

    fn update_workflow_execution(
        &mut self,
        wf_ex: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Most recently created executions first.
    fn list_workflow_executions(
        &mut self,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;

    /// Sub-workflow executions started by a task, in creation order.
    fn list_child_workflow_executions(
        &mut self,
        task_execution_id: Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowExecution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Task executions
    // -----------------------------------------------------------------------

    fn insert_task_execution(
        &mut self,
        task_ex: &TaskExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_task_execution(
        &mut self,
        id: Uuid,
    ) -> impl std::future::Future<Output = Result<Option<TaskExecution>, RepositoryError>> + Send;

    fn find_task_execution_by_unique_key(
        &mut self,
        unique_key: &str,
    ) -> impl std::future::Future<Output = Result<Option<TaskExecution>, RepositoryError>> + Send;

    fn update_task_execution(
        &mut self,
        task_ex: &TaskExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Task executions of a workflow execution, in creation order.
    fn list_task_executions(
        &mut self,
        workflow_execution_id: Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<TaskExecution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Action executions
    // -----------------------------------------------------------------------

    fn insert_action_execution(
        &mut self,
        action_ex: &ActionExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_action_execution(
        &mut self,
        id: Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ActionExecution>, RepositoryError>> + Send;

    fn update_action_execution(
        &mut self,
        action_ex: &ActionExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Action executions of a task, in creation order.
    fn list_action_executions(
        &mut self,
        task_execution_id: Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<ActionExecution>, RepositoryError>> + Send;

    /// RUNNING asynchronous actions whose last heartbeat is older than `before`.
    fn list_expired_action_executions(
        &mut self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<ActionExecution>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Scheduled jobs
    // -----------------------------------------------------------------------

    fn insert_scheduled_job(
        &mut self,
        job: &ScheduledJob,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Jobs with `run_at <= now`, earliest first.
    fn list_due_jobs(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<ScheduledJob>, RepositoryError>> + Send;

    /// Remove a job. Returns `false` when another transaction claimed it first.
    fn delete_scheduled_job(
        &mut self,
        id: Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Locking and completion
    // -----------------------------------------------------------------------

    /// Hold an advisory lock named `name` until this transaction ends.
    fn acquire_named_lock(
        &mut self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn commit(self) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn rollback(self) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
