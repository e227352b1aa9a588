//! SQLite execution store implementation.
//!
//! Implements `ExecutionStore` / `StoreTransaction` from `conflux-core` on
//! top of the single-connection writer pool, so engine transactions are
//! serialized by SQLite itself. Records are stored whole as JSON bodies;
//! the indexed columns next to them serve lookups, uniqueness and ordering.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use conflux_core::repository::{ExecutionStore, StoreTransaction};
use conflux_types::definition::{Environment, WorkflowDefinition};
use conflux_types::error::RepositoryError;
use conflux_types::execution::{ActionExecution, ScheduledJob, TaskExecution, WorkflowExecution};
use conflux_types::state::ExecutionState;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Row, Sqlite, Transaction};
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `ExecutionStore`.
#[derive(Clone)]
pub struct SqliteExecutionStore {
    pool: DatabasePool,
}

impl SqliteExecutionStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Workflow execution counts per state, read outside any transaction.
    pub async fn count_workflow_executions(
        &self,
    ) -> Result<Vec<(ExecutionState, i64)>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS n FROM workflow_executions GROUP BY state ORDER BY state",
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(map_sqlx_error)?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in &rows {
            let state: String = row.try_get("state").map_err(map_sqlx_error)?;
            let n: i64 = row.try_get("n").map_err(map_sqlx_error)?;
            let state = state
                .parse::<ExecutionState>()
                .map_err(|e| RepositoryError::Query(format!("invalid state: {e}")))?;
            counts.push((state, n));
        }
        Ok(counts)
    }
}

impl ExecutionStore for SqliteExecutionStore {
    type Tx = SqliteTransaction;

    async fn begin(&self) -> Result<SqliteTransaction, RepositoryError> {
        let tx = self.pool.writer.begin().await.map_err(map_sqlx_error)?;
        Ok(SqliteTransaction {
            tx,
            locks: HashSet::new(),
        })
    }
}

/// Open transaction on the writer connection.
pub struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
    /// Named locks taken by this transaction; re-acquiring one is a no-op.
    locks: HashSet<String>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Classify a sqlx error. Busy/locked databases and pool timeouts are
/// transient; unique violations are duplicates.
fn map_sqlx_error(err: sqlx::Error) -> RepositoryError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepositoryError::Duplicate(db.message().to_string())
        }
        sqlx::Error::Database(db)
            if matches!(db.code().as_deref(), Some("5") | Some("6"))
                || db.message().contains("database is locked") =>
        {
            RepositoryError::Transient(db.message().to_string())
        }
        sqlx::Error::PoolTimedOut => RepositoryError::Transient(err.to_string()),
        sqlx::Error::PoolClosed | sqlx::Error::Io(_) => RepositoryError::Connection,
        _ => RepositoryError::Query(err.to_string()),
    }
}

fn to_body<T: Serialize>(record: &T) -> Result<String, RepositoryError> {
    Ok(serde_json::to_string(record)?)
}

fn from_body<T: DeserializeOwned>(row: &sqlx::sqlite::SqliteRow) -> Result<T, RepositoryError> {
    let body: String = row.try_get("body").map_err(map_sqlx_error)?;
    Ok(serde_json::from_str(&body)?)
}

fn from_bodies<T: DeserializeOwned>(
    rows: &[sqlx::sqlite::SqliteRow],
) -> Result<Vec<T>, RepositoryError> {
    rows.iter().map(from_body).collect()
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn ensure_updated(rows_affected: u64) -> Result<(), RepositoryError> {
    if rows_affected == 0 {
        return Err(RepositoryError::NotFound);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// StoreTransaction impl
// ---------------------------------------------------------------------------

impl StoreTransaction for SqliteTransaction {
    async fn save_workflow_definition(&mut self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_definitions (id, name, namespace, body, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)
               ON CONFLICT(name, namespace) DO UPDATE SET
                 body = excluded.body,
                 updated_at = excluded.updated_at"#,
        )
        .bind(def.id.to_string())
        .bind(&def.name)
        .bind(&def.namespace)
        .bind(to_body(def)?)
        .bind(format_datetime(&def.created_at))
        .bind(format_datetime(&def.updated_at))
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn get_workflow_definition(
        &mut self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let row = sqlx::query("SELECT body FROM workflow_definitions WHERE name = ? AND namespace = ?")
            .bind(name)
            .bind(namespace)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(from_body).transpose()
    }

    async fn list_workflow_definitions(&mut self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query("SELECT body FROM workflow_definitions ORDER BY namespace ASC, name ASC")
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        from_bodies(&rows)
    }

    async fn save_environment(&mut self, env: &Environment) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO environments (id, name, body, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(name) DO UPDATE SET
                 body = excluded.body,
                 updated_at = excluded.updated_at"#,
        )
        .bind(env.id.to_string())
        .bind(&env.name)
        .bind(to_body(env)?)
        .bind(format_datetime(&env.created_at))
        .bind(format_datetime(&env.updated_at))
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn get_environment(&mut self, name: &str) -> Result<Option<Environment>, RepositoryError> {
        let row = sqlx::query("SELECT body FROM environments WHERE name = ?")
            .bind(name)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(from_body).transpose()
    }

    // -----------------------------------------------------------------------
    // Workflow executions
    // -----------------------------------------------------------------------

    async fn insert_workflow_execution(&mut self, wf_ex: &WorkflowExecution) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workflow_executions
               (id, name, state, task_execution_id, root_execution_id, body, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(wf_ex.id.to_string())
        .bind(&wf_ex.name)
        .bind(wf_ex.state.to_string())
        .bind(wf_ex.task_execution_id.map(|id| id.to_string()))
        .bind(wf_ex.root_execution_id.map(|id| id.to_string()))
        .bind(to_body(wf_ex)?)
        .bind(format_datetime(&wf_ex.created_at))
        .bind(format_datetime(&wf_ex.updated_at))
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn get_workflow_execution(&mut self, id: Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        let row = sqlx::query("SELECT body FROM workflow_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(from_body).transpose()
    }

    async fn update_workflow_execution(&mut self, wf_ex: &WorkflowExecution) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_executions SET state = ?, body = ?, updated_at = ? WHERE id = ?",
        )
        .bind(wf_ex.state.to_string())
        .bind(to_body(wf_ex)?)
        .bind(format_datetime(&wf_ex.updated_at))
        .bind(wf_ex.id.to_string())
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        ensure_updated(result.rows_affected())
    }

    async fn list_workflow_executions(&mut self, limit: usize) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let rows = sqlx::query("SELECT body FROM workflow_executions ORDER BY rowid DESC LIMIT ?")
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        from_bodies(&rows)
    }

    async fn list_child_workflow_executions(
        &mut self,
        task_execution_id: Uuid,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT body FROM workflow_executions WHERE task_execution_id = ? ORDER BY rowid ASC",
        )
        .bind(task_execution_id.to_string())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        from_bodies(&rows)
    }

    // -----------------------------------------------------------------------
    // Task executions
    // -----------------------------------------------------------------------

    async fn insert_task_execution(&mut self, task_ex: &TaskExecution) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO task_executions
               (id, workflow_execution_id, name, state, unique_key, body, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(task_ex.id.to_string())
        .bind(task_ex.workflow_execution_id.to_string())
        .bind(&task_ex.name)
        .bind(task_ex.state.to_string())
        .bind(&task_ex.unique_key)
        .bind(to_body(task_ex)?)
        .bind(format_datetime(&task_ex.created_at))
        .bind(format_datetime(&task_ex.updated_at))
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn get_task_execution(&mut self, id: Uuid) -> Result<Option<TaskExecution>, RepositoryError> {
        let row = sqlx::query("SELECT body FROM task_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(from_body).transpose()
    }

    async fn find_task_execution_by_unique_key(
        &mut self,
        unique_key: &str,
    ) -> Result<Option<TaskExecution>, RepositoryError> {
        let row = sqlx::query("SELECT body FROM task_executions WHERE unique_key = ?")
            .bind(unique_key)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(from_body).transpose()
    }

    async fn update_task_execution(&mut self, task_ex: &TaskExecution) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE task_executions SET state = ?, body = ?, updated_at = ? WHERE id = ?",
        )
        .bind(task_ex.state.to_string())
        .bind(to_body(task_ex)?)
        .bind(format_datetime(&task_ex.updated_at))
        .bind(task_ex.id.to_string())
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        ensure_updated(result.rows_affected())
    }

    async fn list_task_executions(
        &mut self,
        workflow_execution_id: Uuid,
    ) -> Result<Vec<TaskExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT body FROM task_executions WHERE workflow_execution_id = ? ORDER BY rowid ASC",
        )
        .bind(workflow_execution_id.to_string())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        from_bodies(&rows)
    }

    // -----------------------------------------------------------------------
    // Action executions
    // -----------------------------------------------------------------------

    async fn insert_action_execution(&mut self, action_ex: &ActionExecution) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO action_executions
               (id, task_execution_id, name, state, is_sync, last_heartbeat_us, body, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(action_ex.id.to_string())
        .bind(action_ex.task_execution_id.map(|id| id.to_string()))
        .bind(&action_ex.name)
        .bind(action_ex.state.to_string())
        .bind(action_ex.is_sync)
        .bind(action_ex.last_heartbeat.map(|hb| hb.timestamp_micros()))
        .bind(to_body(action_ex)?)
        .bind(format_datetime(&action_ex.created_at))
        .bind(format_datetime(&action_ex.updated_at))
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn get_action_execution(&mut self, id: Uuid) -> Result<Option<ActionExecution>, RepositoryError> {
        let row = sqlx::query("SELECT body FROM action_executions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(from_body).transpose()
    }

    async fn update_action_execution(&mut self, action_ex: &ActionExecution) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE action_executions
               SET state = ?, last_heartbeat_us = ?, body = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(action_ex.state.to_string())
        .bind(action_ex.last_heartbeat.map(|hb| hb.timestamp_micros()))
        .bind(to_body(action_ex)?)
        .bind(format_datetime(&action_ex.updated_at))
        .bind(action_ex.id.to_string())
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        ensure_updated(result.rows_affected())
    }

    async fn list_action_executions(
        &mut self,
        task_execution_id: Uuid,
    ) -> Result<Vec<ActionExecution>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT body FROM action_executions WHERE task_execution_id = ? ORDER BY rowid ASC",
        )
        .bind(task_execution_id.to_string())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        from_bodies(&rows)
    }

    async fn list_expired_action_executions(
        &mut self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ActionExecution>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT body FROM action_executions
               WHERE state = ? AND is_sync = 0 AND last_heartbeat_us < ?
               ORDER BY last_heartbeat_us ASC
               LIMIT ?"#,
        )
        .bind(ExecutionState::Running.to_string())
        .bind(before.timestamp_micros())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        from_bodies(&rows)
    }

    // -----------------------------------------------------------------------
    // Scheduled jobs
    // -----------------------------------------------------------------------

    async fn insert_scheduled_job(&mut self, job: &ScheduledJob) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO scheduled_jobs (id, task_execution_id, run_at_us, body, created_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(job.id.to_string())
        .bind(job.kind.task_execution_id().to_string())
        .bind(job.run_at.timestamp_micros())
        .bind(to_body(job)?)
        .bind(format_datetime(&job.created_at))
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn list_due_jobs(
        &mut self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT body FROM scheduled_jobs
               WHERE run_at_us <= ?
               ORDER BY run_at_us ASC, id ASC
               LIMIT ?"#,
        )
        .bind(now.timestamp_micros())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;
        from_bodies(&rows)
    }

    async fn delete_scheduled_job(&mut self, id: Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    // -----------------------------------------------------------------------
    // Locking and completion
    // -----------------------------------------------------------------------

    async fn acquire_named_lock(&mut self, name: &str) -> Result<(), RepositoryError> {
        if self.locks.contains(name) {
            return Ok(());
        }
        sqlx::query("INSERT INTO named_locks (name, created_at) VALUES (?, ?)")
            .bind(name)
            .bind(format_datetime(&Utc::now()))
            .execute(&mut *self.tx)
            .await
            .map_err(|e| match map_sqlx_error(e) {
                // Held by another connection's open transaction.
                RepositoryError::Duplicate(msg) => RepositoryError::Transient(msg),
                other => other,
            })?;
        self.locks.insert(name.to_string());
        tracing::trace!(lock = %name, "acquired named lock");
        Ok(())
    }

    async fn commit(mut self) -> Result<(), RepositoryError> {
        for name in self.locks.drain() {
            sqlx::query("DELETE FROM named_locks WHERE name = ?")
                .bind(name)
                .execute(&mut *self.tx)
                .await
                .map_err(map_sqlx_error)?;
        }
        self.tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(self) -> Result<(), RepositoryError> {
        self.tx.rollback().await.map_err(map_sqlx_error)
    }
}
