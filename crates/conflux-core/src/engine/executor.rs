//! Action executor port.
//!
//! The engine hands scheduled actions to an [`ActionExecutor`] after the
//! scheduling transaction commits. Synchronous actions return their result
//! directly; asynchronous ones return `None` and report later through
//! `Engine::on_action_complete`.

use std::time::Duration;

use conflux_types::execution::ActionResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Where a scheduled action came from; passed through to the executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub action_execution_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_execution_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_execution_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_execution_id: Option<Uuid>,
    /// Where an asynchronous action reports its result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
}

impl ExecutionContext {
    pub fn callback_path(action_execution_id: Uuid) -> String {
        format!("/v2/action_executions/{action_execution_id}")
    }
}

/// One action run handed to an executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    pub action_execution_id: Uuid,
    pub action: String,
    pub input: Map<String, Value>,
    pub is_sync: bool,
    pub safe_rerun: bool,
    /// Set when the same action execution is handed out again.
    pub redelivered: bool,
    pub target: Option<String>,
    pub timeout: Option<Duration>,
    pub context: ExecutionContext,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("action timed out after {0:?}")]
    Timeout(Duration),

    #[error("executor unavailable: {0}")]
    Unavailable(String),

    #[error("action failed: {0}")]
    Failed(String),
}

/// Runs actions on behalf of the engine.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ActionExecutor: Send + Sync {
    /// Run (or start) an action.
    ///
    /// `Ok(Some(result))` completes the action immediately; `Ok(None)` means
    /// the result will arrive later via the engine's completion operation.
    fn run_action(
        &self,
        request: ActionRequest,
    ) -> impl std::future::Future<Output = Result<Option<ActionResult>, ExecutorError>> + Send;
}
