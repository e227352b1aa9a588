//! Execution records: workflow, task and action executions.
//!
//! All three share the [`ExecutionState`] vocabulary. Records are created on
//! their first transactional write and mutated only by the engine
//! coordinators inside a transaction.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::definition::{TaskSpec, WorkflowSpec};
use crate::state::ExecutionState;

/// Project used when the caller does not supply one.
pub const DEFAULT_PROJECT: &str = "<default-project>";

// ---------------------------------------------------------------------------
// Workflow execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    /// Workflow definition name.
    pub name: String,
    pub workflow_id: Uuid,
    pub namespace: String,
    #[serde(default)]
    pub description: String,
    pub project_id: String,
    pub state: ExecutionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_info: Option<String>,
    /// Snapshot of the definition the execution was started from.
    pub spec: WorkflowSpec,
    /// Input supplied at start (defaults applied). Never mutated afterwards.
    pub input: Map<String, Value>,
    pub params: WorkflowParams,
    /// Globally published variables plus internal bookkeeping keys.
    pub context: Map<String, Value>,
    #[serde(default)]
    pub output: Map<String, Value>,
    /// Top-most ancestor for sub-workflows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_execution_id: Option<Uuid>,
    /// Parent task for sub-workflows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_execution_id: Option<Uuid>,
    /// Whether the parent task has consumed this execution's result.
    #[serde(default)]
    pub accepted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn is_subworkflow(&self) -> bool {
        self.task_execution_id.is_some()
    }

    /// Index of this execution among its parent task's executions.
    pub fn index(&self) -> usize {
        self.params.index.unwrap_or(0)
    }
}

/// Execution options persisted with a workflow execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowParams {
    /// Resolved environment. Sub-workflows read the root execution's env.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluate_env: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_execution_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    /// Any other caller-provided options, plus undeclared sub-workflow input.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Task execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: Uuid,
    pub name: String,
    pub workflow_execution_id: Uuid,
    pub workflow_name: String,
    pub workflow_id: Uuid,
    pub namespace: String,
    pub project_id: String,
    pub spec: TaskSpec,
    pub state: ExecutionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_info: Option<String>,
    /// Context visible when the task started.
    #[serde(default)]
    pub in_context: Map<String, Value>,
    #[serde(default)]
    pub published: Map<String, Value>,
    #[serde(default)]
    pub published_global: Map<String, Value>,
    #[serde(default)]
    pub runtime_context: TaskRuntimeContext,
    /// Whether downstream tasks have been evaluated for this completed task.
    #[serde(default)]
    pub processed: bool,
    #[serde(default)]
    pub next_tasks: Vec<NextTask>,
    #[serde(default)]
    pub has_next_tasks: bool,
    #[serde(default)]
    pub error_handled: bool,
    /// Set for join tasks so that concurrent triggers find the same record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Engine bookkeeping stored on a task execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRuntimeContext {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggered_by: Vec<TriggeredBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub with_items: Option<WithItemsProgress>,
    #[serde(default, skip_serializing_if = "PolicyState::is_initial")]
    pub policies: PolicyState,
}

/// Which task policies already fired for the current run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyState {
    /// Starts and reruns so far; scheduled timeouts of older runs are stale.
    #[serde(default)]
    pub run: u32,
    /// Retries performed in this run.
    #[serde(default)]
    pub retry_no: u32,
    #[serde(default)]
    pub wait_before_done: bool,
    #[serde(default)]
    pub wait_after_done: bool,
    #[serde(default)]
    pub pause_before_done: bool,
    /// When a RUNNING_DELAYED task is due to continue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continue_at: Option<DateTime<Utc>>,
}

impl PolicyState {
    pub fn is_initial(&self) -> bool {
        *self == PolicyState::default()
    }
}

/// Progress of a with-items task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithItemsProgress {
    /// Total number of items.
    pub count: usize,
    /// Free concurrency slots; `None` when concurrency is unlimited.
    pub capacity: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggeredBy {
    pub task_id: Uuid,
    pub event: TransitionEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextTask {
    pub name: String,
    pub event: TransitionEvent,
}

/// Which transition clause fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransitionEvent {
    OnSuccess,
    OnError,
    OnComplete,
    OnSkip,
}

impl fmt::Display for TransitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionEvent::OnSuccess => write!(f, "on-success"),
            TransitionEvent::OnError => write!(f, "on-error"),
            TransitionEvent::OnComplete => write!(f, "on-complete"),
            TransitionEvent::OnSkip => write!(f, "on-skip"),
        }
    }
}

// ---------------------------------------------------------------------------
// Action execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionExecution {
    pub id: Uuid,
    /// Action name, e.g. `std.echo`.
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub description: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_execution_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_execution_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    pub state: ExecutionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_info: Option<String>,
    /// Concrete input, no expressions left.
    pub input: Map<String, Value>,
    #[serde(default)]
    pub output: Map<String, Value>,
    #[serde(default)]
    pub accepted: bool,
    pub is_sync: bool,
    pub runtime_context: ActionRuntimeContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRuntimeContext {
    /// Item index for with-items tasks, 0 otherwise.
    pub index: usize,
    pub safe_rerun: bool,
}

// ---------------------------------------------------------------------------
// Action result
// ---------------------------------------------------------------------------

/// Outcome of running an action or a sub-workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionResult {
    Success(Value),
    Error(Value),
    Cancelled,
}

impl ActionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ActionResult::Success(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ActionResult::Error(_))
    }

    pub fn is_cancel(&self) -> bool {
        matches!(self, ActionResult::Cancelled)
    }

    /// State the owning execution ends up in.
    pub fn state(&self) -> ExecutionState {
        match self {
            ActionResult::Success(_) => ExecutionState::Success,
            ActionResult::Error(_) => ExecutionState::Error,
            ActionResult::Cancelled => ExecutionState::Cancelled,
        }
    }

    /// Payload stored as `output.result`.
    pub fn payload(&self) -> Value {
        match self {
            ActionResult::Success(data) | ActionResult::Error(data) => data.clone(),
            ActionResult::Cancelled => Value::Null,
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduled jobs
// ---------------------------------------------------------------------------

/// Deferred engine work persisted until `run_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: Uuid,
    pub run_at: DateTime<Utc>,
    pub kind: JobKind,
    pub created_at: DateTime<Utc>,
}

impl ScheduledJob {
    pub fn new(run_at: DateTime<Utc>, kind: JobKind) -> Self {
        Self {
            id: Uuid::now_v7(),
            run_at,
            kind,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    /// Move a RUNNING_DELAYED task back to RUNNING and schedule its work.
    ContinueTask { task_execution_id: Uuid },
    /// Finish a task held back by `wait-after`.
    CompleteTask {
        task_execution_id: Uuid,
        state: ExecutionState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state_info: Option<String>,
    },
    /// Fail the task if it is still unfinished (`timeout`).
    FailTaskIfIncomplete {
        task_execution_id: Uuid,
        timeout_secs: u64,
        run: u32,
    },
}

impl JobKind {
    pub fn task_execution_id(&self) -> Uuid {
        match self {
            JobKind::ContinueTask { task_execution_id }
            | JobKind::CompleteTask {
                task_execution_id, ..
            }
            | JobKind::FailTaskIfIncomplete {
                task_execution_id, ..
            } => *task_execution_id,
        }
    }

    /// Short name for logs.
    pub fn label(&self) -> &'static str {
        match self {
            JobKind::ContinueTask { .. } => "continue_task",
            JobKind::CompleteTask { .. } => "complete_task",
            JobKind::FailTaskIfIncomplete { .. } => "fail_task_if_incomplete",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_result_state_mapping() {
        assert_eq!(ActionResult::Success(json!(1)).state(), ExecutionState::Success);
        assert_eq!(ActionResult::Error(json!("boom")).state(), ExecutionState::Error);
        assert_eq!(ActionResult::Cancelled.state(), ExecutionState::Cancelled);
        assert_eq!(ActionResult::Error(json!("boom")).payload(), json!("boom"));
        assert!(ActionResult::Cancelled.payload().is_null());
    }

    #[test]
    fn test_action_result_wire_shape() {
        let parsed: ActionResult = serde_json::from_value(json!({"success": {"n": 1}})).unwrap();
        assert_eq!(parsed, ActionResult::Success(json!({"n": 1})));
        let parsed: ActionResult = serde_json::from_value(json!("cancelled")).unwrap();
        assert!(parsed.is_cancel());
    }

    #[test]
    fn test_workflow_params_keep_unknown_options() {
        let params: WorkflowParams = serde_json::from_value(json!({
            "env": {"region": "eu"},
            "index": 2,
            "priority": "high",
        }))
        .unwrap();
        assert_eq!(params.index, Some(2));
        assert_eq!(params.extra.get("priority"), Some(&json!("high")));
        assert_eq!(params.env.unwrap().get("region"), Some(&json!("eu")));
    }

    #[test]
    fn test_transition_event_display_matches_serde() {
        for event in [
            TransitionEvent::OnSuccess,
            TransitionEvent::OnError,
            TransitionEvent::OnComplete,
            TransitionEvent::OnSkip,
        ] {
            let json = serde_json::to_value(event).unwrap();
            assert_eq!(json, json!(event.to_string()));
        }
    }

    #[test]
    fn test_job_kind_is_tagged_by_type() {
        let id = Uuid::now_v7();
        let job = ScheduledJob::new(
            Utc::now(),
            JobKind::FailTaskIfIncomplete {
                task_execution_id: id,
                timeout_secs: 5,
                run: 1,
            },
        );
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["kind"]["type"], json!("fail_task_if_incomplete"));
        let restored: ScheduledJob = serde_json::from_value(json).unwrap();
        assert_eq!(restored.kind.task_execution_id(), id);
        assert_eq!(restored, job);
    }

    #[test]
    fn test_untouched_policy_state_is_not_stored() {
        let ctx = TaskRuntimeContext::default();
        assert_eq!(serde_json::to_value(&ctx).unwrap(), json!({}));

        let parsed: TaskRuntimeContext =
            serde_json::from_value(json!({"policies": {"retry_no": 2}})).unwrap();
        assert_eq!(parsed.policies.retry_no, 2);
        assert!(!parsed.policies.wait_before_done);
    }
}
