//! Engine error taxonomy.

use std::fmt;

use conflux_types::error::RepositoryError;
use conflux_types::state::{is_valid_transition, ExecutionState};
use uuid::Uuid;

use crate::workflow::definition::WorkflowError;
use crate::workflow::expression::ExpressionError;

use super::executor::ExecutorError;

/// The kind of record an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    WorkflowDefinition,
    Environment,
    WorkflowExecution,
    TaskExecution,
    ActionExecution,
    Action,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::WorkflowDefinition => "workflow definition",
            EntityKind::Environment => "environment",
            EntityKind::WorkflowExecution => "workflow execution",
            EntityKind::TaskExecution => "task execution",
            EntityKind::ActionExecution => "action execution",
            EntityKind::Action => "action",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Caller-supplied input or parameters are invalid. Also fails the task
    /// when raised while scheduling its work.
    #[error("{0}")]
    Input(String),

    /// An operation's preconditions are violated.
    #[error("{0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("invalid state transition for {kind} {id}: {from} -> {to}{}", reason_suffix(.reason))]
    InvalidStateTransition {
        kind: EntityKind,
        id: Uuid,
        from: ExecutionState,
        to: ExecutionState,
        reason: Option<String>,
    },

    /// The operation is not allowed in the current state.
    #[error("{0}")]
    NotAllowed(String),

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error(transparent)]
    Definition(#[from] WorkflowError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("storage error: {0}")]
    Storage(#[from] RepositoryError),
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason.as_ref().map(|r| format!(" ({r})")).unwrap_or_default()
}

/// Fail with [`EngineError::InvalidStateTransition`] unless `from -> to` is
/// in the transition table.
pub fn ensure_transition(
    kind: EntityKind,
    id: Uuid,
    from: ExecutionState,
    to: ExecutionState,
) -> Result<(), EngineError> {
    if is_valid_transition(from, to) {
        return Ok(());
    }
    Err(EngineError::InvalidStateTransition {
        kind,
        id,
        from,
        to,
        reason: None,
    })
}

impl EngineError {
    pub fn not_found(kind: EntityKind, id: impl fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether re-running the whole transaction may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Storage(e) if e.is_transient())
    }

    /// Whether the error describes bad task input rather than an engine
    /// failure; such errors move the task to ERROR instead of aborting the
    /// transaction.
    pub(crate) fn fails_task(&self) -> bool {
        matches!(
            self,
            EngineError::Input(_) | EngineError::Expression(_) | EngineError::NotFound { .. }
        )
    }
}
