//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts YAML documents into the canonical `WorkflowSpec`, validates
//! structural constraints (unique names, known transition targets, join
//! shape, with-items settings), and provides discovery for workflow files on
//! disk.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use conflux_types::definition::{EngineCommand, JoinSpec, TaskKind, WorkflowSpec};
use thiserror::Error;

use super::dag::TaskGraph;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or validating a workflow definition.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// A transition references a task that does not exist.
    #[error("unknown task: {0}")]
    UnknownTask(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowSpec`.
///
/// Runs `validate_spec` after deserialization, so the returned value is
/// guaranteed to be structurally valid.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowSpec, WorkflowError> {
    let spec: WorkflowSpec =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_spec(&spec)?;
    Ok(spec)
}

/// Serialize a `WorkflowSpec` to a YAML string.
pub fn serialize_workflow_yaml(spec: &WorkflowSpec) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(spec).map_err(|e| WorkflowError::ParseError(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `WorkflowSpec`.
///
/// Checks:
/// - Name is non-empty and contains only alphanumerics, `-`, `_` and `.`
/// - Input parameter and task names are unique
/// - No task is named after an engine command (`fail`, `succeed`, ...)
/// - Every transition points to an existing task or an engine command
/// - A non-empty workflow has at least one start task
/// - Join tasks have enough inbound tasks for their join count
/// - With-items concurrency >= 1 if set
/// - Timeout > 0 if set, for the task or the workflow's task defaults
///
/// A workflow without tasks is valid; it succeeds as soon as it starts.
pub fn validate_spec(spec: &WorkflowSpec) -> Result<(), WorkflowError> {
    if spec.name.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if !spec
        .name
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(WorkflowError::ValidationError(format!(
            "workflow name '{}' contains invalid characters (only alphanumerics, '-', '_' and '.' allowed)",
            spec.name
        )));
    }

    let mut seen_inputs = HashSet::new();
    for param in &spec.input {
        if !seen_inputs.insert(param.name.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate input parameter: '{}'",
                param.name
            )));
        }
    }

    let mut seen_tasks = HashSet::new();
    for task in &spec.tasks {
        if task.name.is_empty() {
            return Err(WorkflowError::ValidationError(
                "task name must not be empty".to_string(),
            ));
        }
        if !seen_tasks.insert(task.name.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate task name: '{}'",
                task.name
            )));
        }
        if EngineCommand::parse(&task.name).is_some() {
            return Err(WorkflowError::ValidationError(format!(
                "task name '{}' is reserved for an engine command",
                task.name
            )));
        }
    }

    let graph = TaskGraph::build(spec)?;
    if !spec.tasks.is_empty() && graph.start_tasks().is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow has no start task (every task has an inbound transition)".to_string(),
        ));
    }

    for task in &spec.tasks {
        if let Some(join) = task.join {
            let inbound = graph.inbound(&task.name).len();
            let required = match join {
                JoinSpec::All => 1,
                JoinSpec::Count(n) => n,
            };
            if inbound < required {
                return Err(WorkflowError::ValidationError(format!(
                    "join task '{}' needs {} inbound tasks but has {}",
                    task.name, required, inbound
                )));
            }
        }

        if let TaskKind::WithItems(with_items) = &task.kind {
            if with_items.items.is_empty() {
                return Err(WorkflowError::ValidationError(format!(
                    "with-items task '{}' declares no items",
                    task.name
                )));
            }
            if with_items.concurrency == Some(0) {
                return Err(WorkflowError::ValidationError(format!(
                    "with-items task '{}': concurrency must be >= 1",
                    task.name
                )));
            }
        }

        if spec.effective_policies(task).timeout_secs == Some(0) {
            return Err(WorkflowError::ValidationError(format!(
                "task '{}': timeout must be > 0",
                task.name
            )));
        }
    }

    for name in graph.unreachable_tasks() {
        tracing::warn!(workflow = %spec.name, task = name, "task is unreachable from any start task");
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowSpec, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Save a workflow definition to a YAML file.
///
/// Creates parent directories if they don't exist.
pub fn save_workflow_file(path: &Path, spec: &WorkflowSpec) -> Result<(), WorkflowError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(spec)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all workflow YAML files under `base_dir`.
///
/// Scans for `.yaml` and `.yml` files recursively. Files that fail to parse
/// are skipped with a warning.
pub fn discover_workflows(base_dir: &Path) -> Result<Vec<(PathBuf, WorkflowSpec)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowSpec)>,
) -> Result<(), WorkflowError> {
    let entries = std::fs::read_dir(dir)?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if let Some(ext) = path.extension() {
            if ext == "yaml" || ext == "yml" {
                match load_workflow_file(&path) {
                    Ok(spec) => results.push((path, spec)),
                    Err(e) => {
                        tracing::warn!(?path, error = %e, "skipping unparseable workflow file");
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
