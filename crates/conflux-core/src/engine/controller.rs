//! Direct-workflow controller.
//!
//! Decides which tasks run next after a task completes, evaluates the
//! logical state of join tasks and computes the workflow's final context.
//! Everything here is synchronous over task executions the caller has
//! already loaded.

use std::collections::HashSet;

use conflux_types::config::ContextStrategy;
use conflux_types::definition::{JoinSpec, TaskSpec, Transition, WorkflowSpec};
use conflux_types::execution::{NextTask, TaskExecution, TransitionEvent, TriggeredBy};
use conflux_types::state::ExecutionState;
use serde_json::{Map, Value};

use crate::workflow::dag::TaskGraph;
use crate::workflow::expression::{evaluate_bool, ExpressionEvaluator};

use super::data_flow::evaluate_upstream_context;
use super::error::EngineError;

/// Bound on how far back [`possible_route`] walks.
const MAX_ROUTE_DEPTH: usize = 100;

/// Unique key shared by every trigger of a join task.
pub fn join_key(workflow_execution_id: impl std::fmt::Display, task_name: &str) -> String {
    format!("join-task-{workflow_execution_id}-{task_name}")
}

/// Tasks that run when the workflow starts: those without inbound
/// transitions.
pub fn start_tasks(spec: &WorkflowSpec) -> Result<Vec<&TaskSpec>, EngineError> {
    Ok(TaskGraph::build(spec)?.start_tasks())
}

// ---------------------------------------------------------------------------
// Next tasks
// ---------------------------------------------------------------------------

/// Transitions that fired for a completed task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NextTasks {
    pub tasks: Vec<NextTask>,
    /// An `on-error` transition fired.
    pub error_handled: bool,
}

fn fire(
    evaluator: &dyn ExpressionEvaluator,
    transitions: &[Transition],
    event: TransitionEvent,
    context: &Value,
    out: &mut Vec<NextTask>,
) -> Result<(), EngineError> {
    for transition in transitions {
        let taken = match &transition.when {
            Some(condition) => evaluate_bool(evaluator, condition, context)?,
            None => true,
        };
        if taken {
            out.push(NextTask {
                name: transition.task.clone(),
                event,
            });
        }
    }
    Ok(())
}

/// Evaluate the task's transition clauses for its current state.
///
/// ERROR follows `on-error`, SUCCESS follows `on-success`, SKIPPED follows
/// `on-skip` and falls back to `on-success` when nothing fired. Completed
/// tasks that were neither cancelled nor skipped also follow `on-complete`.
pub fn find_next_tasks(
    evaluator: &dyn ExpressionEvaluator,
    task_ex: &TaskExecution,
    context: &Value,
) -> Result<NextTasks, EngineError> {
    let spec = &task_ex.spec;
    let mut tasks = Vec::new();

    match task_ex.state {
        ExecutionState::Error => {
            fire(evaluator, &spec.on_error, TransitionEvent::OnError, context, &mut tasks)?;
        }
        ExecutionState::Success => {
            fire(evaluator, &spec.on_success, TransitionEvent::OnSuccess, context, &mut tasks)?;
        }
        ExecutionState::Skipped => {
            fire(evaluator, &spec.on_skip, TransitionEvent::OnSkip, context, &mut tasks)?;
            if tasks.is_empty() {
                fire(evaluator, &spec.on_success, TransitionEvent::OnSuccess, context, &mut tasks)?;
            }
        }
        _ => {}
    }

    if task_ex.state.is_completed()
        && !matches!(task_ex.state, ExecutionState::Cancelled | ExecutionState::Skipped)
    {
        fire(evaluator, &spec.on_complete, TransitionEvent::OnComplete, context, &mut tasks)?;
    }

    let error_handled = tasks.iter().any(|t| t.event == TransitionEvent::OnError);
    Ok(NextTasks {
        tasks,
        error_handled,
    })
}

// ---------------------------------------------------------------------------
// Joins
// ---------------------------------------------------------------------------

/// Logical state of a join task derived from its inbound tasks.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinState {
    pub state: ExecutionState,
    pub state_info: Option<String>,
    /// Inbound task executions that satisfied the join.
    pub triggered_by: Vec<TriggeredBy>,
}

struct Induced<'a> {
    name: &'a str,
    state: ExecutionState,
    trigger: Option<TriggeredBy>,
}

/// Most recent execution of a task, by creation order.
fn latest<'t>(tasks: &'t [TaskExecution], name: &str) -> Option<&'t TaskExecution> {
    tasks.iter().rev().find(|t| t.name == name)
}

fn next_event(task_ex: &TaskExecution, name: &str) -> Option<TransitionEvent> {
    task_ex
        .next_tasks
        .iter()
        .find(|t| t.name == name)
        .map(|t| t.event)
}

/// Whether `task` may still be reached: some path from a start task to it
/// is not yet ruled out by completed executions.
pub fn possible_route<'a>(graph: &TaskGraph<'a>, task: &'a str, tasks: &[TaskExecution]) -> bool {
    let mut visited = HashSet::new();
    route_exists(graph, task, tasks, &mut visited, 1)
}

fn route_exists<'a>(
    graph: &TaskGraph<'a>,
    task: &'a str,
    tasks: &[TaskExecution],
    visited: &mut HashSet<&'a str>,
    depth: usize,
) -> bool {
    if depth > MAX_ROUTE_DEPTH || !visited.insert(task) {
        return false;
    }

    let inbound = graph.inbound(task);
    if inbound.is_empty() {
        return true;
    }

    for name in inbound {
        match latest(tasks, name) {
            None => {
                if route_exists(graph, name, tasks, visited, depth + 1) {
                    return true;
                }
            }
            Some(t_ex) => {
                if !t_ex.state.is_completed() || next_event(t_ex, task).is_some() {
                    return true;
                }
            }
        }
    }
    false
}

/// Evaluate a join task against the executions of its inbound tasks.
pub fn join_state(
    spec: &WorkflowSpec,
    join_task: &TaskSpec,
    tasks: &[TaskExecution],
) -> Result<JoinState, EngineError> {
    let graph = TaskGraph::build(spec)?;
    let inbound = graph.inbound(&join_task.name);

    if inbound.is_empty() {
        return Ok(JoinState {
            state: ExecutionState::Running,
            state_info: None,
            triggered_by: Vec::new(),
        });
    }

    let induced: Vec<Induced<'_>> = inbound
        .iter()
        .map(|&name| match latest(tasks, name) {
            None => Induced {
                name,
                state: if possible_route(&graph, name, tasks) {
                    ExecutionState::Waiting
                } else {
                    ExecutionState::Error
                },
                trigger: None,
            },
            Some(t_ex) if !t_ex.state.is_completed() => Induced {
                name,
                state: ExecutionState::Waiting,
                trigger: None,
            },
            Some(t_ex) => match next_event(t_ex, &join_task.name) {
                Some(event) => Induced {
                    name,
                    state: ExecutionState::Running,
                    trigger: Some(TriggeredBy {
                        task_id: t_ex.id,
                        event,
                    }),
                },
                None => Induced {
                    name,
                    state: ExecutionState::Error,
                    trigger: None,
                },
            },
        })
        .collect();

    let names_in = |state: ExecutionState| -> Vec<&str> {
        induced
            .iter()
            .filter(|i| i.state == state)
            .map(|i| i.name)
            .collect()
    };
    let total = induced.len();
    let runnings = names_in(ExecutionState::Running).len();
    let errors = names_in(ExecutionState::Error).len();

    let required = match join_task.join {
        Some(JoinSpec::Count(n)) => n,
        Some(JoinSpec::All) | None => total,
    };

    let state = if runnings >= required {
        ExecutionState::Running
    } else if errors > total.saturating_sub(required) {
        ExecutionState::Error
    } else {
        ExecutionState::Waiting
    };

    let state_info = match state {
        ExecutionState::Error => Some(format!(
            "Failed by tasks: {:?}",
            names_in(ExecutionState::Error)
        )),
        ExecutionState::Waiting => Some(format!(
            "Blocked by tasks: {:?}",
            names_in(ExecutionState::Waiting)
        )),
        _ => None,
    };

    let triggered_by = if state == ExecutionState::Running {
        induced.into_iter().filter_map(|i| i.trigger).collect()
    } else {
        Vec::new()
    };

    Ok(JoinState {
        state,
        state_info,
        triggered_by,
    })
}

// ---------------------------------------------------------------------------
// Workflow completion
// ---------------------------------------------------------------------------

/// Completed tasks that triggered nothing.
pub fn end_tasks(tasks: &[TaskExecution]) -> Vec<&TaskExecution> {
    tasks
        .iter()
        .filter(|t| t.state.is_completed() && !t.has_next_tasks)
        .collect()
}

/// Context the workflow output is evaluated over.
pub fn final_context(strategy: ContextStrategy, tasks: &[TaskExecution]) -> Map<String, Value> {
    evaluate_upstream_context(strategy, &end_tasks(tasks))
}

/// Whether some task still has work left: not completed, or completed but
/// its successors not yet evaluated.
pub fn has_incomplete_tasks(tasks: &[TaskExecution]) -> bool {
    tasks.iter().any(|t| !t.state.is_completed() || !t.processed)
}

/// Failed tasks no `on-error` transition took care of.
pub fn unhandled_errors(tasks: &[TaskExecution]) -> Vec<&TaskExecution> {
    tasks
        .iter()
        .filter(|t| t.state == ExecutionState::Error && !t.error_handled)
        .collect()
}

/// Diagnostic for a workflow failed by its tasks.
pub fn failure_message(failed: &[&TaskExecution]) -> String {
    let names: Vec<&str> = failed.iter().map(|t| t.name.as_str()).collect();
    let mut msg = format!("Failure caused by error in tasks: {}", names.join(", "));
    for t in failed {
        msg.push_str(&format!(
            "\n\n  {} [task_ex_id={}] -> {}",
            t.name,
            t.id,
            t.state_info.as_deref().unwrap_or("")
        ));
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conflux_types::execution::TaskRuntimeContext;
    use serde_json::json;
    use uuid::Uuid;

    use crate::workflow::expression::JexlEvaluator;

    fn spec(yaml: &str) -> WorkflowSpec {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    fn task(spec: &WorkflowSpec, name: &str, state: ExecutionState, next: &[&str]) -> TaskExecution {
        let now = Utc::now();
        TaskExecution {
            id: Uuid::now_v7(),
            name: name.into(),
            workflow_execution_id: Uuid::nil(),
            workflow_name: spec.name.clone(),
            workflow_id: Uuid::nil(),
            namespace: String::new(),
            project_id: "p".into(),
            spec: spec.task(name).unwrap().clone(),
            state,
            state_info: None,
            in_context: Map::new(),
            published: Map::new(),
            published_global: Map::new(),
            runtime_context: TaskRuntimeContext::default(),
            processed: state.is_completed(),
            next_tasks: next
                .iter()
                .map(|n| NextTask {
                    name: n.to_string(),
                    event: TransitionEvent::OnSuccess,
                })
                .collect(),
            has_next_tasks: !next.is_empty(),
            error_handled: false,
            unique_key: None,
            started_at: Some(now),
            finished_at: state.is_completed().then_some(now),
            created_at: now,
            updated_at: now,
        }
    }

    const DIAMOND: &str = r#"
name: diamond
tasks:
  - name: a
    on-success: [b, c]
  - name: b
    on-success: d
  - name: c
    on-success: d
  - name: d
    join: all
"#;

    // -----------------------------------------------------------------------
    // Next tasks
    // -----------------------------------------------------------------------

    #[test]
    fn test_conditions_and_on_complete() {
        let s = spec(
            r#"
name: wf
tasks:
  - name: t
    on-success:
      - big: "<% n > 10 %>"
      - small: "<% n <= 10 %>"
    on-complete: always
  - name: big
  - name: small
  - name: always
"#,
        );
        let t = task(&s, "t", ExecutionState::Success, &[]);
        let next = find_next_tasks(&JexlEvaluator, &t, &json!({"n": 3})).unwrap();
        let names: Vec<&str> = next.tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["small", "always"]);
        assert!(!next.error_handled);
    }

    #[test]
    fn test_error_transitions_mark_error_handled() {
        let s = spec(
            r#"
name: wf
tasks:
  - name: t
    on-success: ok
    on-error: recover
  - name: ok
  - name: recover
"#,
        );
        let t = task(&s, "t", ExecutionState::Error, &[]);
        let next = find_next_tasks(&JexlEvaluator, &t, &json!({})).unwrap();
        assert_eq!(next.tasks.len(), 1);
        assert_eq!(next.tasks[0].event, TransitionEvent::OnError);
        assert!(next.error_handled);
    }

    #[test]
    fn test_skipped_falls_back_to_on_success() {
        let s = spec(
            r#"
name: wf
tasks:
  - name: t
    on-success: ok
    on-complete: done
  - name: ok
  - name: done
"#,
        );
        let t = task(&s, "t", ExecutionState::Skipped, &[]);
        let next = find_next_tasks(&JexlEvaluator, &t, &json!({})).unwrap();
        let names: Vec<&str> = next.tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["ok"]);
    }

    // -----------------------------------------------------------------------
    // Joins
    // -----------------------------------------------------------------------

    #[test]
    fn test_join_all_waits_then_runs() {
        let s = spec(DIAMOND);
        let d = s.task("d").unwrap();
        let a = task(&s, "a", ExecutionState::Success, &["b", "c"]);
        let b = task(&s, "b", ExecutionState::Success, &["d"]);
        let c = task(&s, "c", ExecutionState::Running, &[]);

        let waiting = join_state(&s, d, &[a.clone(), b.clone(), c]).unwrap();
        assert_eq!(waiting.state, ExecutionState::Waiting);
        assert_eq!(waiting.state_info.as_deref(), Some(r#"Blocked by tasks: ["c"]"#));

        let c = task(&s, "c", ExecutionState::Success, &["d"]);
        let running = join_state(&s, d, &[a, b.clone(), c.clone()]).unwrap();
        assert_eq!(running.state, ExecutionState::Running);
        let ids: Vec<Uuid> = running.triggered_by.iter().map(|t| t.task_id).collect();
        assert_eq!(ids, vec![b.id, c.id]);
    }

    #[test]
    fn test_join_all_fails_when_inbound_did_not_trigger() {
        let s = spec(DIAMOND);
        let a = task(&s, "a", ExecutionState::Success, &["b", "c"]);
        let b = task(&s, "b", ExecutionState::Success, &["d"]);
        let c = task(&s, "c", ExecutionState::Error, &[]);
        let state = join_state(&s, s.task("d").unwrap(), &[a, b, c]).unwrap();
        assert_eq!(state.state, ExecutionState::Error);
        assert_eq!(state.state_info.as_deref(), Some(r#"Failed by tasks: ["c"]"#));
    }

    #[test]
    fn test_join_count_runs_on_first_trigger() {
        let s = spec(&DIAMOND.replace("join: all", "join: 1"));
        let a = task(&s, "a", ExecutionState::Success, &["b", "c"]);
        let b = task(&s, "b", ExecutionState::Success, &["d"]);
        let state = join_state(&s, s.task("d").unwrap(), &[a, b]).unwrap();
        assert_eq!(state.state, ExecutionState::Running);
    }

    #[test]
    fn test_untaken_branch_makes_route_impossible() {
        let s = spec(DIAMOND);
        let graph = TaskGraph::build(&s).unwrap();
        let a = task(&s, "a", ExecutionState::Success, &["b"]);
        assert!(possible_route(&graph, "b", &[a.clone()]));
        assert!(!possible_route(&graph, "c", &[a.clone()]));

        let b = task(&s, "b", ExecutionState::Success, &["d"]);
        let state = join_state(&s, s.task("d").unwrap(), &[a, b]).unwrap();
        assert_eq!(state.state, ExecutionState::Error);
    }

    // -----------------------------------------------------------------------
    // Completion helpers
    // -----------------------------------------------------------------------

    #[test]
    fn test_final_context_uses_end_tasks_only() {
        let s = spec(DIAMOND);
        let mut a = task(&s, "a", ExecutionState::Success, &["b", "c"]);
        a.published = json!({"from_a": 1}).as_object().unwrap().clone();
        let mut d = task(&s, "d", ExecutionState::Success, &[]);
        d.in_context = json!({"x": 1}).as_object().unwrap().clone();
        d.published = json!({"y": 2}).as_object().unwrap().clone();

        let ctx = final_context(ContextStrategy::Merge, &[a, d]);
        assert_eq!(Value::Object(ctx), json!({"x": 1, "y": 2}));
    }

    #[test]
    fn test_unhandled_errors_and_message() {
        let s = spec(DIAMOND);
        let mut b = task(&s, "b", ExecutionState::Error, &[]);
        b.state_info = Some("boom".into());
        let mut c = task(&s, "c", ExecutionState::Error, &[]);
        c.error_handled = true;
        let tasks = [b.clone(), c];

        let failed = unhandled_errors(&tasks);
        assert_eq!(failed.len(), 1);
        let msg = failure_message(&failed);
        assert!(msg.starts_with("Failure caused by error in tasks: b"));
        assert!(msg.contains("boom"));
        assert!(!has_incomplete_tasks(&tasks));
    }
}
