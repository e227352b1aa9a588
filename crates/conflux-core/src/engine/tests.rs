//! End-to-end engine scenarios over the in-memory store and a scripted
//! executor.

use std::sync::Mutex;

use conflux_types::config::{EngineConfig, HeartbeatConfig};
use conflux_types::execution::{ActionExecution, ActionResult, TaskExecution};
use conflux_types::state::ExecutionState;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::*;
use crate::repository::{ExecutionStore, InMemoryStore, StoreTransaction};
use crate::workflow::definition::parse_workflow_yaml;

/// Answers `std.*` actions inline; `test.async` and `test.hold` report
/// later through `on_action_complete`.
#[derive(Default)]
struct ScriptedExecutor {
    requests: Mutex<Vec<ActionRequest>>,
}

impl ScriptedExecutor {
    fn requests(&self) -> Vec<ActionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl ActionExecutor for ScriptedExecutor {
    async fn run_action(
        &self,
        request: ActionRequest,
    ) -> Result<Option<ActionResult>, ExecutorError> {
        self.requests.lock().unwrap().push(request.clone());
        let input = &request.input;
        match request.action.as_str() {
            "std.noop" => Ok(Some(ActionResult::Success(Value::Null))),
            "std.echo" => Ok(Some(ActionResult::Success(
                input.get("output").cloned().unwrap_or(Value::Null),
            ))),
            "std.fail" => Ok(Some(ActionResult::Error(
                input
                    .get("error_data")
                    .cloned()
                    .unwrap_or_else(|| json!("failed")),
            ))),
            "test.async" | "test.hold" => Ok(None),
            other => Err(ExecutorError::UnknownAction(other.to_string())),
        }
    }
}

type TestEngine = Engine<InMemoryStore, ScriptedExecutor>;

fn registry() -> ActionRegistry {
    ActionRegistry::new()
        .with(ActionDescriptor::sync("std.noop"))
        .with(ActionDescriptor::sync("std.echo"))
        .with(ActionDescriptor::sync("std.fail"))
        .with(ActionDescriptor::sync("test.hold"))
        .with(ActionDescriptor::asynchronous("test.async"))
}

async fn engine_with_config(config: EngineConfig, workflows: &[&str]) -> TestEngine {
    let engine = Engine::new(
        InMemoryStore::new(),
        ScriptedExecutor::default(),
        registry(),
        config,
    );
    for yaml in workflows {
        engine
            .register_workflow(parse_workflow_yaml(yaml).unwrap(), "")
            .await
            .unwrap();
    }
    engine
}

async fn engine(workflows: &[&str]) -> TestEngine {
    engine_with_config(EngineConfig::default(), workflows).await
}

fn map(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

async fn task_named(engine: &TestEngine, wf_id: Uuid, name: &str) -> TaskExecution {
    engine
        .list_task_executions(wf_id)
        .await
        .unwrap()
        .into_iter()
        .find(|t| t.name == name)
        .unwrap_or_else(|| panic!("no task execution named {name}"))
}

async fn actions_of(engine: &TestEngine, task_ex: &TaskExecution) -> Vec<ActionExecution> {
    engine.list_action_executions(task_ex.id).await.unwrap()
}

const GREET: &str = r#"
name: greet
input:
  - name
tasks:
  - name: hello
    action: std.echo
    input:
      output: "Hello, <% name %>"
    publish:
      greeting: "<% task.result %>"
    on-success: shout
  - name: shout
    action: std.echo
    input:
      output: "<% greeting|upper %>"
    publish:
      loud: "<% task.result %>"
"#;

const PAUSABLE: &str = r#"
name: pausable
tasks:
  - name: wait
    action: test.async
    on-success: after
  - name: after
"#;

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_linear_workflow_publishes_and_outputs_final_context() {
    let engine = engine(&[GREET]).await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("greet").with_input(map(json!({"name": "Ada"}))))
        .await
        .unwrap();

    assert_eq!(wf_ex.state, ExecutionState::Success);
    assert_eq!(
        Value::Object(wf_ex.output),
        json!({"greeting": "Hello, Ada", "loud": "HELLO, ADA"})
    );

    let shout = task_named(&engine, wf_ex.id, "shout").await;
    assert_eq!(shout.in_context.get("greeting"), Some(&json!("Hello, Ada")));
    assert_eq!(shout.runtime_context.triggered_by.len(), 1);
    assert!(shout.processed);
}

#[tokio::test]
async fn test_workflow_without_tasks_succeeds_on_start() {
    let engine = engine(&["name: empty\ntasks: []\n"]).await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("empty"))
        .await
        .unwrap();
    assert_eq!(wf_ex.state, ExecutionState::Success);
    assert!(engine.list_task_executions(wf_ex.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_start_with_existing_id_returns_first_execution() {
    let engine = engine(&[GREET]).await;
    let id = Uuid::now_v7();

    let first = engine
        .start_workflow(
            StartWorkflow::new("greet")
                .with_execution_id(id)
                .with_input(map(json!({"name": "Ada"}))),
        )
        .await
        .unwrap();
    let second = engine
        .start_workflow(
            StartWorkflow::new("greet")
                .with_execution_id(id)
                .with_input(map(json!({"name": "Bob"}))),
        )
        .await
        .unwrap();

    assert_eq!(second.id, first.id);
    assert_eq!(second.input.get("name"), Some(&json!("Ada")));
    assert_eq!(engine.list_task_executions(id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_start_rejects_missing_input_and_unknown_workflow() {
    let engine = engine(&[GREET]).await;

    let err = engine
        .start_workflow(StartWorkflow::new("greet"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Input(_)), "got: {err:?}");
    assert!(err.to_string().contains("missing=[name]"));

    let err = engine
        .start_workflow(StartWorkflow::new("nope"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::NotFound {
            kind: EntityKind::WorkflowDefinition,
            ..
        }
    ));
}

// ---------------------------------------------------------------------------
// Data flow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_global_publish_crosses_branches_but_branch_publish_does_not() {
    let engine = engine(&[r#"
name: branches
tasks:
  - name: left
    action: std.echo
    input:
      output: L
    publish:
      branch:
        left_only: "<% task.result %>"
      global:
        shared: from-left
    on-success: left_next
  - name: left_next
  - name: right
    on-success: right_next
  - name: right_next
    action: std.echo
    input:
      output: "<% shared %>"
"#])
    .await;

    let wf_ex = engine
        .start_workflow(StartWorkflow::new("branches"))
        .await
        .unwrap();
    assert_eq!(wf_ex.state, ExecutionState::Success);
    assert_eq!(wf_ex.context.get("shared"), Some(&json!("from-left")));

    let left_next = task_named(&engine, wf_ex.id, "left_next").await;
    assert_eq!(left_next.in_context.get("left_only"), Some(&json!("L")));

    let right_next = task_named(&engine, wf_ex.id, "right_next").await;
    assert!(!right_next.in_context.contains_key("left_only"));
    let actions = actions_of(&engine, &right_next).await;
    assert_eq!(actions[0].output.get("result"), Some(&json!("from-left")));
}

#[tokio::test]
async fn test_join_waits_for_all_branches_and_merges_their_context() {
    let engine = engine(&[r#"
name: diamond
tasks:
  - name: a
    on-success: [b, c]
  - name: b
    action: std.echo
    input:
      output: B
    publish:
      from_b: "<% task.result %>"
    on-success: d
  - name: c
    action: std.echo
    input:
      output: C
    publish:
      from_c: "<% task.result %>"
    on-success: d
  - name: d
    join: all
    action: std.echo
    input:
      output: "<% from_b %><% from_c %>"
"#])
    .await;

    let wf_ex = engine
        .start_workflow(StartWorkflow::new("diamond"))
        .await
        .unwrap();
    assert_eq!(wf_ex.state, ExecutionState::Success);

    let tasks = engine.list_task_executions(wf_ex.id).await.unwrap();
    assert_eq!(tasks.iter().filter(|t| t.name == "d").count(), 1);

    let d = task_named(&engine, wf_ex.id, "d").await;
    assert_eq!(d.runtime_context.triggered_by.len(), 2);
    assert_eq!(d.in_context.get("from_b"), Some(&json!("B")));
    assert_eq!(d.in_context.get("from_c"), Some(&json!("C")));
    let actions = actions_of(&engine, &d).await;
    assert_eq!(actions[0].output.get("result"), Some(&json!("BC")));
}

#[tokio::test]
async fn test_env_is_evaluated_and_shared_with_subworkflows() {
    let engine = engine(&[
        r#"
name: child
input:
  - value
tasks:
  - name: double
    action: std.echo
    input:
      output: "<% value %>-<% value %>"
    publish:
      doubled: "<% task.result %>"
output:
  doubled: "<% doubled %>"
  region: "<% __env.region %>"
"#,
        r#"
name: parent
input:
  - value
tasks:
  - name: call
    workflow: child
    input:
      value: "<% value %>"
    publish:
      child_output: "<% task.result %>"
"#,
    ])
    .await;

    let wf_ex = engine
        .start_workflow(
            StartWorkflow::new("parent")
                .with_input(map(json!({"value": "x", "zone": "eu"})))
                .with_env(EnvSource::Inline(map(json!({"region": "<% zone %>"})))),
        )
        .await;
    // `zone` is not a declared input.
    assert!(matches!(wf_ex, Err(EngineError::Input(_))));

    let wf_ex = engine
        .start_workflow(
            StartWorkflow::new("parent")
                .with_input(map(json!({"value": "x"})))
                .with_env(EnvSource::Inline(map(json!({"region": "eu-<% value %>"})))),
        )
        .await
        .unwrap();

    assert_eq!(wf_ex.state, ExecutionState::Success);
    assert_eq!(
        wf_ex.params.env.as_ref().and_then(|env| env.get("region")),
        Some(&json!("eu-x"))
    );
    assert_eq!(
        Value::Object(wf_ex.output),
        json!({"child_output": {"doubled": "x-x", "region": "eu-x"}})
    );

    let executions = engine.list_workflow_executions(10).await.unwrap();
    let child = executions.iter().find(|w| w.name == "child").unwrap();
    assert_eq!(child.root_execution_id, Some(wf_ex.id));
    assert!(child.accepted);
    assert_eq!(child.state, ExecutionState::Success);
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_completing_an_action_twice_is_a_no_op() {
    let engine = engine(&[PAUSABLE]).await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("pausable"))
        .await
        .unwrap();
    assert_eq!(wf_ex.state, ExecutionState::Running);

    let wait = task_named(&engine, wf_ex.id, "wait").await;
    let action_ex = actions_of(&engine, &wait).await.remove(0);
    assert_eq!(action_ex.state, ExecutionState::Running);
    assert!(action_ex.last_heartbeat.is_some());

    let first = engine
        .on_action_complete(action_ex.id, ActionResult::Success(json!(1)), false)
        .await
        .unwrap();
    let second = engine
        .on_action_complete(action_ex.id, ActionResult::Error(json!("late")), false)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(second.state(), ExecutionState::Success);
    let tasks = engine.list_task_executions(wf_ex.id).await.unwrap();
    assert_eq!(tasks.iter().filter(|t| t.name == "after").count(), 1);
    assert_eq!(
        engine.get_workflow_execution(wf_ex.id).await.unwrap().state,
        ExecutionState::Success
    );
}

#[tokio::test]
async fn test_scheduled_action_carries_execution_context() {
    let engine = engine(&[PAUSABLE]).await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("pausable"))
        .await
        .unwrap();

    let requests = engine.executor().requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.action, "test.async");
    assert!(!request.is_sync);
    assert_eq!(request.context.workflow_execution_id, Some(wf_ex.id));
    assert_eq!(request.context.root_execution_id, Some(wf_ex.id));
    assert_eq!(
        request.context.callback_url.as_deref(),
        Some(format!("/v2/action_executions/{}", request.action_execution_id).as_str())
    );
}

#[tokio::test]
async fn test_failed_action_fails_task_and_workflow() {
    let engine = engine(&[r#"
name: doomed
tasks:
  - name: explode
    action: std.fail
    input:
      error_data: boom
"#])
    .await;

    let wf_ex = engine
        .start_workflow(StartWorkflow::new("doomed"))
        .await
        .unwrap();
    assert_eq!(wf_ex.state, ExecutionState::Error);
    let info = wf_ex.state_info.unwrap();
    assert!(info.starts_with("Failure caused by error in tasks: explode"), "got: {info}");
    assert!(info.contains("-> boom"));
    assert_eq!(wf_ex.output.get("result"), Some(&json!(info)));

    let explode = task_named(&engine, wf_ex.id, "explode").await;
    assert_eq!(explode.state, ExecutionState::Error);
    assert_eq!(explode.state_info.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_handled_error_lets_workflow_succeed() {
    let engine = engine(&[r#"
name: recover
tasks:
  - name: explode
    action: std.fail
    publish-on-error:
      reason: "<% task.result %>"
    on-error: cleanup
  - name: cleanup
    action: std.echo
    input:
      output: "cleaned after <% reason %>"
"#])
    .await;

    let wf_ex = engine
        .start_workflow(StartWorkflow::new("recover"))
        .await
        .unwrap();
    assert_eq!(wf_ex.state, ExecutionState::Success);

    let explode = task_named(&engine, wf_ex.id, "explode").await;
    assert!(explode.error_handled);
    let cleanup = task_named(&engine, wf_ex.id, "cleanup").await;
    let actions = actions_of(&engine, &cleanup).await;
    assert_eq!(actions[0].output.get("result"), Some(&json!("cleaned after failed")));
}

#[tokio::test]
async fn test_bad_task_input_fails_the_task() {
    let engine = engine(&[r#"
name: unknown-action
tasks:
  - name: first
    action: no.such.action
"#])
    .await;

    let wf_ex = engine
        .start_workflow(StartWorkflow::new("unknown-action"))
        .await
        .unwrap();
    assert_eq!(wf_ex.state, ExecutionState::Error);
    let first = task_named(&engine, wf_ex.id, "first").await;
    assert_eq!(first.state, ExecutionState::Error);
    assert!(first.state_info.is_some());
}

#[tokio::test]
async fn test_start_action_inline_returns_unsaved_result() {
    let engine = engine(&[]).await;

    let action_ex = engine
        .start_action(StartAction {
            run_sync: true,
            ..StartAction::new("std.echo", map(json!({"output": "hi"})))
        })
        .await
        .unwrap();
    assert_eq!(action_ex.state, ExecutionState::Success);
    assert_eq!(action_ex.output.get("result"), Some(&json!("hi")));
    assert!(matches!(
        engine.get_action_execution(action_ex.id).await,
        Err(EngineError::NotFound { .. })
    ));

    let err = engine
        .start_action(StartAction {
            run_sync: true,
            ..StartAction::new("test.async", Map::new())
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Input(_)));
}

#[tokio::test]
async fn test_start_action_async_is_persisted() {
    let engine = engine(&[]).await;
    let action_ex = engine
        .start_action(StartAction::new("test.async", Map::new()))
        .await
        .unwrap();
    assert_eq!(action_ex.state, ExecutionState::Running);
    assert!(action_ex.task_execution_id.is_none());

    let record = engine
        .on_action_complete(action_ex.id, ActionResult::Success(json!("done")), false)
        .await
        .unwrap();
    assert_eq!(record.state(), ExecutionState::Success);
}

// ---------------------------------------------------------------------------
// Heartbeats
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_heartbeats_skip_unknown_ids() {
    let engine = engine(&[PAUSABLE]).await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("pausable"))
        .await
        .unwrap();
    let wait = task_named(&engine, wf_ex.id, "wait").await;
    let before = actions_of(&engine, &wait).await.remove(0);

    let recorded = engine
        .process_action_heartbeats(&[before.id, Uuid::now_v7()])
        .await;
    assert_eq!(recorded, 1);

    let after = engine.get_action_execution(before.id).await.unwrap();
    assert!(after.last_heartbeat > before.last_heartbeat);
}

#[tokio::test]
async fn test_expired_heartbeat_fails_action() {
    let config = EngineConfig {
        heartbeat: HeartbeatConfig {
            check_interval_secs: 1,
            max_missed: 0,
            batch_size: 10,
        },
        ..EngineConfig::default()
    };
    let engine = engine_with_config(config, &[PAUSABLE]).await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("pausable"))
        .await
        .unwrap();

    assert_eq!(engine.fail_expired_actions().await.unwrap(), 1);

    let wait = task_named(&engine, wf_ex.id, "wait").await;
    assert_eq!(wait.state, ExecutionState::Error);
    assert_eq!(wait.state_info.as_deref(), Some(HEARTBEAT_MESSAGE));
    assert_eq!(
        engine.get_workflow_execution(wf_ex.id).await.unwrap().state,
        ExecutionState::Error
    );
}

#[tokio::test]
async fn test_expired_safe_rerun_action_is_redelivered() {
    let config = EngineConfig {
        heartbeat: HeartbeatConfig {
            check_interval_secs: 1,
            max_missed: 0,
            batch_size: 10,
        },
        ..EngineConfig::default()
    };
    let engine = engine_with_config(
        config,
        &[r#"
name: rerunnable
tasks:
  - name: wait
    action: test.async
    safe-rerun: true
"#],
    )
    .await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("rerunnable"))
        .await
        .unwrap();
    let wait = task_named(&engine, wf_ex.id, "wait").await;
    let action_ex = actions_of(&engine, &wait).await.remove(0);

    assert_eq!(engine.fail_expired_actions().await.unwrap(), 1);

    let requests = engine.executor().requests();
    assert_eq!(requests.len(), 2);
    assert!(!requests[0].redelivered);
    assert!(requests[1].redelivered);
    assert!(requests[1].safe_rerun);
    assert_eq!(requests[1].action_execution_id, action_ex.id);
    assert_eq!(requests[1].context.root_execution_id, Some(wf_ex.id));

    let after = engine.get_action_execution(action_ex.id).await.unwrap();
    assert_eq!(after.state, ExecutionState::Running);
    assert!(after.last_heartbeat > action_ex.last_heartbeat);
    assert_eq!(
        task_named(&engine, wf_ex.id, "wait").await.state,
        ExecutionState::Running
    );
}

// ---------------------------------------------------------------------------
// With-items
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_with_items_result_follows_item_order() {
    let engine = engine(&[r#"
name: fan-out
tasks:
  - name: each
    with-items: x in [1, 2, 3]
    action: test.async
    input:
      item: "<% x %>"
    publish:
      results: "<% task.result %>"
"#])
    .await;

    let wf_ex = engine
        .start_workflow(StartWorkflow::new("fan-out"))
        .await
        .unwrap();
    let each = task_named(&engine, wf_ex.id, "each").await;
    let actions = actions_of(&engine, &each).await;
    assert_eq!(actions.len(), 3);

    let by_index = |i: usize| actions.iter().find(|a| a.runtime_context.index == i).unwrap();
    assert_eq!(by_index(1).input.get("item"), Some(&json!(2)));

    for (index, result) in [(1, "r2"), (0, "r1"), (2, "r3")] {
        engine
            .on_action_complete(by_index(index).id, ActionResult::Success(json!(result)), false)
            .await
            .unwrap();
    }

    let wf_ex = engine.get_workflow_execution(wf_ex.id).await.unwrap();
    assert_eq!(wf_ex.state, ExecutionState::Success);
    assert_eq!(
        Value::Object(wf_ex.output),
        json!({"results": ["r1", "r2", "r3"]})
    );
}

#[tokio::test]
async fn test_with_items_concurrency_limits_in_flight_items() {
    let engine = engine(&[r#"
name: throttled
tasks:
  - name: each
    with-items: x in [1, 2, 3]
    concurrency: 2
    action: test.async
"#])
    .await;

    let wf_ex = engine
        .start_workflow(StartWorkflow::new("throttled"))
        .await
        .unwrap();
    let each = task_named(&engine, wf_ex.id, "each").await;
    let actions = actions_of(&engine, &each).await;
    assert_eq!(actions.len(), 2);

    engine
        .on_action_complete(actions[0].id, ActionResult::Success(json!("a")), false)
        .await
        .unwrap();
    let each = task_named(&engine, wf_ex.id, "each").await;
    let actions = actions_of(&engine, &each).await;
    assert_eq!(actions.len(), 3);
    assert_eq!(actions[2].runtime_context.index, 2);

    for action_ex in &actions[1..] {
        engine
            .on_action_complete(action_ex.id, ActionResult::Success(json!("b")), false)
            .await
            .unwrap();
    }
    let each = task_named(&engine, wf_ex.id, "each").await;
    assert_eq!(each.state, ExecutionState::Success);
    assert_eq!(
        each.runtime_context.with_items.map(|p| p.capacity),
        Some(Some(2))
    );
}

#[tokio::test]
async fn test_with_items_failure_message_and_empty_list() {
    let engine = engine(&[
        r#"
name: some-fail
tasks:
  - name: each
    with-items: code in ["ok", "bad"]
    action: std.fail
"#,
        r#"
name: nothing
input:
  - xs: []
tasks:
  - name: each
    with-items: x in <% xs %>
    action: std.echo
    publish:
      results: "<% task.result %>"
"#,
    ])
    .await;

    let failed = engine
        .start_workflow(StartWorkflow::new("some-fail"))
        .await
        .unwrap();
    let each = task_named(&engine, failed.id, "each").await;
    assert_eq!(each.state, ExecutionState::Error);
    assert_eq!(each.state_info.as_deref(), Some(with_items::FAILED_MESSAGE));

    let empty = engine
        .start_workflow(StartWorkflow::new("nothing"))
        .await
        .unwrap();
    assert_eq!(empty.state, ExecutionState::Success);
    assert_eq!(Value::Object(empty.output), json!({"results": []}));
}

// ---------------------------------------------------------------------------
// Pause, resume, stop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_task_completed_while_paused_is_processed_on_resume() {
    let engine = engine(&[PAUSABLE]).await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("pausable"))
        .await
        .unwrap();
    let wait = task_named(&engine, wf_ex.id, "wait").await;
    let action_ex = actions_of(&engine, &wait).await.remove(0);

    let paused = engine.pause_workflow(wf_ex.id).await.unwrap();
    assert_eq!(paused.state, ExecutionState::Paused);

    engine
        .on_action_complete(action_ex.id, ActionResult::Success(Value::Null), false)
        .await
        .unwrap();
    let wait = task_named(&engine, wf_ex.id, "wait").await;
    assert_eq!(wait.state, ExecutionState::Success);
    assert!(!wait.processed);
    assert_eq!(engine.list_task_executions(wf_ex.id).await.unwrap().len(), 1);

    let resumed = engine.resume_workflow(wf_ex.id, None).await.unwrap();
    assert_eq!(resumed.state, ExecutionState::Success);
    assert!(task_named(&engine, wf_ex.id, "wait").await.processed);
    assert_eq!(
        task_named(&engine, wf_ex.id, "after").await.state,
        ExecutionState::Success
    );
}

#[tokio::test]
async fn test_env_update_only_when_paused_or_failed() {
    let engine = engine(&[PAUSABLE, FLAKY]).await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("pausable"))
        .await
        .unwrap();

    let err = engine
        .resume_workflow(wf_ex.id, Some(map(json!({"k": 1}))))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotAllowed(_)));

    engine.pause_workflow(wf_ex.id).await.unwrap();
    let resumed = engine
        .resume_workflow(wf_ex.id, Some(map(json!({"k": 1}))))
        .await
        .unwrap();
    assert_eq!(resumed.state, ExecutionState::Running);
    assert_eq!(
        resumed.params.env.and_then(|env| env.get("k").cloned()),
        Some(json!(1))
    );

    let (failed_id, _) = failed_flaky(&engine).await;
    let updated = engine
        .resume_workflow(failed_id, Some(map(json!({"k": 1}))))
        .await
        .unwrap();
    assert_eq!(updated.state, ExecutionState::Error);
    let stored = engine.get_workflow_execution(failed_id).await.unwrap();
    assert_eq!(stored.state, ExecutionState::Error);
    assert_eq!(
        stored.params.env.and_then(|env| env.get("k").cloned()),
        Some(json!(1))
    );
}

#[tokio::test]
async fn test_paused_action_pauses_task_and_workflow() {
    let engine = engine(&[PAUSABLE]).await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("pausable"))
        .await
        .unwrap();
    let wait = task_named(&engine, wf_ex.id, "wait").await;
    let action_ex = actions_of(&engine, &wait).await.remove(0);

    engine
        .on_action_update(action_ex.id, ExecutionState::Paused, false)
        .await
        .unwrap();
    assert_eq!(
        task_named(&engine, wf_ex.id, "wait").await.state,
        ExecutionState::Paused
    );
    assert_eq!(
        engine.get_workflow_execution(wf_ex.id).await.unwrap().state,
        ExecutionState::Paused
    );

    engine
        .on_action_update(action_ex.id, ExecutionState::Running, false)
        .await
        .unwrap();
    assert_eq!(
        task_named(&engine, wf_ex.id, "wait").await.state,
        ExecutionState::Running
    );
    assert_eq!(
        engine.get_workflow_execution(wf_ex.id).await.unwrap().state,
        ExecutionState::Running
    );
}

#[tokio::test]
async fn test_sync_action_cannot_be_paused() {
    let engine = engine(&[r#"
name: holding
tasks:
  - name: hold
    action: test.hold
"#])
    .await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("holding"))
        .await
        .unwrap();
    let hold = task_named(&engine, wf_ex.id, "hold").await;
    let action_ex = actions_of(&engine, &hold).await.remove(0);

    let err = engine
        .on_action_update(action_ex.id, ExecutionState::Paused, false)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidStateTransition { .. }));
    assert!(err.to_string().contains("only supported for asynchronous"));
}

#[tokio::test]
async fn test_cancel_stops_tasks_and_ignores_late_results() {
    let engine = engine(&[PAUSABLE]).await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("pausable"))
        .await
        .unwrap();
    let wait = task_named(&engine, wf_ex.id, "wait").await;
    let action_ex = actions_of(&engine, &wait).await.remove(0);

    let stopped = engine
        .stop_workflow(
            wf_ex.id,
            ExecutionState::Cancelled,
            Some("operator".to_string()),
        )
        .await
        .unwrap();
    assert_eq!(stopped.state, ExecutionState::Cancelled);
    assert_eq!(stopped.output.get("result"), Some(&json!("operator")));

    let wait = task_named(&engine, wf_ex.id, "wait").await;
    assert_eq!(wait.state, ExecutionState::Cancelled);

    let record = engine
        .on_action_complete(action_ex.id, ActionResult::Success(Value::Null), false)
        .await
        .unwrap();
    assert_eq!(record.state(), ExecutionState::Cancelled);
    assert_eq!(engine.list_task_executions(wf_ex.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_stop_validates_target_state() {
    let engine = engine(&[PAUSABLE]).await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("pausable"))
        .await
        .unwrap();

    let err = engine
        .stop_workflow(wf_ex.id, ExecutionState::Paused, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let stopped = engine
        .stop_workflow(wf_ex.id, ExecutionState::Error, Some("halt".to_string()))
        .await
        .unwrap();
    assert_eq!(stopped.state, ExecutionState::Error);

    let err = engine.resume_workflow(wf_ex.id, None).await.unwrap_err();
    assert!(matches!(err, EngineError::NotAllowed(_)));
}

// ---------------------------------------------------------------------------
// Rerun
// ---------------------------------------------------------------------------

const FLAKY: &str = r#"
name: flaky
tasks:
  - name: attempt
    action: test.async
    on-success: done
  - name: done
"#;

async fn failed_flaky(engine: &TestEngine) -> (Uuid, TaskExecution) {
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("flaky"))
        .await
        .unwrap();
    let attempt = task_named(engine, wf_ex.id, "attempt").await;
    let action_ex = actions_of(engine, &attempt).await.remove(0);
    engine
        .on_action_complete(action_ex.id, ActionResult::Error(json!("boom")), false)
        .await
        .unwrap();
    assert_eq!(
        engine.get_workflow_execution(wf_ex.id).await.unwrap().state,
        ExecutionState::Error
    );
    (wf_ex.id, task_named(engine, wf_ex.id, "attempt").await)
}

#[tokio::test]
async fn test_rerun_reschedules_failed_task() {
    let engine = engine(&[FLAKY]).await;
    let (wf_id, attempt) = failed_flaky(&engine).await;

    let wf_ex = engine
        .rerun_workflow(attempt.id, None, false, None)
        .await
        .unwrap();
    assert_eq!(wf_ex.state, ExecutionState::Running);

    let actions = actions_of(&engine, &attempt).await;
    assert_eq!(actions.len(), 2);
    assert!(!actions[0].accepted);

    engine
        .on_action_complete(actions[1].id, ActionResult::Success(json!("ok")), false)
        .await
        .unwrap();
    let wf_ex = engine.get_workflow_execution(wf_id).await.unwrap();
    assert_eq!(wf_ex.state, ExecutionState::Success);
    assert_eq!(
        task_named(&engine, wf_id, "attempt").await.state,
        ExecutionState::Success
    );
}

#[tokio::test]
async fn test_rerun_with_skip_follows_success_transitions() {
    let engine = engine(&[FLAKY]).await;
    let (wf_id, attempt) = failed_flaky(&engine).await;

    let wf_ex = engine
        .rerun_workflow(attempt.id, None, true, None)
        .await
        .unwrap();
    assert_eq!(wf_ex.state, ExecutionState::Success);
    assert_eq!(
        task_named(&engine, wf_id, "attempt").await.state,
        ExecutionState::Skipped
    );
    assert_eq!(
        task_named(&engine, wf_id, "done").await.state,
        ExecutionState::Success
    );
}

#[tokio::test]
async fn test_rerun_requires_failed_task() {
    let engine = engine(&[GREET, PAUSABLE]).await;

    let done = engine
        .start_workflow(StartWorkflow::new("greet").with_input(map(json!({"name": "Ada"}))))
        .await
        .unwrap();
    let hello = task_named(&engine, done.id, "hello").await;
    let err = engine
        .rerun_workflow(hello.id, None, false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert!(err.to_string().contains("must be in ERROR for rerun"));

    let running = engine
        .start_workflow(StartWorkflow::new("pausable"))
        .await
        .unwrap();
    let mut wait = task_named(&engine, running.id, "wait").await;
    let err = engine
        .rerun_workflow(wait.id, None, false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    for state in [
        ExecutionState::Idle,
        ExecutionState::Waiting,
        ExecutionState::Paused,
        ExecutionState::Cancelled,
        ExecutionState::Skipped,
    ] {
        wait.state = state;
        let mut tx = engine.store().begin().await.unwrap();
        tx.update_task_execution(&wait).await.unwrap();
        tx.commit().await.unwrap();

        let err = engine
            .rerun_workflow(wait.id, None, false, None)
            .await
            .unwrap_err();
        assert!(
            err.to_string().contains("must be in ERROR for rerun"),
            "state {state}: {err}"
        );
    }
}

const ITEMS: &str = r#"
name: items
tasks:
  - name: each
    with-items: x in [1, 2, 3]
    action: test.async
    publish:
      results: "<% task.result %>"
"#;

/// Start `items` and fail the second item.
async fn failed_items(engine: &TestEngine) -> (Uuid, TaskExecution) {
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("items"))
        .await
        .unwrap();
    let each = task_named(engine, wf_ex.id, "each").await;
    let actions = actions_of(engine, &each).await;
    for action_ex in &actions {
        let result = match action_ex.runtime_context.index {
            1 => ActionResult::Error(json!("bad")),
            i => ActionResult::Success(json!(format!("r{i}"))),
        };
        engine
            .on_action_complete(action_ex.id, result, false)
            .await
            .unwrap();
    }
    assert_eq!(
        engine.get_workflow_execution(wf_ex.id).await.unwrap().state,
        ExecutionState::Error
    );
    (wf_ex.id, task_named(engine, wf_ex.id, "each").await)
}

#[tokio::test]
async fn test_rerun_reset_flag_rules() {
    let engine = engine(&[ITEMS, FLAKY]).await;

    let (_, each) = failed_items(&engine).await;
    let err = engine
        .rerun_workflow(each.id, None, false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(err.to_string(), "Reset field is mandatory to rerun task.");

    let (_, attempt) = failed_flaky(&engine).await;
    let err = engine
        .rerun_workflow(attempt.id, Some(false), false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert!(err.to_string().contains("Only with-items task"));
}

#[tokio::test]
async fn test_rerun_without_reset_reruns_only_failed_items() {
    let engine = engine(&[ITEMS]).await;
    let (wf_id, each) = failed_items(&engine).await;

    let wf_ex = engine
        .rerun_workflow(each.id, Some(false), false, None)
        .await
        .unwrap();
    assert_eq!(wf_ex.state, ExecutionState::Running);

    let actions = actions_of(&engine, &each).await;
    assert_eq!(actions.len(), 4);
    let fresh: Vec<&ActionExecution> = actions
        .iter()
        .filter(|a| a.state == ExecutionState::Running)
        .collect();
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].runtime_context.index, 1);

    engine
        .on_action_complete(fresh[0].id, ActionResult::Success(json!("r1-again")), false)
        .await
        .unwrap();
    let wf_ex = engine.get_workflow_execution(wf_id).await.unwrap();
    assert_eq!(wf_ex.state, ExecutionState::Success);
    assert_eq!(
        Value::Object(wf_ex.output),
        json!({"results": ["r0", "r1-again", "r2"]})
    );
}

#[tokio::test]
async fn test_rerun_with_skip_on_with_items_task() {
    let engine = engine(&[ITEMS]).await;
    let (wf_id, each) = failed_items(&engine).await;

    let wf_ex = engine
        .rerun_workflow(each.id, None, true, None)
        .await
        .unwrap();
    assert_eq!(wf_ex.state, ExecutionState::Success);
    assert_eq!(
        task_named(&engine, wf_id, "each").await.state,
        ExecutionState::Skipped
    );
    assert_eq!(actions_of(&engine, &each).await.len(), 3);
}

#[tokio::test]
async fn test_rerun_of_subworkflow_reopens_parent() {
    let engine = engine(&[
        FLAKY,
        r#"
name: wrapper
tasks:
  - name: call
    workflow: flaky
"#,
    ])
    .await;

    let parent = engine
        .start_workflow(StartWorkflow::new("wrapper"))
        .await
        .unwrap();
    let call = task_named(&engine, parent.id, "call").await;
    let executions = engine.list_workflow_executions(10).await.unwrap();
    let child = executions.iter().find(|w| w.name == "flaky").unwrap();
    assert_eq!(child.task_execution_id, Some(call.id));

    let attempt = task_named(&engine, child.id, "attempt").await;
    let action_ex = actions_of(&engine, &attempt).await.remove(0);
    engine
        .on_action_complete(action_ex.id, ActionResult::Error(json!("boom")), false)
        .await
        .unwrap();
    assert_eq!(
        engine.get_workflow_execution(parent.id).await.unwrap().state,
        ExecutionState::Error
    );

    engine
        .rerun_workflow(attempt.id, None, false, None)
        .await
        .unwrap();
    assert_eq!(
        engine.get_workflow_execution(parent.id).await.unwrap().state,
        ExecutionState::Running
    );
    assert_eq!(
        task_named(&engine, parent.id, "call").await.state,
        ExecutionState::Running
    );

    let retry = actions_of(&engine, &attempt).await.remove(1);
    engine
        .on_action_complete(retry.id, ActionResult::Success(Value::Null), false)
        .await
        .unwrap();
    assert_eq!(
        engine.get_workflow_execution(parent.id).await.unwrap().state,
        ExecutionState::Success
    );
}

// ---------------------------------------------------------------------------
// Task policies
// ---------------------------------------------------------------------------

/// Run every job the scheduler would pick up within the next hour.
async fn run_due_jobs(engine: &TestEngine) -> usize {
    engine
        .process_scheduled_jobs(chrono::Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_retry_runs_failed_task_again() {
    let engine = engine(&[r#"
name: retrying
tasks:
  - name: attempt
    action: test.async
    retry:
      count: 2
    on-success: done
  - name: done
"#])
    .await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("retrying"))
        .await
        .unwrap();
    let attempt = task_named(&engine, wf_ex.id, "attempt").await;
    let first = actions_of(&engine, &attempt).await.remove(0);

    engine
        .on_action_complete(first.id, ActionResult::Error(json!("boom")), false)
        .await
        .unwrap();
    let attempt = task_named(&engine, wf_ex.id, "attempt").await;
    assert_eq!(attempt.state, ExecutionState::Running);
    assert_eq!(attempt.runtime_context.policies.retry_no, 1);
    let actions = actions_of(&engine, &attempt).await;
    assert_eq!(actions.len(), 2);
    assert!(!actions[0].accepted);

    engine
        .on_action_complete(actions[1].id, ActionResult::Success(json!("ok")), false)
        .await
        .unwrap();
    assert_eq!(
        engine.get_workflow_execution(wf_ex.id).await.unwrap().state,
        ExecutionState::Success
    );
    assert_eq!(actions_of(&engine, &attempt).await.len(), 2);
}

#[tokio::test]
async fn test_retry_from_task_defaults_gives_up_after_count() {
    let engine = engine(&[r#"
name: stubborn
task-defaults:
  retry:
    count: 1
tasks:
  - name: attempt
    action: std.fail
"#])
    .await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("stubborn"))
        .await
        .unwrap();
    assert_eq!(wf_ex.state, ExecutionState::Error);

    let attempt = task_named(&engine, wf_ex.id, "attempt").await;
    assert_eq!(attempt.state, ExecutionState::Error);
    assert_eq!(attempt.runtime_context.policies.retry_no, 1);
    assert_eq!(actions_of(&engine, &attempt).await.len(), 2);
}

#[tokio::test]
async fn test_retry_break_on_stops_early() {
    let engine = engine(&[r#"
name: breaking
tasks:
  - name: attempt
    action: test.async
    retry:
      count: 5
      break-on: "<% task.result == 'fatal' %>"
"#])
    .await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("breaking"))
        .await
        .unwrap();
    let attempt = task_named(&engine, wf_ex.id, "attempt").await;

    let first = actions_of(&engine, &attempt).await.remove(0);
    engine
        .on_action_complete(first.id, ActionResult::Error(json!("flaky")), false)
        .await
        .unwrap();
    let second = actions_of(&engine, &attempt).await.remove(1);
    engine
        .on_action_complete(second.id, ActionResult::Error(json!("fatal")), false)
        .await
        .unwrap();

    let attempt = task_named(&engine, wf_ex.id, "attempt").await;
    assert_eq!(attempt.state, ExecutionState::Error);
    assert_eq!(attempt.state_info.as_deref(), Some("fatal"));
    assert_eq!(actions_of(&engine, &attempt).await.len(), 2);
}

#[tokio::test]
async fn test_retry_continue_on_repeats_successful_runs() {
    let engine = engine(&[r#"
name: polling
tasks:
  - name: poll
    action: test.async
    retry:
      count: 5
      continue-on: "<% task.result != 'ready' %>"
    publish:
      status: "<% task.result %>"
"#])
    .await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("polling"))
        .await
        .unwrap();
    let poll = task_named(&engine, wf_ex.id, "poll").await;

    for (attempt, status) in ["pending", "ready"].into_iter().enumerate() {
        let action_ex = actions_of(&engine, &poll).await.remove(attempt);
        engine
            .on_action_complete(action_ex.id, ActionResult::Success(json!(status)), false)
            .await
            .unwrap();
    }

    let wf_ex = engine.get_workflow_execution(wf_ex.id).await.unwrap();
    assert_eq!(wf_ex.state, ExecutionState::Success);
    assert_eq!(Value::Object(wf_ex.output), json!({"status": "ready"}));
    assert_eq!(actions_of(&engine, &poll).await.len(), 2);
}

#[tokio::test]
async fn test_retry_delay_holds_task_until_job_runs() {
    let engine = engine(&[r#"
name: patient
tasks:
  - name: attempt
    action: test.async
    retry:
      count: 1
      delay: 30
"#])
    .await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("patient"))
        .await
        .unwrap();
    let attempt = task_named(&engine, wf_ex.id, "attempt").await;
    let first = actions_of(&engine, &attempt).await.remove(0);
    engine
        .on_action_complete(first.id, ActionResult::Error(json!("boom")), false)
        .await
        .unwrap();

    let attempt = task_named(&engine, wf_ex.id, "attempt").await;
    assert_eq!(attempt.state, ExecutionState::RunningDelayed);
    assert_eq!(
        attempt.state_info.as_deref(),
        Some("Delayed by 'retry' policy [delay=30]")
    );
    assert!(attempt.runtime_context.policies.continue_at.is_some());
    assert_eq!(engine.process_scheduled_jobs(chrono::Utc::now()).await.unwrap(), 0);

    assert_eq!(run_due_jobs(&engine).await, 1);
    let attempt = task_named(&engine, wf_ex.id, "attempt").await;
    assert_eq!(attempt.state, ExecutionState::Running);
    assert_eq!(actions_of(&engine, &attempt).await.len(), 2);
}

#[tokio::test]
async fn test_wait_before_and_wait_after_delay_the_task() {
    let engine = engine(&[r#"
name: waiting
tasks:
  - name: slow
    action: std.noop
    wait-before: 10
    wait-after: 5
"#])
    .await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("waiting"))
        .await
        .unwrap();
    let slow = task_named(&engine, wf_ex.id, "slow").await;
    assert_eq!(slow.state, ExecutionState::RunningDelayed);
    assert_eq!(
        slow.state_info.as_deref(),
        Some("Delayed by 'wait-before' policy [delay=10]")
    );
    assert!(actions_of(&engine, &slow).await.is_empty());

    assert_eq!(run_due_jobs(&engine).await, 1);
    let slow = task_named(&engine, wf_ex.id, "slow").await;
    assert_eq!(slow.state, ExecutionState::RunningDelayed);
    assert_eq!(
        slow.state_info.as_deref(),
        Some("Delayed by 'wait-after' policy [delay=5]")
    );
    assert_eq!(actions_of(&engine, &slow).await.len(), 1);

    assert_eq!(run_due_jobs(&engine).await, 1);
    assert_eq!(
        task_named(&engine, wf_ex.id, "slow").await.state,
        ExecutionState::Success
    );
    assert_eq!(
        engine.get_workflow_execution(wf_ex.id).await.unwrap().state,
        ExecutionState::Success
    );
}

#[tokio::test]
async fn test_timeout_fails_unfinished_task() {
    let engine = engine(&[r#"
name: bounded
tasks:
  - name: wait
    action: test.async
    timeout: 30
"#])
    .await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("bounded"))
        .await
        .unwrap();
    let wait = task_named(&engine, wf_ex.id, "wait").await;
    let action_ex = actions_of(&engine, &wait).await.remove(0);

    assert_eq!(run_due_jobs(&engine).await, 1);
    let wait = task_named(&engine, wf_ex.id, "wait").await;
    assert_eq!(wait.state, ExecutionState::Error);
    assert_eq!(wait.state_info.as_deref(), Some("Task timed out [timeout(s)=30]."));
    assert_eq!(
        engine.get_action_execution(action_ex.id).await.unwrap().state,
        ExecutionState::Cancelled
    );
    assert_eq!(
        engine.get_workflow_execution(wf_ex.id).await.unwrap().state,
        ExecutionState::Error
    );

    let late = engine
        .on_action_complete(action_ex.id, ActionResult::Success(Value::Null), false)
        .await
        .unwrap();
    assert_eq!(late.state(), ExecutionState::Cancelled);
}

#[tokio::test]
async fn test_timeout_of_finished_task_is_ignored() {
    let engine = engine(&[r#"
name: quick
tasks:
  - name: fast
    action: std.noop
    timeout: 30
"#])
    .await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("quick"))
        .await
        .unwrap();
    assert_eq!(wf_ex.state, ExecutionState::Success);

    assert_eq!(run_due_jobs(&engine).await, 1);
    assert_eq!(
        task_named(&engine, wf_ex.id, "fast").await.state,
        ExecutionState::Success
    );
    assert_eq!(run_due_jobs(&engine).await, 0);
}

#[tokio::test]
async fn test_pause_before_pauses_workflow_until_resumed() {
    let engine = engine(&[r#"
name: gated
tasks:
  - name: gate
    action: std.noop
    pause-before: true
"#])
    .await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("gated"))
        .await
        .unwrap();
    assert_eq!(wf_ex.state, ExecutionState::Paused);

    let gate = task_named(&engine, wf_ex.id, "gate").await;
    assert_eq!(gate.state, ExecutionState::Idle);
    assert_eq!(gate.state_info.as_deref(), Some(policy::PAUSE_BEFORE_MESSAGE));
    assert!(actions_of(&engine, &gate).await.is_empty());

    let resumed = engine.resume_workflow(wf_ex.id, None).await.unwrap();
    assert_eq!(resumed.state, ExecutionState::Success);
    assert_eq!(
        task_named(&engine, wf_ex.id, "gate").await.state,
        ExecutionState::Success
    );
}

#[tokio::test]
async fn test_fail_on_turns_success_into_error() {
    let engine = engine(&[r#"
name: checked
tasks:
  - name: call
    action: std.echo
    input:
      output:
        status: 500
    fail-on: "<% task.result.status != 200 %>"
"#])
    .await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("checked"))
        .await
        .unwrap();
    assert_eq!(wf_ex.state, ExecutionState::Error);

    let call = task_named(&engine, wf_ex.id, "call").await;
    assert_eq!(call.state, ExecutionState::Error);
    assert_eq!(call.state_info.as_deref(), Some(policy::FAIL_ON_MESSAGE));
}

#[tokio::test]
async fn test_start_task_runs_from_persisted_record() {
    let engine = engine(&[r#"
name: stepwise
tasks:
  - name: first
    action: std.noop
    publish:
      seen: 1
    on-success:
      - pause
      - second
  - name: second
    action: std.echo
    input:
      output: "<% seen %>"
"#])
    .await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("stepwise"))
        .await
        .unwrap();
    let first = task_named(&engine, wf_ex.id, "first").await;
    let second = task_named(&engine, wf_ex.id, "second").await;
    assert_eq!(second.runtime_context.triggered_by[0].task_id, first.id);

    // Paused workflow: the task is left alone.
    let untouched = engine.start_task(second.id).await.unwrap();
    assert_eq!(untouched.state, ExecutionState::Idle);

    let mut running = engine.get_workflow_execution(wf_ex.id).await.unwrap();
    running.state = ExecutionState::Running;
    let mut tx = engine.store().begin().await.unwrap();
    tx.update_workflow_execution(&running).await.unwrap();
    tx.commit().await.unwrap();

    engine.start_task(second.id).await.unwrap();
    let second = task_named(&engine, wf_ex.id, "second").await;
    assert_eq!(second.state, ExecutionState::Success);
    assert_eq!(second.in_context.get("seen"), Some(&json!(1)));
    assert_eq!(second.runtime_context.triggered_by[0].task_id, first.id);
    assert_eq!(second.runtime_context.policies.run, 1);

    // Starting a finished task again changes nothing.
    let again = engine.start_task(second.id).await.unwrap();
    assert_eq!(again.state, ExecutionState::Success);
    assert_eq!(again.runtime_context.policies.run, 1);
}

// ---------------------------------------------------------------------------
// Engine commands
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_fail_command_fails_workflow_and_skips_later_targets() {
    let engine = engine(&[r#"
name: strict
tasks:
  - name: check
    action: std.noop
    on-success:
      - fail
      - never
  - name: never
    action: std.noop
"#])
    .await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("strict"))
        .await
        .unwrap();
    assert_eq!(wf_ex.state, ExecutionState::Error);
    assert_eq!(
        wf_ex.state_info.as_deref(),
        Some("Failed by 'fail' command of task 'check'")
    );
    assert_eq!(engine.list_task_executions(wf_ex.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_succeed_command_ends_workflow_successfully() {
    let engine = engine(&[r#"
name: lenient
tasks:
  - name: risky
    action: std.fail
    on-error: succeed
  - name: slow
    action: test.async
"#])
    .await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("lenient"))
        .await
        .unwrap();
    assert_eq!(wf_ex.state, ExecutionState::Success);
    let risky = task_named(&engine, wf_ex.id, "risky").await;
    assert_eq!(risky.state, ExecutionState::Error);
    assert!(risky.error_handled);
    assert!(!risky.has_next_tasks);
}

#[tokio::test]
async fn test_pause_command_pauses_before_next_task_runs() {
    let engine = engine(&[r#"
name: stepwise
tasks:
  - name: first
    action: std.noop
    on-success:
      - pause
      - second
  - name: second
    action: std.noop
"#])
    .await;
    let wf_ex = engine
        .start_workflow(StartWorkflow::new("stepwise"))
        .await
        .unwrap();
    assert_eq!(wf_ex.state, ExecutionState::Paused);
    assert_eq!(
        task_named(&engine, wf_ex.id, "second").await.state,
        ExecutionState::Idle
    );

    let resumed = engine.resume_workflow(wf_ex.id, None).await.unwrap();
    assert_eq!(resumed.state, ExecutionState::Success);
    assert_eq!(
        task_named(&engine, wf_ex.id, "second").await.state,
        ExecutionState::Success
    );
}
