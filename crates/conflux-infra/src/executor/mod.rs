//! Action executors.

pub mod local;

pub use local::{run_completion_loop, ActionCompletion, LocalExecutor};

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use conflux_core::engine::{Engine, StartWorkflow};
    use conflux_core::workflow::definition::parse_workflow_yaml;
    use conflux_types::config::EngineConfig;
    use conflux_types::state::ExecutionState;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::sqlite::{DatabasePool, SqliteExecutionStore};

    #[tokio::test]
    async fn test_sleep_workflow_completes_over_sqlite() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("engine.db").display());
        let store = SqliteExecutionStore::new(DatabasePool::new(&url).await.unwrap());
        let (executor, completions) = LocalExecutor::new();
        let engine = Arc::new(Engine::new(
            store,
            executor,
            LocalExecutor::registry(),
            EngineConfig::default(),
        ));

        engine
            .register_workflow(
                parse_workflow_yaml(
                    r#"
name: nap
tasks:
  - name: sleep
    action: std.sleep
    input:
      seconds: 0
      result: rested
    publish:
      mood: "<% task.result %>"
    on-success: report
  - name: report
    action: std.echo
    input:
      output: "<% mood %>"
    publish:
      report: "<% task.result %>"
"#,
                )
                .unwrap(),
                "",
            )
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let forwarder = tokio::spawn(run_completion_loop(
            Arc::clone(&engine),
            completions,
            Duration::from_secs(1),
            cancel.clone(),
        ));

        let wf_ex = engine.start_workflow(StartWorkflow::new("nap")).await.unwrap();
        assert_eq!(wf_ex.state, ExecutionState::Running);

        let mut state = wf_ex.state;
        for _ in 0..100 {
            state = engine.get_workflow_execution(wf_ex.id).await.unwrap().state;
            if state.is_completed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(state, ExecutionState::Success);

        let done = engine.get_workflow_execution(wf_ex.id).await.unwrap();
        assert_eq!(
            Value::Object(done.output),
            json!({"mood": "rested", "report": "rested"})
        );

        cancel.cancel();
        forwarder.await.unwrap();
    }
}
