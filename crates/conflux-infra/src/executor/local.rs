//! In-process action executor with the built-in `std.*` actions.
//!
//! `std.noop`, `std.echo` and `std.fail` complete inline. `std.sleep` is
//! asynchronous: it runs on a spawned task and delivers its result through
//! the completion channel returned by [`LocalExecutor::new`]. The receiving
//! side ([`run_completion_loop`]) feeds results back into the engine and
//! sends heartbeats for sleeps still in flight.

use std::sync::Arc;
use std::time::Duration;

use conflux_core::engine::{
    ActionDescriptor, ActionExecutor, ActionRegistry, ActionRequest, Engine, ExecutorError,
};
use conflux_core::repository::ExecutionStore;
use conflux_types::definition::InputParam;
use conflux_types::execution::ActionResult;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A result produced after `run_action` returned.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionCompletion {
    pub action_execution_id: Uuid,
    pub result: ActionResult,
}

/// Executes the built-in actions in this process.
///
/// Asynchronous runs are tracked in a `DashMap` so that a redelivered
/// request for an action already in flight is ignored.
#[derive(Clone)]
pub struct LocalExecutor {
    in_flight: Arc<DashMap<Uuid, String>>,
    completions: mpsc::UnboundedSender<ActionCompletion>,
}

impl LocalExecutor {
    /// Create an executor and the receiving end of its completion channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ActionCompletion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let executor = Self {
            in_flight: Arc::new(DashMap::new()),
            completions: tx,
        };
        (executor, rx)
    }

    /// Descriptors for every action this executor runs.
    pub fn registry() -> ActionRegistry {
        ActionRegistry::new()
            .with(ActionDescriptor::sync("std.noop").with_description("Does nothing."))
            .with(
                ActionDescriptor::sync("std.echo")
                    .with_description("Returns its `output` parameter.")
                    .with_params(vec![param("output", Some(Value::Null))]),
            )
            .with(
                ActionDescriptor::sync("std.fail")
                    .with_description("Fails with its `error_data` parameter.")
                    .with_params(vec![param("error_data", Some(Value::Null))]),
            )
            .with(
                ActionDescriptor::asynchronous("std.sleep")
                    .with_description("Waits `seconds`, then returns `result`.")
                    .with_params(vec![
                        param("seconds", None),
                        param("result", Some(Value::Null)),
                    ]),
            )
    }

    /// Ids of asynchronous actions that have not reported back yet.
    pub fn in_flight(&self) -> Vec<Uuid> {
        self.in_flight.iter().map(|entry| *entry.key()).collect()
    }

    fn spawn_sleep(&self, request: &ActionRequest) -> Result<(), ExecutorError> {
        let delay = request
            .input
            .get("seconds")
            .and_then(Value::as_f64)
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
            .ok_or_else(|| {
                ExecutorError::Failed("std.sleep needs a non-negative, representable `seconds`".into())
            })?;
        let result = request.input.get("result").cloned().unwrap_or(Value::Null);
        let timeout = request.timeout;
        let id = request.action_execution_id;

        self.in_flight.insert(id, request.action.clone());
        let in_flight = Arc::clone(&self.in_flight);
        let completions = self.completions.clone();

        tokio::spawn(async move {
            let sleep = tokio::time::sleep(delay);
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, sleep).await {
                    Ok(()) => ActionResult::Success(result),
                    Err(_) => ActionResult::Error(json!(ExecutorError::Timeout(limit).to_string())),
                },
                None => {
                    sleep.await;
                    ActionResult::Success(result)
                }
            };
            in_flight.remove(&id);
            if completions
                .send(ActionCompletion {
                    action_execution_id: id,
                    result,
                })
                .is_err()
            {
                tracing::warn!(action_execution_id = %id, "completion channel closed, dropping result");
            }
        });
        Ok(())
    }
}

fn param(name: &str, default: Option<Value>) -> InputParam {
    InputParam {
        name: name.to_string(),
        default,
    }
}

impl ActionExecutor for LocalExecutor {
    async fn run_action(
        &self,
        request: ActionRequest,
    ) -> Result<Option<ActionResult>, ExecutorError> {
        let id = request.action_execution_id;
        if request.redelivered && self.in_flight.contains_key(&id) {
            tracing::debug!(action_execution_id = %id, "action already in flight, ignoring redelivery");
            return Ok(None);
        }

        tracing::debug!(action_execution_id = %id, action = %request.action, "running action");
        match request.action.as_str() {
            "std.noop" => Ok(Some(ActionResult::Success(Value::Null))),
            "std.echo" => Ok(Some(ActionResult::Success(
                request.input.get("output").cloned().unwrap_or(Value::Null),
            ))),
            "std.fail" => {
                let data = match request.input.get("error_data") {
                    Some(Value::Null) | None => json!("Fail action expected exception."),
                    Some(data) => data.clone(),
                };
                Ok(Some(ActionResult::Error(data)))
            }
            "std.sleep" => {
                self.spawn_sleep(&request)?;
                Ok(None)
            }
            other => Err(ExecutorError::UnknownAction(other.to_string())),
        }
    }
}

/// Feed delivered results into the engine until `cancel` fires or the
/// channel closes. Every `heartbeat_every`, in-flight actions report a
/// heartbeat.
pub async fn run_completion_loop<S>(
    engine: Arc<Engine<S, LocalExecutor>>,
    mut completions: mpsc::UnboundedReceiver<ActionCompletion>,
    heartbeat_every: Duration,
    cancel: CancellationToken,
) where
    S: ExecutionStore + 'static,
{
    let mut ticker = tokio::time::interval(heartbeat_every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            completion = completions.recv() => {
                let Some(ActionCompletion { action_execution_id, result }) = completion else {
                    break;
                };
                if let Err(e) = engine.on_action_complete(action_execution_id, result, false).await {
                    tracing::warn!(%action_execution_id, error = %e, "failed to deliver action result");
                }
            }
            _ = ticker.tick() => {
                let ids = engine.executor().in_flight();
                if !ids.is_empty() {
                    engine.process_action_heartbeats(&ids).await;
                }
            }
        }
    }
}
