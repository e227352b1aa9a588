//! CLI action subcommands.
//!
//! `complete` and `heartbeat` are how an external worker reports on an
//! asynchronous action. `run` executes an action outside any workflow.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgGroup, Subcommand};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use serde_json::Value;
use uuid::Uuid;

use conflux_core::engine::{ExecutionRecord, StartAction};
use conflux_types::execution::{ActionExecution, ActionResult};

use super::{parse_json_object, print_json, spinner, styled_state};
use crate::state::AppState;

const POLL_EVERY: Duration = Duration::from_millis(100);

#[derive(Subcommand)]
pub enum ActionCommand {
    /// Deliver the result of an asynchronous action (or sub-workflow).
    #[command(group(ArgGroup::new("outcome").required(true).args(["output", "error", "cancel"])))]
    Complete {
        /// Action execution id.
        id: Uuid,

        /// Successful result as JSON.
        #[arg(long)]
        output: Option<String>,

        /// Error payload as JSON.
        #[arg(long)]
        error: Option<String>,

        /// Report the action as cancelled.
        #[arg(long)]
        cancel: bool,

        /// The id names a sub-workflow execution.
        #[arg(long)]
        workflow: bool,
    },

    /// Record heartbeats for running asynchronous actions.
    Heartbeat {
        /// Action execution ids.
        #[arg(required = true)]
        ids: Vec<Uuid>,
    },

    /// Run an action outside any workflow.
    Run {
        /// Action name.
        name: String,

        /// Action input as a JSON object.
        #[arg(long)]
        input: Option<String>,

        /// Persist the action execution.
        #[arg(long)]
        save: bool,
    },

    /// List the actions this engine can run.
    List,
}

pub async fn handle_action_command(cmd: ActionCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        ActionCommand::Complete {
            id,
            output,
            error,
            cancel,
            workflow,
        } => {
            let result = action_result(output.as_deref(), error.as_deref(), cancel)?;
            let record = state.engine.on_action_complete(id, result, workflow).await?;
            show_record(&record, json)
        }
        ActionCommand::Heartbeat { ids } => {
            let recorded = state.engine.process_action_heartbeats(&ids).await;
            if json {
                return print_json(&serde_json::json!({
                    "requested": ids.len(),
                    "recorded": recorded,
                }));
            }
            println!();
            println!(
                "  {} Recorded {recorded} of {} heartbeats",
                style("*").green().bold(),
                ids.len()
            );
            println!();
            Ok(())
        }
        ActionCommand::Run { name, input, save } => {
            let input = match input.as_deref() {
                Some(raw) => parse_json_object(raw, "--input")?,
                None => serde_json::Map::new(),
            };
            let is_sync = state.engine.registry().resolve(&name)?.is_sync;

            let mut request = StartAction::new(name, input);
            request.run_sync = is_sync;
            request.save_result = save;

            let action_ex = if is_sync {
                state.engine.start_action(request).await?
            } else {
                let background = state.start_background()?;
                let outcome = match state.engine.start_action(request).await {
                    Ok(action_ex) => wait_for_action(state, action_ex, json).await,
                    Err(e) => Err(e.into()),
                };
                background.stop().await;
                outcome?
            };
            show_action(&action_ex, json)
        }
        ActionCommand::List => {
            let registry = state.engine.registry();
            let names = registry.list_names();
            if json {
                let out: Vec<_> = names
                    .iter()
                    .filter_map(|name| registry.get(name))
                    .map(|d| {
                        serde_json::json!({
                            "name": d.name,
                            "sync": d.is_sync,
                            "description": d.description,
                        })
                    })
                    .collect();
                return print_json(&out);
            }

            let mut table = Table::new();
            table
                .load_preset(presets::UTF8_FULL_CONDENSED)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec![
                    Cell::new("Action").fg(Color::Cyan),
                    Cell::new("Mode"),
                    Cell::new("Description"),
                ]);
            for d in names.iter().filter_map(|name| registry.get(name)) {
                table.add_row(vec![
                    Cell::new(&d.name),
                    Cell::new(if d.is_sync { "sync" } else { "async" }),
                    Cell::new(&d.description),
                ]);
            }
            println!();
            println!("{table}");
            println!();
            Ok(())
        }
    }
}

fn action_result(output: Option<&str>, error: Option<&str>, cancel: bool) -> Result<ActionResult> {
    if cancel {
        return Ok(ActionResult::Cancelled);
    }
    if let Some(raw) = error {
        return Ok(ActionResult::Error(parse_value(raw, "--error")?));
    }
    let raw = output.unwrap_or("null");
    Ok(ActionResult::Success(parse_value(raw, "--output")?))
}

/// Parse JSON, falling back to a plain string so `--output done` works.
fn parse_value(raw: &str, what: &str) -> Result<Value> {
    match serde_json::from_str(raw) {
        Ok(value) => Ok(value),
        Err(_) if !raw.trim_start().starts_with(['{', '[', '"']) => Ok(Value::String(raw.to_string())),
        Err(e) => Err(e).with_context(|| format!("Invalid JSON for {what}")),
    }
}

async fn wait_for_action(
    state: &AppState,
    mut action_ex: ActionExecution,
    json: bool,
) -> Result<ActionExecution> {
    let mut ticker = tokio::time::interval(POLL_EVERY);
    let spinner = spinner(&format!("Waiting for '{}'...", action_ex.name), json)?;
    while !action_ex.state.is_completed() {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, no longer waiting");
                break;
            }
            _ = ticker.tick() => {
                action_ex = state.engine.get_action_execution(action_ex.id).await?;
            }
        }
    }
    spinner.finish_and_clear();
    Ok(action_ex)
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn show_record(record: &ExecutionRecord, json: bool) -> Result<()> {
    match record {
        ExecutionRecord::Action(action_ex) => show_action(action_ex, json),
        ExecutionRecord::Workflow(wf_ex) => {
            if json {
                return print_json(&serde_json::json!({
                    "id": wf_ex.id.to_string(),
                    "workflow": wf_ex.name,
                    "state": wf_ex.state,
                    "state_info": wf_ex.state_info,
                }));
            }
            println!();
            println!(
                "  {} Sub-workflow '{}' is {}",
                style("*").green().bold(),
                style(&wf_ex.name).cyan(),
                styled_state(wf_ex.state)
            );
            println!();
            Ok(())
        }
    }
}

fn show_action(action_ex: &ActionExecution, json: bool) -> Result<()> {
    if json {
        return print_json(action_ex);
    }

    println!();
    println!(
        "  {} {}",
        style(&action_ex.name).cyan().bold(),
        styled_state(action_ex.state)
    );
    println!("  ID: {}", action_ex.id);
    if let Some(task) = action_ex.task_execution_id {
        println!("  Task: {task}");
    }
    if let Some(info) = &action_ex.state_info {
        println!("  Info: {}", style(info).yellow());
    }
    if !action_ex.output.is_empty() {
        println!();
        println!(
            "{}",
            serde_json::to_string_pretty(&Value::Object(action_ex.output.clone()))?
        );
    }
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_result_from_flags() {
        assert_eq!(
            action_result(Some(r#"{"n": 1}"#), None, false).unwrap(),
            ActionResult::Success(json!({"n": 1}))
        );
        assert_eq!(
            action_result(None, Some("boom"), false).unwrap(),
            ActionResult::Error(json!("boom"))
        );
        assert_eq!(
            action_result(None, None, true).unwrap(),
            ActionResult::Cancelled
        );
    }

    #[test]
    fn test_parse_value_rejects_broken_json() {
        assert_eq!(parse_value("42", "--output").unwrap(), json!(42));
        assert_eq!(parse_value("done", "--output").unwrap(), json!("done"));
        assert!(parse_value("{broken", "--output").is_err());
    }
}
