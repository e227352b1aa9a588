//! CLI workflow execution subcommands.
//!
//! `start --wait` keeps the process alive, feeding asynchronous action
//! results into the engine until the execution completes.

use std::time::Duration;

use anyhow::{Context, Result};
use dialoguer::Confirm;
use clap::Subcommand;
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use serde_json::Value;
use uuid::Uuid;

use conflux_core::engine::{EnvSource, StartWorkflow};
use conflux_types::execution::{TaskExecution, WorkflowExecution};
use conflux_types::state::ExecutionState;

use super::{
    parse_json_object, parse_json_object_opt, print_json, spinner, state_cell, styled_state,
    truncate,
};
use crate::state::AppState;

const POLL_EVERY: Duration = Duration::from_millis(200);

#[derive(Subcommand)]
pub enum ExecutionCommand {
    /// Start a workflow execution.
    Start {
        /// Workflow name.
        workflow: String,

        /// Namespace the workflow is registered in.
        #[arg(long, default_value = "")]
        namespace: String,

        /// Workflow input as a JSON object.
        #[arg(long)]
        input: Option<String>,

        /// Environment variables as a JSON object.
        #[arg(long, conflicts_with = "env_name")]
        env: Option<String>,

        /// Name of a stored environment.
        #[arg(long)]
        env_name: Option<String>,

        /// Use this execution id. Starting twice with one id is a no-op.
        #[arg(long)]
        id: Option<Uuid>,

        /// Execution description.
        #[arg(long, default_value = "")]
        description: String,

        /// Wait for the execution to complete.
        #[arg(long)]
        wait: bool,

        /// Give up waiting after this many seconds.
        #[arg(long, requires = "wait")]
        timeout: Option<u64>,
    },

    /// Show a workflow execution.
    Get {
        /// Execution id.
        id: Uuid,
    },

    /// Pause a running execution.
    Pause {
        /// Execution id.
        id: Uuid,
    },

    /// Resume a paused execution.
    Resume {
        /// Execution id.
        id: Uuid,

        /// Environment updates as a JSON object.
        #[arg(long)]
        env: Option<String>,

        /// Wait for the execution to complete.
        #[arg(long)]
        wait: bool,
    },

    /// Force an execution into a terminal state.
    Stop {
        /// Execution id.
        id: Uuid,

        /// Target state (SUCCESS, ERROR or CANCELLED).
        #[arg(long, default_value = "CANCELLED")]
        state: ExecutionState,

        /// Message recorded as the state info.
        #[arg(long)]
        message: Option<String>,

        /// Skip confirmation prompt.
        #[arg(long)]
        force: bool,
    },

    /// List the task executions of an execution.
    Tasks {
        /// Execution id.
        id: Uuid,
    },

    /// List recent executions.
    List {
        /// Maximum number of executions to display.
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

pub async fn handle_execution_command(
    cmd: ExecutionCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        ExecutionCommand::Start {
            workflow,
            namespace,
            input,
            env,
            env_name,
            id,
            description,
            wait,
            timeout,
        } => {
            let mut request = StartWorkflow::new(workflow).with_namespace(namespace);
            request.description = description;
            if let Some(raw) = input.as_deref() {
                request = request.with_input(parse_json_object(raw, "--input")?);
            }
            if let Some(env) = env_source(env.as_deref(), env_name)? {
                request = request.with_env(env);
            }
            if let Some(id) = id {
                request = request.with_execution_id(id);
            }

            let wf_ex = if wait {
                let background = state.start_background()?;
                let started = state.engine.start_workflow(request).await;
                let outcome = match started {
                    Ok(wf_ex) => {
                        let timeout = timeout.map(Duration::from_secs);
                        wait_for_completion(state, wf_ex, timeout, json).await
                    }
                    Err(e) => Err(e.into()),
                };
                background.stop().await;
                outcome?
            } else {
                state.engine.start_workflow(request).await?
            };
            show_execution(&wf_ex, json)
        }
        ExecutionCommand::Get { id } => {
            let wf_ex = state.engine.get_workflow_execution(id).await?;
            show_execution(&wf_ex, json)
        }
        ExecutionCommand::Pause { id } => {
            let wf_ex = state.engine.pause_workflow(id).await?;
            show_execution(&wf_ex, json)
        }
        ExecutionCommand::Resume { id, env, wait } => {
            let env = parse_json_object_opt(env.as_deref(), "--env")?;
            let wf_ex = if wait {
                let background = state.start_background()?;
                let outcome = match state.engine.resume_workflow(id, env).await {
                    Ok(wf_ex) => wait_for_completion(state, wf_ex, None, json).await,
                    Err(e) => Err(e.into()),
                };
                background.stop().await;
                outcome?
            } else {
                state.engine.resume_workflow(id, env).await?
            };
            show_execution(&wf_ex, json)
        }
        ExecutionCommand::Stop {
            id,
            state: target,
            message,
            force,
        } => {
            if !force && !json {
                let confirmed = Confirm::new()
                    .with_prompt(format!(
                        "Stop execution {} as {}?",
                        style(id).cyan(),
                        styled_state(target)
                    ))
                    .default(false)
                    .interact()?;
                if !confirmed {
                    println!("  Aborted.");
                    return Ok(());
                }
            }
            let wf_ex = state.engine.stop_workflow(id, target, message).await?;
            show_execution(&wf_ex, json)
        }
        ExecutionCommand::Tasks { id } => {
            let tasks = state.engine.list_task_executions(id).await?;
            show_tasks(&tasks, json)
        }
        ExecutionCommand::List { limit } => {
            let executions = state.engine.list_workflow_executions(limit).await?;
            show_executions(&executions, json)
        }
    }
}

fn env_source(inline: Option<&str>, name: Option<String>) -> Result<Option<EnvSource>> {
    if let Some(raw) = inline {
        return Ok(Some(EnvSource::Inline(parse_json_object(raw, "--env")?)));
    }
    Ok(name.map(EnvSource::Named))
}

/// Poll until the execution leaves its running states. Paused executions
/// end the wait as well.
async fn wait_for_completion(
    state: &AppState,
    mut wf_ex: WorkflowExecution,
    timeout: Option<Duration>,
    json: bool,
) -> Result<WorkflowExecution> {
    let started = tokio::time::Instant::now();
    let mut ticker = tokio::time::interval(POLL_EVERY);
    let spinner = spinner(&format!("Running '{}'...", wf_ex.name), json)?;

    while !wf_ex.state.is_paused_or_completed() {
        if timeout.is_some_and(|limit| started.elapsed() >= limit) {
            tracing::warn!(workflow_execution_id = %wf_ex.id, "timed out waiting for execution");
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, no longer waiting");
                break;
            }
            _ = ticker.tick() => {
                wf_ex = state
                    .engine
                    .get_workflow_execution(wf_ex.id)
                    .await
                    .context("Failed to poll execution")?;
            }
        }
    }
    spinner.finish_and_clear();
    Ok(wf_ex)
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn show_execution(wf_ex: &WorkflowExecution, json: bool) -> Result<()> {
    if json {
        return print_json(&serde_json::json!({
            "id": wf_ex.id.to_string(),
            "workflow": wf_ex.name,
            "namespace": wf_ex.namespace,
            "state": wf_ex.state,
            "state_info": wf_ex.state_info,
            "input": wf_ex.input,
            "output": wf_ex.output,
            "root_execution_id": wf_ex.root_execution_id,
            "task_execution_id": wf_ex.task_execution_id,
            "created_at": wf_ex.created_at.to_rfc3339(),
            "updated_at": wf_ex.updated_at.to_rfc3339(),
        }));
    }

    println!();
    println!(
        "  {} {}",
        style(&wf_ex.name).cyan().bold(),
        styled_state(wf_ex.state)
    );
    println!("  ID: {}", wf_ex.id);
    if let Some(parent) = wf_ex.task_execution_id {
        println!("  Parent task: {parent}");
    }
    if let Some(info) = &wf_ex.state_info {
        println!("  Info: {}", style(info).yellow());
    }
    println!("  Started: {}", wf_ex.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("  Updated: {}", wf_ex.updated_at.format("%Y-%m-%d %H:%M:%S"));
    if !wf_ex.input.is_empty() {
        println!();
        println!("  {}", style("── Input ──").dim());
        println!("{}", serde_json::to_string_pretty(&Value::Object(wf_ex.input.clone()))?);
    }
    if !wf_ex.output.is_empty() {
        println!();
        println!("  {}", style("── Output ──").dim());
        println!("{}", serde_json::to_string_pretty(&Value::Object(wf_ex.output.clone()))?);
    }
    println!();
    Ok(())
}

fn show_executions(executions: &[WorkflowExecution], json: bool) -> Result<()> {
    if json {
        let out: Vec<_> = executions
            .iter()
            .map(|e| {
                serde_json::json!({
                    "id": e.id.to_string(),
                    "workflow": e.name,
                    "state": e.state,
                    "state_info": e.state_info,
                    "created_at": e.created_at.to_rfc3339(),
                })
            })
            .collect();
        return print_json(&out);
    }

    if executions.is_empty() {
        println!();
        println!("  No executions yet.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("State"),
            Cell::new("Created"),
            Cell::new("Info"),
        ]);

    for e in executions {
        table.add_row(vec![
            Cell::new(e.id),
            Cell::new(&e.name),
            state_cell(e.state),
            Cell::new(e.created_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(truncate(e.state_info.as_deref().unwrap_or("-"), 60)),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

fn show_tasks(tasks: &[TaskExecution], json: bool) -> Result<()> {
    if json {
        let out: Vec<_> = tasks
            .iter()
            .map(|t| {
                serde_json::json!({
                    "id": t.id.to_string(),
                    "name": t.name,
                    "state": t.state,
                    "state_info": t.state_info,
                    "published": t.published,
                    "processed": t.processed,
                    "error_handled": t.error_handled,
                })
            })
            .collect();
        return print_json(&out);
    }

    if tasks.is_empty() {
        println!();
        println!("  No task executions.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Task").fg(Color::Cyan),
            Cell::new("ID"),
            Cell::new("State"),
            Cell::new("Published"),
            Cell::new("Info"),
        ]);

    for t in tasks {
        let published = t.published.keys().cloned().collect::<Vec<_>>().join(", ");
        table.add_row(vec![
            Cell::new(&t.name),
            Cell::new(t.id),
            state_cell(t.state),
            Cell::new(if published.is_empty() { "-".to_string() } else { published }),
            Cell::new(truncate(t.state_info.as_deref().unwrap_or("-"), 60)),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}
