//! CLI argument definitions and command handlers.

pub mod action;
pub mod env;
pub mod execution;
pub mod status;
pub mod task;
pub mod workflow;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use comfy_table::{Cell, Color};
use conflux_types::state::ExecutionState;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use serde_json::{Map, Value};

use action::ActionCommand;
use env::EnvCommand;
use execution::ExecutionCommand;
use task::TaskCommand;
use workflow::WorkflowCommand;

/// Conflux - run workflow definitions as durable executions.
#[derive(Parser)]
#[command(name = "cflx", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output as JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Only log errors.
    #[arg(long, short, global = true)]
    pub quiet: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(long, short, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register and list workflow definitions.
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommand,
    },

    /// Manage named environments.
    Env {
        #[command(subcommand)]
        command: EnvCommand,
    },

    /// Start and control workflow executions.
    Execution {
        #[command(subcommand)]
        command: ExecutionCommand,
    },

    /// Re-run failed tasks.
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },

    /// Run actions and report on asynchronous ones.
    Action {
        #[command(subcommand)]
        command: ActionCommand,
    },

    /// Show execution counts and storage info.
    Status,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Parse a JSON object argument such as `--input '{"name": "x"}'`.
pub fn parse_json_object(raw: &str, what: &str) -> Result<Map<String, Value>> {
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("Invalid JSON for {what}"))?;
    match value {
        Value::Object(map) => Ok(map),
        other => bail!("{what} must be a JSON object, got: {other}"),
    }
}

pub fn parse_json_object_opt(raw: Option<&str>, what: &str) -> Result<Option<Map<String, Value>>> {
    raw.map(|r| parse_json_object(r, what)).transpose()
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Table cell for an execution state, colored by outcome.
pub fn state_cell(state: ExecutionState) -> Cell {
    let color = match state {
        ExecutionState::Success => Color::Green,
        ExecutionState::Error => Color::Red,
        ExecutionState::Cancelled => Color::DarkGrey,
        ExecutionState::Paused => Color::Yellow,
        _ => Color::Blue,
    };
    Cell::new(state).fg(color)
}

pub fn styled_state(state: ExecutionState) -> console::StyledObject<ExecutionState> {
    let styled = console::style(state);
    match state {
        ExecutionState::Success => styled.green(),
        ExecutionState::Error => styled.red(),
        ExecutionState::Cancelled => styled.dim(),
        ExecutionState::Paused => styled.yellow(),
        _ => styled.blue(),
    }
}

/// Steady spinner shown while waiting on the engine. Hidden in JSON mode.
pub fn spinner(message: &str, json: bool) -> Result<ProgressBar> {
    if json {
        return Ok(ProgressBar::hidden());
    }
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}")?);
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(std::time::Duration::from_millis(80));
    Ok(spinner)
}

/// Shorten long text for table cells.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}
