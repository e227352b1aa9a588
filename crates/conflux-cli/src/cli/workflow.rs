//! CLI workflow definition subcommands.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Subcommand;
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;

use conflux_core::workflow::definition::{load_workflow_file, WorkflowError};

use super::print_json;
use crate::state::AppState;

/// Workflow definition subcommands.
#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Register a workflow from a YAML file. Re-registering a name replaces
    /// its spec.
    Create {
        /// Path to the workflow YAML file.
        file: PathBuf,

        /// Namespace to register the workflow in.
        #[arg(long, default_value = "")]
        namespace: String,
    },

    /// List registered workflows.
    List,
}

/// Handle a workflow subcommand.
pub async fn handle_workflow_command(
    cmd: WorkflowCommand,
    state: &AppState,
    json: bool,
) -> Result<()> {
    match cmd {
        WorkflowCommand::Create { file, namespace } => {
            handle_create(&file, &namespace, state, json).await
        }
        WorkflowCommand::List => handle_list(state, json).await,
    }
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

async fn handle_create(file: &Path, namespace: &str, state: &AppState, json: bool) -> Result<()> {
    let spec = load_workflow_file(file).map_err(|e| match e {
        WorkflowError::ParseError(msg) => anyhow::anyhow!("Failed to parse workflow YAML: {msg}"),
        WorkflowError::ValidationError(msg) => anyhow::anyhow!("Workflow validation failed: {msg}"),
        other => anyhow::anyhow!("Failed to load workflow: {other}"),
    })?;

    let def = state.engine.register_workflow(spec, namespace).await?;

    if json {
        print_json(&def)?;
    } else {
        println!();
        println!(
            "  {} Registered workflow '{}'",
            style("*").green().bold(),
            style(&def.name).cyan()
        );
        println!("  ID: {}", def.id);
        println!("  Tasks: {}", def.spec.tasks.len());
        if !def.namespace.is_empty() {
            println!("  Namespace: {}", def.namespace);
        }
        println!();
        println!(
            "  Start it with: {}",
            style(format!("cflx execution start {}", def.name)).dim()
        );
        println!();
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let defs = state.engine.list_workflows().await?;

    if json {
        let out: Vec<_> = defs
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id.to_string(),
                    "name": d.name,
                    "namespace": d.namespace,
                    "tasks": d.spec.tasks.len(),
                    "updated_at": d.updated_at.to_rfc3339(),
                })
            })
            .collect();
        return print_json(&out);
    }

    if defs.is_empty() {
        println!();
        println!("  No workflows registered.");
        println!(
            "  Register one with: {}",
            style("cflx workflow create <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Namespace"),
            Cell::new("Tasks"),
            Cell::new("Updated"),
        ]);

    for d in &defs {
        table.add_row(vec![
            Cell::new(&d.name),
            Cell::new(if d.namespace.is_empty() { "-" } else { d.namespace.as_str() }),
            Cell::new(d.spec.tasks.len()),
            Cell::new(d.updated_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}
