//! CLI task subcommands.

use anyhow::Result;
use clap::Subcommand;
use console::style;
use uuid::Uuid;

use super::{parse_json_object_opt, print_json, styled_state};
use crate::state::AppState;

#[derive(Subcommand)]
pub enum TaskCommand {
    /// Re-run a task in ERROR and reopen its workflow.
    Rerun {
        /// Task execution id.
        id: Uuid,

        /// Discard the task's previous results (required for with-items).
        #[arg(long, conflicts_with = "no_reset")]
        reset: bool,

        /// Keep successful with-items iterations and re-run only failed ones.
        #[arg(long)]
        no_reset: bool,

        /// Mark the task SKIPPED and continue along its success route.
        #[arg(long)]
        skip: bool,

        /// Environment updates as a JSON object.
        #[arg(long)]
        env: Option<String>,
    },
}

pub async fn handle_task_command(cmd: TaskCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        TaskCommand::Rerun {
            id,
            reset,
            no_reset,
            skip,
            env,
        } => {
            let env = parse_json_object_opt(env.as_deref(), "--env")?;
            let wf_ex = state
                .engine
                .rerun_workflow(id, reset_flag(reset, no_reset), skip, env)
                .await?;

            if json {
                return print_json(&serde_json::json!({
                    "task_execution_id": id.to_string(),
                    "workflow_execution_id": wf_ex.id.to_string(),
                    "state": wf_ex.state,
                    "skipped": skip,
                }));
            }

            println!();
            println!(
                "  {} {} task {}",
                style("*").green().bold(),
                if skip { "Skipped" } else { "Re-running" },
                style(id).cyan()
            );
            println!(
                "  Workflow '{}' is {}",
                style(&wf_ex.name).cyan(),
                styled_state(wf_ex.state)
            );
            println!();
            Ok(())
        }
    }
}

fn reset_flag(reset: bool, no_reset: bool) -> Option<bool> {
    match (reset, no_reset) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_flag_defaults_to_engine_choice() {
        assert_eq!(reset_flag(false, false), None);
        assert_eq!(reset_flag(true, false), Some(true));
        assert_eq!(reset_flag(false, true), Some(false));
    }
}
