//! Conflux CLI entry point.
//!
//! Binary name: `cflx`
//!
//! Parses CLI arguments, sets up tracing, opens the engine over the data
//! directory, then dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use conflux_observe::tracing_setup::{init_tracing, shutdown_tracing, TracingOptions};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need tracing or app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "cflx", &mut std::io::stdout());
        return Ok(());
    }

    let options = TracingOptions {
        enable_otel: cli.otel,
        json: cli.log_json,
        verbosity: cli.verbose,
        quiet: cli.quiet,
    };
    init_tracing(&options).map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    let state = AppState::init().await?;
    let result = dispatch(cli.command, &state, cli.json).await;

    shutdown_tracing();
    result
}

async fn dispatch(command: Commands, state: &AppState, json: bool) -> anyhow::Result<()> {
    match command {
        Commands::Workflow { command } => {
            cli::workflow::handle_workflow_command(command, state, json).await
        }
        Commands::Env { command } => cli::env::handle_env_command(command, state, json).await,
        Commands::Execution { command } => {
            cli::execution::handle_execution_command(command, state, json).await
        }
        Commands::Task { command } => cli::task::handle_task_command(command, state, json).await,
        Commands::Action { command } => {
            cli::action::handle_action_command(command, state, json).await
        }
        Commands::Status => cli::status::status(state, json).await,
        Commands::Completions { .. } => Ok(()),
    }
}
