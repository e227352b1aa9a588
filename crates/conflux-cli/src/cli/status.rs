//! Engine status dashboard command.

use anyhow::Result;
use console::style;

use super::{print_json, styled_state};
use crate::state::AppState;

/// Show execution counts by state, registered workflows and the data
/// directory in use.
pub async fn status(state: &AppState, json: bool) -> Result<()> {
    let counts = state.engine.store().count_workflow_executions().await?;
    let workflows = state.engine.list_workflows().await?.len();
    let total: i64 = counts.iter().map(|(_, n)| n).sum();
    let config = state.engine.config();

    if json {
        let by_state: serde_json::Map<String, serde_json::Value> = counts
            .iter()
            .map(|(s, n)| (s.to_string(), serde_json::json!(n)))
            .collect();
        return print_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "data_dir": state.data_dir.display().to_string(),
            "workflows": workflows,
            "executions": {
                "total": total,
                "by_state": by_state,
            },
            "heartbeat": {
                "check_interval_secs": config.heartbeat.check_interval_secs,
                "max_missed": config.heartbeat.max_missed,
            },
            "scheduler": {
                "poll_interval_ms": config.scheduler.poll_interval_ms,
            },
        }));
    }

    println!();
    println!("  {} Conflux v{}", style("⚡").bold(), env!("CARGO_PKG_VERSION"));
    println!();

    println!("  {}", style("── Workflows ──").dim());
    println!("  Registered: {}", style(workflows).bold());
    println!();

    println!("  {}", style("── Executions ──").dim());
    println!("  Total:      {}", style(total).bold());
    for (execution_state, n) in &counts {
        println!("  {:<11} {}", format!("{}:", styled_state(*execution_state)), n);
    }
    println!();

    println!("  {}", style("── Storage ──").dim());
    println!("  Data dir:   {}", style(state.data_dir.display()).dim());
    println!(
        "  Heartbeats: every {}s, {} missed allowed",
        config.heartbeat.check_interval_secs, config.heartbeat.max_missed
    );
    println!("  Jobs:       polled every {}ms", config.scheduler.poll_interval_ms);
    println!();

    Ok(())
}
