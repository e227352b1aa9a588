//! Background heartbeat checker.
//!
//! Asynchronous actions report liveness through
//! [`Engine::process_action_heartbeats`]. The checker periodically fails
//! those that stayed silent for `check_interval_secs * max_missed`, or hands
//! them to the executor again when they are safe to rerun.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::repository::ExecutionStore;

use super::executor::ActionExecutor;
use super::Engine;

/// State info recorded on an action failed for missing heartbeats.
pub const HEARTBEAT_MESSAGE: &str = "Heartbeat wasn't received.";

/// Spawn the checker loop. Returns `None` when checking is disabled
/// (`check_interval_secs = 0`). The loop exits when `cancel` fires.
pub fn spawn_heartbeat_checker<S, X>(
    engine: Arc<Engine<S, X>>,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>>
where
    S: ExecutionStore + 'static,
    X: ActionExecutor + 'static,
{
    let interval_secs = engine.config().heartbeat.check_interval_secs;
    if interval_secs == 0 {
        tracing::info!("action heartbeat checking disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("heartbeat checker stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match engine.fail_expired_actions().await {
                        Ok(0) => {}
                        Ok(handled) => tracing::info!(handled, "handled actions with expired heartbeats"),
                        Err(e) => tracing::warn!(error = %e, "heartbeat check failed"),
                    }
                }
            }
        }
    }))
}
