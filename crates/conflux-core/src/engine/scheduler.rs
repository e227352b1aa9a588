//! Background runner for delayed policy work.
//!
//! Task policies persist their delayed steps as scheduled jobs. The runner
//! polls for due jobs and hands them to [`Engine::process_scheduled_jobs`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::repository::ExecutionStore;

use super::executor::ActionExecutor;
use super::Engine;

/// Spawn the polling loop. Returns `None` when polling is disabled
/// (`poll_interval_ms = 0`). The loop exits when `cancel` fires.
pub fn spawn_job_scheduler<S, X>(
    engine: Arc<Engine<S, X>>,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>>
where
    S: ExecutionStore + 'static,
    X: ActionExecutor + 'static,
{
    let interval_ms = engine.config().scheduler.poll_interval_ms;
    if interval_ms == 0 {
        tracing::info!("scheduled job polling disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("job scheduler stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match engine.process_scheduled_jobs(Utc::now()).await {
                        Ok(0) => {}
                        Ok(ran) => tracing::debug!(ran, "ran scheduled jobs"),
                        Err(e) => tracing::warn!(error = %e, "scheduled job poll failed"),
                    }
                }
            }
        }
    }))
}
