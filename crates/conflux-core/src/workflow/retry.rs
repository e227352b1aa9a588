//! Retry decisions.
//!
//! Transactions that fail with a transient storage error (lock contention,
//! deadlock, serialization failure) are re-run from scratch with exponential
//! backoff. Any other error is surfaced immediately.
//!
//! Task runs are retried according to the task's `retry` policy, driven by
//! the task coordinator.

use std::time::Duration;

use conflux_types::config::TransactionConfig;
use conflux_types::definition::RetrySpec;
use conflux_types::state::ExecutionState;

/// Stateless retry decisions for transaction attempts and task runs.
///
/// No internal state; all logic is in associated functions that take the
/// configuration as a parameter.
pub struct RetryHandler;

impl RetryHandler {
    /// Determine whether another attempt should be made.
    ///
    /// `attempt` is 1-based (the first execution is attempt 1).
    pub fn should_retry(config: &TransactionConfig, attempt: u32, transient: bool) -> bool {
        transient && attempt < config.max_attempts
    }

    /// Delay before the attempt following `attempt`: `base * 2^(attempt - 1)`,
    /// capped at `max_delay_ms`.
    pub fn backoff_delay(config: &TransactionConfig, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = config
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(config.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Whether a task run that just ended in `state` goes round again.
    ///
    /// `retry_no` counts retries already made. A successful run is only
    /// retried while `continue-on` holds; once `continue-on` is set, a run
    /// where it no longer holds stops regardless of state. A failed run stops
    /// early when `break-on` holds.
    pub fn should_retry_task(
        spec: &RetrySpec,
        retry_no: u32,
        state: ExecutionState,
        break_on: bool,
        continue_on: Option<bool>,
    ) -> bool {
        if !matches!(state, ExecutionState::Success | ExecutionState::Error) {
            return false;
        }
        if retry_no >= spec.count {
            return false;
        }
        let stop = match continue_on {
            Some(holds) => !holds,
            None => state == ExecutionState::Success,
        };
        let broken = state == ExecutionState::Error && break_on;
        !(stop || broken)
    }
}
