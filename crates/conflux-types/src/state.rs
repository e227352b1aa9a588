//! Execution state vocabulary shared by workflow, task and action executions.
//!
//! Every coordinator mutation consults [`is_valid_transition`] before it
//! writes a new state. The table is the same for all three execution kinds.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of any execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Idle,
    Waiting,
    Running,
    RunningDelayed,
    Paused,
    Success,
    Cancelled,
    Error,
    Skipped,
}

impl ExecutionState {
    pub const ALL: [ExecutionState; 9] = [
        ExecutionState::Idle,
        ExecutionState::Waiting,
        ExecutionState::Running,
        ExecutionState::RunningDelayed,
        ExecutionState::Paused,
        ExecutionState::Success,
        ExecutionState::Cancelled,
        ExecutionState::Error,
        ExecutionState::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Idle => "IDLE",
            ExecutionState::Waiting => "WAITING",
            ExecutionState::Running => "RUNNING",
            ExecutionState::RunningDelayed => "RUNNING_DELAYED",
            ExecutionState::Paused => "PAUSED",
            ExecutionState::Success => "SUCCESS",
            ExecutionState::Cancelled => "CANCELLED",
            ExecutionState::Error => "ERROR",
            ExecutionState::Skipped => "SKIPPED",
        }
    }

    /// States reachable from `self` in one step (self-transition excluded).
    pub fn allowed_transitions(self) -> &'static [ExecutionState] {
        use ExecutionState::*;

        match self {
            Idle => &[Running, Error, Cancelled],
            Waiting => &[Running],
            Running => &[Paused, RunningDelayed, Success, Error, Cancelled],
            RunningDelayed => &[Running, Error, Cancelled],
            Paused => &[Running, Error, Cancelled],
            Error => &[Running, Skipped],
            Success | Cancelled | Skipped => &[],
        }
    }

    pub fn can_transition_to(self, to: ExecutionState) -> bool {
        self == to || self.allowed_transitions().contains(&to)
    }

    /// Terminal for completion counting: SUCCESS, ERROR, CANCELLED, SKIPPED.
    pub fn is_completed(self) -> bool {
        matches!(
            self,
            ExecutionState::Success
                | ExecutionState::Error
                | ExecutionState::Cancelled
                | ExecutionState::Skipped
        )
    }

    pub fn is_running(self) -> bool {
        matches!(self, ExecutionState::Running | ExecutionState::RunningDelayed)
    }

    pub fn is_paused_or_idle(self) -> bool {
        matches!(self, ExecutionState::Paused | ExecutionState::Idle)
    }

    pub fn is_paused_or_completed(self) -> bool {
        self == ExecutionState::Paused || self.is_completed()
    }
}

/// Whether an execution may move from `from` to `to`.
pub fn is_valid_transition(from: ExecutionState, to: ExecutionState) -> bool {
    from.can_transition_to(to)
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase();
        ExecutionState::ALL
            .into_iter()
            .find(|state| state.as_str() == normalized)
            .ok_or_else(|| format!("invalid execution state: '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionState::*;

    #[test]
    fn self_transition_is_always_valid() {
        for state in ExecutionState::ALL {
            assert!(is_valid_transition(state, state), "{state} -> {state}");
        }
    }

    #[test]
    fn table_entries() {
        assert!(is_valid_transition(Idle, Running));
        assert!(is_valid_transition(Idle, Cancelled));
        assert!(is_valid_transition(Waiting, Running));
        assert!(is_valid_transition(Running, RunningDelayed));
        assert!(is_valid_transition(RunningDelayed, Running));
        assert!(is_valid_transition(Paused, Running));
        assert!(is_valid_transition(Error, Skipped));

        assert!(!is_valid_transition(Idle, Success));
        assert!(!is_valid_transition(Waiting, Error));
        assert!(!is_valid_transition(Paused, Success));
        assert!(!is_valid_transition(Skipped, Error));
    }

    #[test]
    fn error_and_running_go_both_ways() {
        assert!(is_valid_transition(Running, Error));
        assert!(is_valid_transition(Error, Running));
    }

    #[test]
    fn success_cancelled_skipped_are_final() {
        for from in [Success, Cancelled, Skipped] {
            for to in ExecutionState::ALL {
                if to != from {
                    assert!(!is_valid_transition(from, to), "{from} -> {to}");
                }
            }
        }
    }

    #[test]
    fn one_directional_unless_listed_both_ways() {
        for from in ExecutionState::ALL {
            for &to in from.allowed_transitions() {
                let reverse = to.allowed_transitions().contains(&from);
                let listed_both_ways = matches!(
                    (from, to),
                    (Running, Error)
                        | (Error, Running)
                        | (Running, Paused)
                        | (Paused, Running)
                        | (Running, RunningDelayed)
                        | (RunningDelayed, Running)
                );
                assert_eq!(reverse, listed_both_ways, "{from} <-> {to}");
            }
        }
    }

    #[test]
    fn completion_and_running_helpers() {
        let completed: Vec<_> = ExecutionState::ALL
            .into_iter()
            .filter(|s| s.is_completed())
            .collect();
        assert_eq!(completed, vec![Success, Cancelled, Error, Skipped]);

        assert!(Running.is_running());
        assert!(RunningDelayed.is_running());
        assert!(!Paused.is_running());
        assert!(Idle.is_paused_or_idle());
        assert!(Error.is_paused_or_completed());
    }

    #[test]
    fn display_and_parse() {
        assert_eq!(RunningDelayed.to_string(), "RUNNING_DELAYED");
        assert_eq!("running_delayed".parse::<ExecutionState>().unwrap(), RunningDelayed);
        assert!("FINISHED".parse::<ExecutionState>().is_err());
    }

    #[test]
    fn serde_uses_upper_snake_case() {
        let json = serde_json::to_string(&RunningDelayed).unwrap();
        assert_eq!(json, "\"RUNNING_DELAYED\"");
        let state: ExecutionState = serde_json::from_str("\"SKIPPED\"").unwrap();
        assert_eq!(state, Skipped);
    }
}
