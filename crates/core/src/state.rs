//! Job lifecycle state machine.
//!
//! ```text
//! PENDING -> CLAIMED -> RUNNING -> SUCCEEDED
//!    ^          |           |---> PENDING   (retry / stale claim reset)
//!    |----------|           |---> DEAD      (retries exhausted / permanent failure)
//!  (governor release, stale claim reset)
//! ```
//!
//! The reaper may also move a stale `CLAIMED` job straight to `DEAD` when its
//! attempts are already exhausted.
//!
//! `FAILED` is part of the persisted vocabulary but the engine never assigns
//! it: a failed attempt lands directly in `PENDING` (retry) or `DEAD`.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Persisted state of a job record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Claimed,
    Running,
    Succeeded,
    Failed,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Claimed => "CLAIMED",
            JobState::Running => "RUNNING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
            JobState::Dead => "DEAD",
        }
    }

    /// No further transitions leave this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Dead)
    }

    /// A worker currently holds a claim on the job.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, JobState::Claimed | JobState::Running)
    }

    /// Whether `self -> next` is a legal lifecycle transition.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Claimed)
                | (Claimed, Running)
                | (Claimed, Pending)
                // stale claim with no attempts left
                | (Claimed, Dead)
                | (Running, Succeeded)
                | (Running, Pending)
                | (Running, Dead)
        )
    }

    /// Validate a transition, returning the target state.
    pub fn transition(&self, next: JobState) -> Result<JobState, DomainError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DomainError::IllegalTransition {
                from: *self,
                to: next,
            })
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobState::Pending),
            "CLAIMED" => Ok(JobState::Claimed),
            "RUNNING" => Ok(JobState::Running),
            "SUCCEEDED" => Ok(JobState::Succeeded),
            "FAILED" => Ok(JobState::Failed),
            "DEAD" => Ok(JobState::Dead),
            _ => Err(DomainError::UnknownState(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALL: [JobState; 6] = [
        JobState::Pending,
        JobState::Claimed,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Dead,
    ];

    #[test]
    fn happy_path_is_legal() {
        assert!(JobState::Pending.can_transition_to(JobState::Claimed));
        assert!(JobState::Claimed.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Succeeded));
    }

    #[test]
    fn retry_and_dead_paths_are_legal() {
        assert!(JobState::Running.can_transition_to(JobState::Pending));
        assert!(JobState::Running.can_transition_to(JobState::Dead));
    }

    #[test]
    fn skipping_claim_is_illegal() {
        let err = JobState::Pending.transition(JobState::Running).unwrap_err();
        assert_eq!(
            err,
            DomainError::IllegalTransition {
                from: JobState::Pending,
                to: JobState::Running
            }
        );
    }

    #[test]
    fn nothing_enters_failed() {
        for s in ALL {
            assert!(!s.can_transition_to(JobState::Failed));
        }
    }

    proptest! {
        /// Property: terminal states never transition anywhere.
        #[test]
        fn terminal_states_are_sinks(from in 0usize..6, to in 0usize..6) {
            let from = ALL[from];
            if from.is_terminal() {
                prop_assert!(!from.can_transition_to(ALL[to]));
            }
        }

        /// Property: state names round-trip through the persisted form.
        #[test]
        fn state_names_round_trip(idx in 0usize..6) {
            let s = ALL[idx];
            prop_assert_eq!(s.as_str().parse::<JobState>().unwrap(), s);
        }
    }
}
