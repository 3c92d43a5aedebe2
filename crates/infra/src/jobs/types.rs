//! Core job record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use portaljobs_core::{JobId, JobState, Queue, WorkerId};

/// Failure taxonomy stamped into `last_error` and telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCategory {
    /// Network/timeout error from a handler; retried with backoff.
    TransientFailure,
    /// The input can never succeed; goes straight to DEAD.
    PermanentFailure,
    /// A governor sent the job back to PENDING. Not a failure.
    AdmissionDeferred,
    /// The reaper reset a claim whose holder stopped heartbeating.
    StaleClaimRecovered,
    /// Submission-time rejection of an unregistered job type.
    InvalidJobType,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::TransientFailure => "TRANSIENT_FAILURE",
            FailureCategory::PermanentFailure => "PERMANENT_FAILURE",
            FailureCategory::AdmissionDeferred => "ADMISSION_DEFERRED",
            FailureCategory::StaleClaimRecovered => "STALE_CLAIM_RECOVERED",
            FailureCategory::InvalidJobType => "INVALID_JOB_TYPE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TRANSIENT_FAILURE" => Some(FailureCategory::TransientFailure),
            "PERMANENT_FAILURE" => Some(FailureCategory::PermanentFailure),
            "ADMISSION_DEFERRED" => Some(FailureCategory::AdmissionDeferred),
            "STALE_CLAIM_RECOVERED" => Some(FailureCategory::StaleClaimRecovered),
            "INVALID_JOB_TYPE" => Some(FailureCategory::InvalidJobType),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last failure detail of a job, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub category: FailureCategory,
    pub message: String,
}

impl LastError {
    pub fn new(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

/// Typed error surfaced by a job handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Retry per the backoff policy.
    #[error("transient failure: {0}")]
    Transient(String),
    /// Never retry; the job goes to DEAD with escalation.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn category(&self) -> FailureCategory {
        match self {
            HandlerError::Transient(_) => FailureCategory::TransientFailure,
            HandlerError::Permanent(_) => FailureCategory::PermanentFailure,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            HandlerError::Transient(m) | HandlerError::Permanent(m) => m,
        }
    }

    pub fn to_last_error(&self) -> LastError {
        LastError::new(self.category(), self.message())
    }
}

/// Successful handler result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutput {
    /// Metered cost incurred by this execution, in micro-units of currency.
    pub cost_micros: u64,
}

impl JobOutput {
    pub fn with_cost(cost_micros: u64) -> Self {
        Self { cost_micros }
    }
}

/// Record of a finished execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub worker: WorkerId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<LastError>,
    pub duration_ms: u64,
}

impl AttemptRecord {
    pub fn succeeded(
        attempt: u32,
        worker: WorkerId,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            attempt,
            worker,
            started_at,
            finished_at,
            success: true,
            error: None,
            duration_ms: duration_ms(started_at, finished_at),
        }
    }

    pub fn failed(
        attempt: u32,
        worker: WorkerId,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        error: LastError,
    ) -> Self {
        Self {
            attempt,
            worker,
            started_at,
            finished_at,
            success: false,
            error: Some(error),
            duration_ms: duration_ms(started_at, finished_at),
        }
    }
}

fn duration_ms(started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> u64 {
    (finished_at - started_at).num_milliseconds().max(0) as u64
}

/// Routing decision made once at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub queue: Queue,
    pub max_attempts: u32,
    pub priority_weight: u32,
}

/// A durable job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: Queue,
    /// Key resolved against the handler registry.
    pub job_type: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    /// Incremented on each claim.
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub priority_weight: u32,
    /// Not claimable before this instant.
    pub run_after: DateTime<Utc>,
    pub locked_by: Option<WorkerId>,
    pub locked_at: Option<DateTime<Utc>>,
    pub last_error: Option<LastError>,
    pub created_at: DateTime<Utc>,
    /// Stamped on SUCCEEDED and DEAD.
    pub completed_at: Option<DateTime<Utc>>,
    pub first_failed_at: Option<DateTime<Utc>>,
    pub history: Vec<AttemptRecord>,
}

impl Job {
    /// Create a new PENDING job.
    pub fn new(
        job_type: impl Into<String>,
        payload: serde_json::Value,
        route: Route,
        run_after: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            queue: route.queue,
            job_type: job_type.into(),
            payload,
            state: JobState::Pending,
            attempt_count: 0,
            max_attempts: route.max_attempts,
            priority_weight: route.priority_weight,
            run_after,
            locked_by: None,
            locked_at: None,
            last_error: None,
            created_at: now,
            completed_at: None,
            first_failed_at: None,
            history: Vec::new(),
        }
    }

    /// Eligible for claim at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending
            && self.run_after <= now
            && self.attempt_count < self.max_attempts
    }

    /// Held by `worker` in one of the in-flight states.
    pub fn is_held_by(&self, worker: &WorkerId) -> bool {
        self.state.is_in_flight() && self.locked_by.as_ref() == Some(worker)
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn route() -> Route {
        Route {
            queue: Queue::Default,
            max_attempts: 3,
            priority_weight: 4,
        }
    }

    #[test]
    fn new_job_is_pending_and_unlocked() {
        let now = Utc::now();
        let job = Job::new("feed.refresh", serde_json::json!({"feed": 1}), route(), now, now);

        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempt_count, 0);
        assert!(job.locked_by.is_none());
        assert!(job.is_claimable(now));
    }

    #[test]
    fn delayed_job_is_not_claimable_early() {
        let now = Utc::now();
        let job = Job::new(
            "feed.refresh",
            serde_json::json!({}),
            route(),
            now + Duration::seconds(30),
            now,
        );
        assert!(!job.is_claimable(now));
        assert!(job.is_claimable(now + Duration::seconds(30)));
    }

    #[test]
    fn exhausted_job_is_not_claimable() {
        let now = Utc::now();
        let mut job = Job::new("feed.refresh", serde_json::json!({}), route(), now, now);
        job.attempt_count = 3;
        assert!(job.attempts_exhausted());
        assert!(!job.is_claimable(now));
    }

    #[test]
    fn handler_error_categories() {
        assert_eq!(
            HandlerError::transient("timeout").category(),
            FailureCategory::TransientFailure
        );
        let last = HandlerError::permanent("bad url").to_last_error();
        assert_eq!(last.category, FailureCategory::PermanentFailure);
        assert_eq!(last.message, "bad url");
    }

    #[test]
    fn failure_category_round_trips() {
        for c in [
            FailureCategory::TransientFailure,
            FailureCategory::PermanentFailure,
            FailureCategory::AdmissionDeferred,
            FailureCategory::StaleClaimRecovered,
            FailureCategory::InvalidJobType,
        ] {
            assert_eq!(FailureCategory::parse(c.as_str()), Some(c));
        }
    }

    #[test]
    fn attempt_duration_never_negative() {
        let now = Utc::now();
        let worker = WorkerId::new("w").unwrap();
        let rec = AttemptRecord::succeeded(1, worker, now, now - Duration::seconds(1));
        assert_eq!(rec.duration_ms, 0);
    }
}
