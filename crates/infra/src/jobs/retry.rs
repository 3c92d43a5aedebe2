//! Retry policy engine: success/failure reports, backoff, and escalation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RetryConfig;

use super::escalation::{EscalationEvent, EscalationNotifier};
use super::store::{CompleteOutcome, JobStore, JobStoreError};
use super::telemetry::{TelemetrySink, TransitionEvent};
use super::types::{AttemptRecord, FailureCategory, HandlerError, Job, JobState, WorkerId};

/// Lower bound of the jitter factor.
pub const JITTER_MIN: f64 = 0.75;
/// Upper bound of the jitter factor.
pub const JITTER_MAX: f64 = 1.25;

/// `now + delay`, clamped to the latest representable instant.
pub(crate) fn later_by(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Base delay; attempt `n` waits roughly `base * 2^n`.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay after the failure of attempt `attempt_count`, for a given
    /// jitter factor (clamped to `[JITTER_MIN, JITTER_MAX]`).
    ///
    /// Jitter is applied before the cap, so the result never exceeds
    /// `max_delay`. Because `2 * JITTER_MIN > JITTER_MAX`, consecutive
    /// attempts never produce a shorter delay than the previous one.
    pub fn delay_with_jitter(&self, attempt_count: u32, jitter: f64) -> Duration {
        let jitter = jitter.clamp(JITTER_MIN, JITTER_MAX);
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let exp = 2_f64.powi(attempt_count.min(62) as i32);
        let delay_ms = (base_ms * exp * jitter).min(max_ms);

        Duration::from_millis(delay_ms.max(0.0) as u64)
    }

    /// Delay with a jitter factor drawn uniformly from `[0.75, 1.25]`.
    pub fn next_delay(&self, attempt_count: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
        self.delay_with_jitter(attempt_count, jitter)
    }

    /// Check if more attempts are allowed.
    pub fn should_retry(&self, attempt_count: u32, max_attempts: u32) -> bool {
        attempt_count < max_attempts
    }
}

/// Result of [`RetryEngine::on_success`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuccessOutcome {
    Completed,
    /// The job was already SUCCEEDED; nothing changed.
    NoOp,
    /// The claim was lost before the report (e.g. reaped).
    LostClaim,
}

/// Result of [`RetryEngine::on_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Rescheduled {
        run_after: DateTime<Utc>,
        delay: Duration,
    },
    Dead,
    LostClaim,
}

/// Applies execution outcomes to the store.
///
/// Only this engine and the claim coordinator mutate job state.
pub struct RetryEngine {
    store: Arc<dyn JobStore>,
    policy: RetryPolicy,
    notifier: Arc<dyn EscalationNotifier>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl RetryEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        policy: RetryPolicy,
        notifier: Arc<dyn EscalationNotifier>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            store,
            policy,
            notifier,
            telemetry,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// RUNNING -> SUCCEEDED. Repeating the call is a no-op.
    pub async fn on_success(
        &self,
        job: &Job,
        worker: &WorkerId,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<SuccessOutcome, JobStoreError> {
        let record = AttemptRecord::succeeded(job.attempt_count, worker.clone(), started_at, now);
        match self.store.complete(job.id, worker, record, now).await? {
            CompleteOutcome::Completed => {
                self.telemetry.transition(&TransitionEvent::for_job(
                    job,
                    JobState::Running,
                    JobState::Succeeded,
                ));
                debug!(job_id = %job.id, job_type = %job.job_type, "job succeeded");
                Ok(SuccessOutcome::Completed)
            }
            CompleteOutcome::AlreadySucceeded => Ok(SuccessOutcome::NoOp),
            CompleteOutcome::NotHeld => {
                warn!(job_id = %job.id, worker = %worker, "success reported without holding the claim");
                Ok(SuccessOutcome::LostClaim)
            }
        }
    }

    /// Reschedule with backoff, or move to DEAD and escalate.
    pub async fn on_failure(
        &self,
        job: &Job,
        worker: &WorkerId,
        error: &HandlerError,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, JobStoreError> {
        let last_error = error.to_last_error();
        let record = AttemptRecord::failed(
            job.attempt_count,
            worker.clone(),
            started_at,
            now,
            last_error.clone(),
        );

        let permanent = matches!(error, HandlerError::Permanent(_));
        if permanent || !self.policy.should_retry(job.attempt_count, job.max_attempts) {
            let Some(dead) = self.store.bury(job.id, worker, last_error, record, now).await? else {
                return Ok(FailureOutcome::LostClaim);
            };
            self.telemetry.transition(
                &TransitionEvent::for_job(&dead, JobState::Running, JobState::Dead)
                    .with_category(error.category()),
            );
            warn!(
                job_id = %dead.id,
                job_type = %dead.job_type,
                attempts = dead.attempt_count,
                permanent,
                "job moved to DEAD"
            );
            self.notifier
                .escalate(EscalationEvent::from_dead_job(&dead))
                .await;
            return Ok(FailureOutcome::Dead);
        }

        let delay = self.policy.next_delay(job.attempt_count);
        let run_after = later_by(now, delay);
        if !self
            .store
            .reschedule(job.id, worker, run_after, last_error, record)
            .await?
        {
            return Ok(FailureOutcome::LostClaim);
        }

        self.telemetry.transition(
            &TransitionEvent::for_job(job, JobState::Running, JobState::Pending)
                .with_category(FailureCategory::TransientFailure),
        );
        debug!(
            job_id = %job.id,
            attempt = job.attempt_count,
            delay_ms = delay.as_millis() as u64,
            "job rescheduled"
        );
        Ok(FailureOutcome::Rescheduled { run_after, delay })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::escalation::InMemoryNotifier;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::telemetry::InMemoryTelemetry;
    use crate::jobs::types::{Queue, Route};
    use proptest::prelude::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(10))
    }

    #[test]
    fn later_by_never_collapses_to_now() {
        let now = Utc::now();
        assert_eq!(
            later_by(now, Duration::from_millis(1_500)),
            now + chrono::Duration::milliseconds(1_500)
        );
        // Too large for chrono: clamp instead of retrying immediately.
        assert_eq!(later_by(now, Duration::MAX), DateTime::<Utc>::MAX_UTC);
        let huge = Duration::from_secs(i64::MAX as u64 / 1_000);
        assert_eq!(later_by(now, huge), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn backoff_doubles_without_jitter() {
        let p = policy();
        assert_eq!(p.delay_with_jitter(0, 1.0), Duration::from_millis(100));
        assert_eq!(p.delay_with_jitter(1, 1.0), Duration::from_millis(200));
        assert_eq!(p.delay_with_jitter(2, 1.0), Duration::from_millis(400));
        assert_eq!(p.delay_with_jitter(3, 1.0), Duration::from_millis(800));
    }

    #[test]
    fn backoff_is_capped() {
        let p = policy();
        assert_eq!(p.delay_with_jitter(20, 1.25), Duration::from_secs(10));
        assert_eq!(p.delay_with_jitter(u32::MAX, 1.0), Duration::from_secs(10));
    }

    #[test]
    fn jitter_factor_is_clamped() {
        let p = policy();
        assert_eq!(p.delay_with_jitter(0, 5.0), Duration::from_millis(125));
        assert_eq!(p.delay_with_jitter(0, 0.0), Duration::from_millis(75));
    }

    #[test]
    fn should_retry_respects_max_attempts() {
        let p = policy();
        assert!(p.should_retry(2, 3));
        assert!(!p.should_retry(3, 3));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: a drawn delay never exceeds the cap.
        #[test]
        fn delay_bounded_by_cap(attempt in 0u32..80, base_ms in 1u64..5_000, cap_ms in 5_000u64..600_000) {
            let p = RetryPolicy::new(Duration::from_millis(base_ms), Duration::from_millis(cap_ms));
            prop_assert!(p.next_delay(attempt) <= Duration::from_millis(cap_ms));
        }

        /// Property: consecutive failures never shorten the delay, whatever
        /// jitter each draw received.
        #[test]
        fn delay_monotone_across_attempts(
            attempt in 0u32..40,
            j1 in JITTER_MIN..=JITTER_MAX,
            j2 in JITTER_MIN..=JITTER_MAX,
        ) {
            let p = policy();
            prop_assert!(p.delay_with_jitter(attempt, j1) <= p.delay_with_jitter(attempt + 1, j2));
        }
    }

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        notifier: Arc<InMemoryNotifier>,
        telemetry: Arc<InMemoryTelemetry>,
        engine: RetryEngine,
        worker: WorkerId,
    }

    fn fixture() -> Fixture {
        let store = InMemoryJobStore::arc();
        let notifier = Arc::new(InMemoryNotifier::new());
        let telemetry = Arc::new(InMemoryTelemetry::new());
        let engine = RetryEngine::new(store.clone(), policy(), notifier.clone(), telemetry.clone());
        Fixture {
            store,
            notifier,
            telemetry,
            engine,
            worker: WorkerId::new("w1").unwrap(),
        }
    }

    async fn submit(f: &Fixture, max_attempts: u32, now: DateTime<Utc>) -> Job {
        let job = Job::new(
            "feed.refresh",
            serde_json::json!({}),
            Route {
                queue: Queue::Default,
                max_attempts,
                priority_weight: 1,
            },
            now,
            now,
        );
        f.store.insert(job.clone()).await.unwrap();
        job
    }

    async fn claim_and_start(f: &Fixture, now: DateTime<Utc>) -> Job {
        let job = f
            .store
            .claim_next(Queue::Default, &f.worker, now)
            .await
            .unwrap()
            .expect("job should be claimable");
        assert!(f.store.mark_running(job.id, &f.worker, now).await.unwrap());
        job
    }

    #[tokio::test]
    async fn three_failures_with_three_attempts_escalate_once() {
        let f = fixture();
        let mut now = Utc::now();
        let submitted = submit(&f, 3, now).await;
        let err = HandlerError::transient("upstream timeout");

        let mut previous_run_after = submitted.run_after;
        for attempt in 1..=3 {
            let job = claim_and_start(&f, now).await;
            assert_eq!(job.attempt_count, attempt);
            let outcome = f.engine.on_failure(&job, &f.worker, &err, now, now).await.unwrap();

            if attempt < 3 {
                let FailureOutcome::Rescheduled { run_after, .. } = outcome else {
                    panic!("expected reschedule, got {outcome:?}");
                };
                assert!(run_after >= previous_run_after);
                previous_run_after = run_after;
                now = run_after;
            } else {
                assert_eq!(outcome, FailureOutcome::Dead);
            }
        }

        let dead = f.store.get(submitted.id).await.unwrap().unwrap();
        assert_eq!(dead.state, JobState::Dead);
        assert_eq!(dead.attempt_count, 3);
        assert!(dead.completed_at.is_some());

        let escalations = f.notifier.escalations();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].job_id, submitted.id);
        assert_eq!(escalations[0].attempts, 3);
        assert_eq!(escalations[0].history.len(), 3);
        assert!(escalations[0].first_failed_at.is_some());
        assert_eq!(
            escalations[0].last_error.as_ref().unwrap().message,
            "upstream timeout"
        );

        // A duplicate failure report after DEAD is not escalated again.
        let stale = dead.clone();
        let again = f.engine.on_failure(&stale, &f.worker, &err, now, now).await.unwrap();
        assert_eq!(again, FailureOutcome::LostClaim);
        assert_eq!(f.notifier.escalations().len(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_skips_retry() {
        let f = fixture();
        let now = Utc::now();
        let submitted = submit(&f, 5, now).await;
        let job = claim_and_start(&f, now).await;

        let outcome = f
            .engine
            .on_failure(&job, &f.worker, &HandlerError::permanent("bad payload"), now, now)
            .await
            .unwrap();

        assert_eq!(outcome, FailureOutcome::Dead);
        let dead = f.store.get(submitted.id).await.unwrap().unwrap();
        assert_eq!(dead.attempt_count, 1);
        assert_eq!(
            dead.last_error.unwrap().category,
            FailureCategory::PermanentFailure
        );
        assert_eq!(f.notifier.escalations().len(), 1);
    }

    #[tokio::test]
    async fn success_clears_error_and_repeats_are_no_ops() {
        let f = fixture();
        let now = Utc::now();
        let submitted = submit(&f, 3, now).await;

        let job = claim_and_start(&f, now).await;
        f.engine
            .on_failure(&job, &f.worker, &HandlerError::transient("flaky"), now, now)
            .await
            .unwrap();

        let later = now + chrono::Duration::hours(2);
        let job = claim_and_start(&f, later).await;
        assert_eq!(
            f.engine.on_success(&job, &f.worker, later, later).await.unwrap(),
            SuccessOutcome::Completed
        );
        let done = f.store.get(submitted.id).await.unwrap().unwrap();

        assert_eq!(
            f.engine.on_success(&job, &f.worker, later, later).await.unwrap(),
            SuccessOutcome::NoOp
        );
        let after = f.store.get(submitted.id).await.unwrap().unwrap();

        assert_eq!(done, after);
        assert_eq!(after.state, JobState::Succeeded);
        assert!(after.last_error.is_none());
        assert_eq!(after.completed_at, Some(later));
        assert!(after.locked_by.is_none());

        let to_states: Vec<_> = f
            .telemetry
            .transitions_for(submitted.id)
            .into_iter()
            .map(|e| e.to)
            .collect();
        assert_eq!(to_states, vec![JobState::Pending, JobState::Succeeded]);
    }

    #[tokio::test]
    async fn failed_job_is_not_claimable_until_backoff_expires() {
        let f = fixture();
        let now = Utc::now();
        submit(&f, 3, now).await;
        let job = claim_and_start(&f, now).await;

        let FailureOutcome::Rescheduled { run_after, delay } = f
            .engine
            .on_failure(&job, &f.worker, &HandlerError::transient("503"), now, now)
            .await
            .unwrap()
        else {
            panic!("expected reschedule");
        };

        // attempt_count = 1 -> base * 2 = 200ms, jittered into [150, 250].
        assert!(delay >= Duration::from_millis(150) && delay <= Duration::from_millis(250));
        assert!(f
            .store
            .claim_next(Queue::Default, &f.worker, now)
            .await
            .unwrap()
            .is_none());
        assert!(f
            .store
            .claim_next(Queue::Default, &f.worker, run_after)
            .await
            .unwrap()
            .is_some());
    }
}
