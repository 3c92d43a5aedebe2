//! Claim coordinator and stale-claim reaper.
//!
//! The coordinator is a worker's handle on the claim protocol: take the next
//! eligible job, start it, keep its lease alive, or hand it back untouched.
//! The reaper recovers claims whose holder stopped heartbeating.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::escalation::{EscalationEvent, EscalationNotifier};
use super::store::{JobStore, JobStoreError, ReapOutcome, SlotStore};
use super::telemetry::{TelemetrySink, TransitionEvent};
use super::types::{FailureCategory, Job, JobId, JobState, Queue, WorkerId};

/// Claim protocol bound to one worker identity.
#[derive(Clone)]
pub struct ClaimCoordinator {
    store: Arc<dyn JobStore>,
    worker: WorkerId,
    telemetry: Arc<dyn TelemetrySink>,
}

impl ClaimCoordinator {
    pub fn new(store: Arc<dyn JobStore>, worker: WorkerId, telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            store,
            worker,
            telemetry,
        }
    }

    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    /// Claim the oldest eligible job of `queue`, if any.
    pub async fn claim_next(
        &self,
        queue: Queue,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let claimed = self.store.claim_next(queue, &self.worker, now).await?;
        if let Some(job) = &claimed {
            self.telemetry
                .transition(&TransitionEvent::for_job(job, JobState::Pending, JobState::Claimed));
            debug!(
                job_id = %job.id,
                job_type = %job.job_type,
                queue = %queue,
                attempt = job.attempt_count,
                worker = %self.worker,
                "job claimed"
            );
        }
        Ok(claimed)
    }

    /// CLAIMED -> RUNNING. False when the claim was lost in the meantime.
    pub async fn start(&self, job: &Job, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let started = self.store.mark_running(job.id, &self.worker, now).await?;
        if started {
            self.telemetry
                .transition(&TransitionEvent::for_job(job, JobState::Claimed, JobState::Running));
        } else {
            warn!(job_id = %job.id, worker = %self.worker, "claim lost before start");
        }
        Ok(started)
    }

    pub async fn heartbeat(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        self.store.heartbeat(id, &self.worker, now).await
    }

    /// Give a CLAIMED job back to PENDING until `run_after` without
    /// consuming its attempt.
    pub async fn release(&self, job: &Job, run_after: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let released = self.store.release(job.id, &self.worker, run_after).await?;
        if released {
            let mut event = TransitionEvent::for_job(job, JobState::Claimed, JobState::Pending)
                .with_category(FailureCategory::AdmissionDeferred);
            event.attempt = job.attempt_count.saturating_sub(1);
            self.telemetry.transition(&event);
            debug!(job_id = %job.id, run_after = %run_after, "claim released");
        }
        Ok(released)
    }
}

/// Summary of one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub reset: u32,
    pub buried: u32,
    pub slots_freed: u64,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.reset == 0 && self.buried == 0 && self.slots_freed == 0
    }
}

/// Recovers claims whose holder is presumed dead.
pub struct StaleClaimReaper {
    store: Arc<dyn JobStore>,
    slots: Arc<dyn SlotStore>,
    /// Resources whose leases are checked for orphans on every pass.
    resources: Vec<String>,
    liveness: Duration,
    batch_size: u32,
    notifier: Arc<dyn EscalationNotifier>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl StaleClaimReaper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        slots: Arc<dyn SlotStore>,
        resources: Vec<String>,
        liveness: Duration,
        batch_size: u32,
        notifier: Arc<dyn EscalationNotifier>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            store,
            slots,
            resources,
            liveness,
            batch_size,
            notifier,
            telemetry,
        }
    }

    /// One pass: reset or bury stale claims, then free orphaned leases.
    pub async fn reap(&self, now: DateTime<Utc>) -> Result<ReapReport, JobStoreError> {
        let liveness = chrono::Duration::from_std(self.liveness)
            .map_err(|e| JobStoreError::Storage(format!("liveness threshold out of range: {e}")))?;
        let locked_before = now - liveness;

        let mut report = ReapReport::default();
        for reaped in self
            .store
            .reap_stale(locked_before, now, self.batch_size)
            .await?
        {
            let job = &reaped.job;
            let from = reaped.previous;
            match reaped.outcome {
                ReapOutcome::Reset => {
                    report.reset += 1;
                    self.telemetry.transition(
                        &TransitionEvent::for_job(job, from, JobState::Pending)
                            .with_category(FailureCategory::StaleClaimRecovered),
                    );
                    info!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        queue = %job.queue,
                        attempt = job.attempt_count,
                        "stale claim recovered"
                    );
                }
                ReapOutcome::Exhausted => {
                    report.buried += 1;
                    self.telemetry.transition(
                        &TransitionEvent::for_job(job, from, JobState::Dead)
                            .with_category(FailureCategory::StaleClaimRecovered),
                    );
                    warn!(
                        job_id = %job.id,
                        job_type = %job.job_type,
                        attempts = job.attempt_count,
                        "stale claim had no attempts left; job is dead"
                    );
                    self.notifier
                        .escalate(EscalationEvent::from_dead_job(job))
                        .await;
                }
            }
        }

        for resource in &self.resources {
            report.slots_freed += self.slots.reclaim_orphaned_slots(resource).await?;
        }

        if !report.is_empty() {
            info!(
                reset = report.reset,
                buried = report.buried,
                slots_freed = report.slots_freed,
                "reaper pass"
            );
        }
        Ok(report)
    }
}
