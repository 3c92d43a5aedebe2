//! Job record store abstraction and the in-memory implementation.
//!
//! The store is the only shared mutable resource between workers. Every
//! state change is a conditional update (`WHERE state = … AND locked_by = …`)
//! whose boolean result tells the caller whether the transition applied.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::types::{
    AttemptRecord, FailureCategory, Job, JobId, JobState, LastError, Queue, WorkerId,
};

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result of a success report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    /// RUNNING -> SUCCEEDED applied.
    Completed,
    /// The job was already SUCCEEDED; nothing changed.
    AlreadySucceeded,
    /// The caller no longer holds the claim (e.g. it was reaped).
    NotHeld,
}

/// What the reaper did with one stale claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapOutcome {
    /// Reset to PENDING; claimable again.
    Reset,
    /// No attempts left; moved to DEAD.
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct ReapedJob {
    pub job: Job,
    /// State the claim was in when it was found stale.
    pub previous: JobState,
    pub outcome: ReapOutcome,
}

/// Per-queue counts by state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub claimed: u64,
    pub running: u64,
    pub succeeded: u64,
    pub dead: u64,
}

impl QueueStats {
    pub(crate) fn add(&mut self, state: JobState, n: u64) {
        match state {
            JobState::Pending => self.pending += n,
            JobState::Claimed => self.claimed += n,
            JobState::Running => self.running += n,
            JobState::Succeeded => self.succeeded += n,
            JobState::Dead => self.dead += n,
            JobState::Failed => {}
        }
    }
}

/// Job statistics across queues.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queues: BTreeMap<Queue, QueueStats>,
}

impl JobStats {
    pub fn queue(&self, queue: Queue) -> QueueStats {
        self.queues.get(&queue).cloned().unwrap_or_default()
    }
}

/// Durable job table.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job record.
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Atomically claim the oldest eligible job in `queue`.
    ///
    /// Eligible means `state = PENDING AND run_after <= now` with attempts
    /// left, ordered by `run_after` then `id`. Rows locked by a concurrent
    /// claim are skipped rather than waited on. The claimed job comes back
    /// CLAIMED, locked by `worker`, with `attempt_count` incremented.
    async fn claim_next(
        &self,
        queue: Queue,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// CLAIMED -> RUNNING, only if `worker` holds the claim.
    async fn mark_running(
        &self,
        id: JobId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// Refresh `locked_at` of a claim held by `worker`.
    async fn heartbeat(
        &self,
        id: JobId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// RUNNING -> SUCCEEDED; clears `last_error` and stamps `completed_at`.
    async fn complete(
        &self,
        id: JobId,
        worker: &WorkerId,
        record: AttemptRecord,
        now: DateTime<Utc>,
    ) -> Result<CompleteOutcome, JobStoreError>;

    /// RUNNING -> PENDING with a later `run_after` (never moved backwards).
    async fn reschedule(
        &self,
        id: JobId,
        worker: &WorkerId,
        run_after: DateTime<Utc>,
        error: LastError,
        record: AttemptRecord,
    ) -> Result<bool, JobStoreError>;

    /// RUNNING -> DEAD. Returns the dead record when the transition applied.
    async fn bury(
        &self,
        id: JobId,
        worker: &WorkerId,
        error: LastError,
        record: AttemptRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// CLAIMED -> PENDING without consuming an attempt (governor deferral).
    async fn release(
        &self,
        id: JobId,
        worker: &WorkerId,
        run_after: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// Reset claims whose `locked_at` is older than `locked_before`.
    async fn reap_stale(
        &self,
        locked_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ReapedJob>, JobStoreError>;

    /// CLAIMED + RUNNING jobs in `queue`, across all workers.
    async fn count_in_flight(&self, queue: Queue) -> Result<u32, JobStoreError>;

    /// Push every PENDING job of `job_types` to at least `until`.
    async fn defer_pending(
        &self,
        job_types: &[String],
        until: DateTime<Utc>,
    ) -> Result<u64, JobStoreError>;

    /// Jobs in `state`, oldest first.
    async fn list_by_state(&self, state: JobState, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Leased slots backing a distributed counting semaphore.
#[async_trait]
pub trait SlotStore: Send + Sync {
    /// Make sure slots `0..capacity` exist for `resource`.
    async fn ensure_slots(&self, resource: &str, capacity: u32) -> Result<(), JobStoreError>;

    /// Lease a free slot below `capacity` to `holder`. `lease` names this
    /// acquisition and must be unique per call.
    async fn try_acquire_slot(
        &self,
        resource: &str,
        capacity: u32,
        holder: JobId,
        lease: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>, JobStoreError>;

    /// Free `slot` only while it is still held under `lease`.
    ///
    /// A job re-claimed after a stale claim can land on the same slot, so the
    /// holder id alone does not tell two acquisitions apart.
    async fn release_slot(
        &self,
        resource: &str,
        slot: u32,
        lease: Uuid,
    ) -> Result<bool, JobStoreError>;

    async fn slots_in_use(&self, resource: &str) -> Result<u32, JobStoreError>;

    /// Free leases whose holder is no longer CLAIMED or RUNNING.
    async fn reclaim_orphaned_slots(&self, resource: &str) -> Result<u64, JobStoreError>;
}

/// Budget alert thresholds tracked per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetThreshold {
    /// 90% of the ceiling.
    Warning,
    /// 100% of the ceiling.
    Exhausted,
}

impl BudgetThreshold {
    pub fn ratio(&self) -> f64 {
        match self {
            BudgetThreshold::Warning => 0.90,
            BudgetThreshold::Exhausted => 1.00,
        }
    }
}

/// Running cost total of the current billing window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetLedger {
    pub key: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub spent_micros: u64,
    pub warning_alert_sent: bool,
    pub exhausted_alert_sent: bool,
}

impl BudgetLedger {
    pub fn open(key: impl Into<String>, period_start: DateTime<Utc>, period_end: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            period_start,
            period_end,
            spent_micros: 0,
            warning_alert_sent: false,
            exhausted_alert_sent: false,
        }
    }

    pub fn alert_sent(&self, threshold: BudgetThreshold) -> bool {
        match threshold {
            BudgetThreshold::Warning => self.warning_alert_sent,
            BudgetThreshold::Exhausted => self.exhausted_alert_sent,
        }
    }
}

/// Budget ledger table.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Load the ledger, creating it for the given period when absent.
    async fn open_ledger(
        &self,
        key: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<BudgetLedger, JobStoreError>;

    /// Start a new cycle if the ledger is still on `expected_start`.
    async fn roll_ledger(
        &self,
        key: &str,
        expected_start: DateTime<Utc>,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// Atomically add to the spent counter; returns the new total.
    async fn add_spend(&self, key: &str, amount_micros: u64) -> Result<u64, JobStoreError>;

    /// Flip the alert flag for `threshold` in the cycle starting at
    /// `period_start`. True only for the caller that flipped it.
    async fn mark_alert_sent(
        &self,
        key: &str,
        period_start: DateTime<Utc>,
        threshold: BudgetThreshold,
    ) -> Result<bool, JobStoreError>;
}

#[derive(Debug, Clone, Copy)]
struct SlotLease {
    holder: JobId,
    lease: Uuid,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    slots: HashMap<String, BTreeMap<u32, Option<SlotLease>>>,
    ledgers: HashMap<String, BudgetLedger>,
}

/// In-memory store for tests/dev.
///
/// A single mutex is the atomicity boundary, which gives the same guarantees
/// as the row-level locking of the Postgres store.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, JobStoreError> {
        self.inner
            .lock()
            .map_err(|_| JobStoreError::Storage("in-memory store lock poisoned".to_string()))
    }
}

fn held_in<'a>(
    inner: &'a mut Inner,
    id: JobId,
    worker: &WorkerId,
    state: JobState,
) -> Result<Option<&'a mut Job>, JobStoreError> {
    let job = inner.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
    if job.state == state && job.locked_by.as_ref() == Some(worker) {
        Ok(Some(job))
    } else {
        Ok(None)
    }
}

/// Move `job` to `next`. Every store write goes through the lifecycle table.
fn advance(job: &mut Job, next: JobState) {
    debug_assert!(
        job.state.can_transition_to(next),
        "illegal transition {} -> {} for job {}",
        job.state,
        next,
        job.id
    );
    job.state = next;
}

fn unlock(job: &mut Job) {
    job.locked_by = None;
    job.locked_at = None;
}

/// Reset a stale in-flight claim in place: back to PENDING, or DEAD when no
/// attempts are left. The abandoned attempt is recorded in the history.
pub(crate) fn recover_stale_claim(job: &mut Job, now: DateTime<Utc>) -> ReapedJob {
    let previous = job.state;
    let locked_at = job.locked_at.unwrap_or(now);
    let error = LastError::new(
        FailureCategory::StaleClaimRecovered,
        format!("claim went stale (locked_at {locked_at})"),
    );
    if let Some(holder) = job.locked_by.clone() {
        job.history.push(AttemptRecord::failed(
            job.attempt_count,
            holder,
            locked_at,
            now,
            error.clone(),
        ));
    }
    let outcome = if job.attempts_exhausted() {
        advance(job, JobState::Dead);
        job.completed_at = Some(now);
        job.first_failed_at.get_or_insert(now);
        ReapOutcome::Exhausted
    } else {
        advance(job, JobState::Pending);
        ReapOutcome::Reset
    };
    job.last_error = Some(error);
    unlock(job);
    ReapedJob {
        job: job.clone(),
        previous,
        outcome,
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut inner = self.lock()?;
        if inner.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        inner.jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.lock()?.jobs.get(&id).cloned())
    }

    async fn claim_next(
        &self,
        queue: Queue,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut inner = self.lock()?;

        let next = inner
            .jobs
            .values()
            .filter(|j| j.queue == queue && j.is_claimable(now))
            .min_by_key(|j| (j.run_after, j.id))
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        advance(job, JobState::Claimed);
        job.locked_by = Some(worker.clone());
        job.locked_at = Some(now);
        job.attempt_count += 1;
        Ok(Some(job.clone()))
    }

    async fn mark_running(
        &self,
        id: JobId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let mut inner = self.lock()?;
        match held_in(&mut inner, id, worker, JobState::Claimed)? {
            Some(job) => {
                advance(job, JobState::Running);
                job.locked_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn heartbeat(
        &self,
        id: JobId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let mut inner = self.lock()?;
        let job = inner.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if job.is_held_by(worker) {
            job.locked_at = Some(now);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn complete(
        &self,
        id: JobId,
        worker: &WorkerId,
        record: AttemptRecord,
        now: DateTime<Utc>,
    ) -> Result<CompleteOutcome, JobStoreError> {
        let mut inner = self.lock()?;
        let job = inner.jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;

        if job.state == JobState::Succeeded {
            return Ok(CompleteOutcome::AlreadySucceeded);
        }
        if job.state != JobState::Running || job.locked_by.as_ref() != Some(worker) {
            return Ok(CompleteOutcome::NotHeld);
        }

        advance(job, JobState::Succeeded);
        job.completed_at = Some(now);
        job.last_error = None;
        job.history.push(record);
        unlock(job);
        Ok(CompleteOutcome::Completed)
    }

    async fn reschedule(
        &self,
        id: JobId,
        worker: &WorkerId,
        run_after: DateTime<Utc>,
        error: LastError,
        record: AttemptRecord,
    ) -> Result<bool, JobStoreError> {
        let mut inner = self.lock()?;
        match held_in(&mut inner, id, worker, JobState::Running)? {
            Some(job) => {
                advance(job, JobState::Pending);
                job.run_after = job.run_after.max(run_after);
                job.first_failed_at.get_or_insert(record.finished_at);
                job.last_error = Some(error);
                job.history.push(record);
                unlock(job);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn bury(
        &self,
        id: JobId,
        worker: &WorkerId,
        error: LastError,
        record: AttemptRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut inner = self.lock()?;
        match held_in(&mut inner, id, worker, JobState::Running)? {
            Some(job) => {
                advance(job, JobState::Dead);
                job.completed_at = Some(now);
                job.first_failed_at.get_or_insert(record.finished_at);
                job.last_error = Some(error);
                job.history.push(record);
                unlock(job);
                Ok(Some(job.clone()))
            }
            None => Ok(None),
        }
    }

    async fn release(
        &self,
        id: JobId,
        worker: &WorkerId,
        run_after: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let mut inner = self.lock()?;
        match held_in(&mut inner, id, worker, JobState::Claimed)? {
            Some(job) => {
                advance(job, JobState::Pending);
                job.attempt_count = job.attempt_count.saturating_sub(1);
                job.run_after = job.run_after.max(run_after);
                unlock(job);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reap_stale(
        &self,
        locked_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ReapedJob>, JobStoreError> {
        let mut inner = self.lock()?;

        let mut stale: Vec<(DateTime<Utc>, JobId)> = inner
            .jobs
            .values()
            .filter(|j| j.state.is_in_flight())
            .filter_map(|j| j.locked_at.filter(|at| *at < locked_before).map(|at| (at, j.id)))
            .collect();
        stale.sort();
        stale.truncate(limit as usize);

        let mut reaped = Vec::with_capacity(stale.len());
        for (_, id) in stale {
            if let Some(job) = inner.jobs.get_mut(&id) {
                reaped.push(recover_stale_claim(job, now));
            }
        }
        Ok(reaped)
    }

    async fn count_in_flight(&self, queue: Queue) -> Result<u32, JobStoreError> {
        let inner = self.lock()?;
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.queue == queue && j.state.is_in_flight())
            .count() as u32)
    }

    async fn defer_pending(
        &self,
        job_types: &[String],
        until: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let mut inner = self.lock()?;
        let mut moved = 0;
        for job in inner.jobs.values_mut() {
            if job.state == JobState::Pending
                && job.run_after < until
                && job_types.iter().any(|t| t == &job.job_type)
            {
                job.run_after = until;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn list_by_state(&self, state: JobState, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.lock()?;
        let mut jobs: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| j.state == state)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let inner = self.lock()?;
        let mut stats = JobStats::default();
        for job in inner.jobs.values() {
            stats.queues.entry(job.queue).or_default().add(job.state, 1);
        }
        Ok(stats)
    }
}

#[async_trait]
impl SlotStore for InMemoryJobStore {
    async fn ensure_slots(&self, resource: &str, capacity: u32) -> Result<(), JobStoreError> {
        let mut inner = self.lock()?;
        let slots = inner.slots.entry(resource.to_string()).or_default();
        for slot in 0..capacity {
            slots.entry(slot).or_insert(None);
        }
        Ok(())
    }

    async fn try_acquire_slot(
        &self,
        resource: &str,
        capacity: u32,
        holder: JobId,
        lease: Uuid,
        _now: DateTime<Utc>,
    ) -> Result<Option<u32>, JobStoreError> {
        let mut inner = self.lock()?;
        let Some(slots) = inner.slots.get_mut(resource) else {
            return Ok(None);
        };
        let free = slots
            .iter()
            .find(|(slot, h)| **slot < capacity && h.is_none())
            .map(|(slot, _)| *slot);
        if let Some(slot) = free {
            slots.insert(slot, Some(SlotLease { holder, lease }));
        }
        Ok(free)
    }

    async fn release_slot(
        &self,
        resource: &str,
        slot: u32,
        lease: Uuid,
    ) -> Result<bool, JobStoreError> {
        let mut inner = self.lock()?;
        let Some(entry) = inner
            .slots
            .get_mut(resource)
            .and_then(|slots| slots.get_mut(&slot))
        else {
            return Ok(false);
        };
        if entry.map(|held| held.lease) != Some(lease) {
            return Ok(false);
        }
        *entry = None;
        Ok(true)
    }

    async fn slots_in_use(&self, resource: &str) -> Result<u32, JobStoreError> {
        let inner = self.lock()?;
        Ok(inner
            .slots
            .get(resource)
            .map(|s| s.values().filter(|h| h.is_some()).count() as u32)
            .unwrap_or(0))
    }

    async fn reclaim_orphaned_slots(&self, resource: &str) -> Result<u64, JobStoreError> {
        let mut guard = self.lock()?;
        let inner = &mut *guard;
        let Some(slots) = inner.slots.get_mut(resource) else {
            return Ok(0);
        };
        let mut freed = 0;
        for h in slots.values_mut() {
            if let Some(held) = *h {
                let live = inner
                    .jobs
                    .get(&held.holder)
                    .is_some_and(|j| j.state.is_in_flight());
                if !live {
                    *h = None;
                    freed += 1;
                }
            }
        }
        Ok(freed)
    }
}

#[async_trait]
impl LedgerStore for InMemoryJobStore {
    async fn open_ledger(
        &self,
        key: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<BudgetLedger, JobStoreError> {
        let mut inner = self.lock()?;
        Ok(inner
            .ledgers
            .entry(key.to_string())
            .or_insert_with(|| BudgetLedger::open(key, period_start, period_end))
            .clone())
    }

    async fn roll_ledger(
        &self,
        key: &str,
        expected_start: DateTime<Utc>,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let mut inner = self.lock()?;
        match inner.ledgers.get_mut(key) {
            Some(ledger) if ledger.period_start == expected_start => {
                *ledger = BudgetLedger::open(key, period_start, period_end);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn add_spend(&self, key: &str, amount_micros: u64) -> Result<u64, JobStoreError> {
        let mut inner = self.lock()?;
        let ledger = inner
            .ledgers
            .get_mut(key)
            .ok_or_else(|| JobStoreError::Storage(format!("ledger {key} not opened")))?;
        ledger.spent_micros = ledger.spent_micros.saturating_add(amount_micros);
        Ok(ledger.spent_micros)
    }

    async fn mark_alert_sent(
        &self,
        key: &str,
        period_start: DateTime<Utc>,
        threshold: BudgetThreshold,
    ) -> Result<bool, JobStoreError> {
        let mut inner = self.lock()?;
        let Some(ledger) = inner.ledgers.get_mut(key) else {
            return Ok(false);
        };
        if ledger.period_start != period_start || ledger.alert_sent(threshold) {
            return Ok(false);
        }
        match threshold {
            BudgetThreshold::Warning => ledger.warning_alert_sent = true,
            BudgetThreshold::Exhausted => ledger.exhausted_alert_sent = true,
        }
        Ok(true)
    }
}
