//! Worker runtime: one polling loop per queue, a reaper loop, and a
//! dispatch task per claimed job.
//!
//! Dispatch of one job:
//!
//! 1. claim (CLAIMED, attempt counted)
//! 2. governors: SCREENSHOT semaphore, then the budget throttle for governed
//!    job types; a negative decision releases the claim
//! 3. start (RUNNING) and heartbeat while the handler runs
//! 4. handler outcome goes through the retry engine
//! 5. metered cost is added to the budget ledger, the slot is released
//!
//! Shutdown cancels one token: loops stop claiming, handlers see
//! `ctx.cancel`, and [`WorkerHandle::shutdown`] waits for every task.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;

use super::claim::{ClaimCoordinator, StaleClaimReaper};
use super::escalation::EscalationNotifier;
use super::governors::{BudgetDecision, BudgetThrottle, ConcurrencySemaphore, SlotPermit};
use super::producer::JobProducer;
use super::registry::{ExecutionContext, HandlerRegistry};
use super::retry::{FailureOutcome, RetryEngine, RetryPolicy, SuccessOutcome, later_by};
use super::router::QueueRouter;
use super::store::{JobStore, JobStoreError, LedgerStore, SlotStore};
use super::telemetry::{Governor, GovernorOutcome, TelemetrySink};
use super::types::{HandlerError, Job, JobId, JobOutput, Queue, WorkerId};

/// Collaborators a worker runs against.
#[derive(Clone)]
pub struct WorkerDeps {
    pub jobs: Arc<dyn JobStore>,
    pub slots: Arc<dyn SlotStore>,
    pub ledger: Arc<dyn LedgerStore>,
    pub registry: Arc<HandlerRegistry>,
    pub notifier: Arc<dyn EscalationNotifier>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

#[derive(Debug, Default)]
struct WorkerCounters {
    claimed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead: AtomicU64,
    deferred: AtomicU64,
    lost_claims: AtomicU64,
    handler_panics: AtomicU64,
    store_errors: AtomicU64,
    running: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub worker_id: String,
    pub jobs_claimed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_dead: u64,
    pub jobs_deferred: u64,
    pub lost_claims: u64,
    pub handler_panics: u64,
    pub store_errors: u64,
    pub current_running: u64,
    pub uptime_secs: u64,
}

struct Shared {
    jobs: Arc<dyn JobStore>,
    coordinator: ClaimCoordinator,
    router: Arc<QueueRouter>,
    registry: Arc<HandlerRegistry>,
    retry: RetryEngine,
    semaphore: ConcurrencySemaphore,
    semaphore_retry_after: Duration,
    budget: Arc<BudgetThrottle>,
    reaper: StaleClaimReaper,
    telemetry: Arc<dyn TelemetrySink>,
    queues: Vec<Queue>,
    heartbeat_interval: Duration,
    reaper_interval: Duration,
    store_backoff_max: Duration,
    counters: WorkerCounters,
    started: Instant,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// A configured, not yet running worker.
pub struct Worker {
    shared: Arc<Shared>,
}

impl Worker {
    pub fn new(config: &OrchestratorConfig, worker_id: WorkerId, deps: WorkerDeps) -> Self {
        let router = Arc::new(QueueRouter::new(config.queues.clone(), config.routes.clone()));
        let coordinator = ClaimCoordinator::new(deps.jobs.clone(), worker_id, deps.telemetry.clone());
        let retry = RetryEngine::new(
            deps.jobs.clone(),
            RetryPolicy::from(&config.retry),
            deps.notifier.clone(),
            deps.telemetry.clone(),
        );
        let semaphore = ConcurrencySemaphore::from_config(deps.slots.clone(), &config.screenshot);
        let budget = Arc::new(BudgetThrottle::new(
            deps.ledger.clone(),
            deps.jobs.clone(),
            deps.notifier.clone(),
            config.budget.clone(),
        ));
        let reaper = StaleClaimReaper::new(
            deps.jobs.clone(),
            deps.slots.clone(),
            vec![config.screenshot.resource.clone()],
            config.reaper.liveness_threshold(),
            config.reaper.batch_size,
            deps.notifier.clone(),
            deps.telemetry.clone(),
        );

        Self {
            shared: Arc::new(Shared {
                jobs: deps.jobs,
                coordinator,
                router,
                registry: deps.registry,
                retry,
                semaphore,
                semaphore_retry_after: Duration::from_millis(config.screenshot.retry_after_ms),
                budget,
                reaper,
                telemetry: deps.telemetry,
                queues: Queue::ALL.to_vec(),
                heartbeat_interval: config.reaper.heartbeat_interval(),
                reaper_interval: Duration::from_secs(config.reaper.interval_secs),
                store_backoff_max: Duration::from_millis(config.store_backoff_max_ms),
                counters: WorkerCounters::default(),
                started: Instant::now(),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Restrict the queues this worker polls. Must be called before `start`.
    pub fn with_queues(mut self, queues: impl IntoIterator<Item = Queue>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.queues = queues.into_iter().collect();
        }
        self
    }

    pub fn worker_id(&self) -> &WorkerId {
        self.shared.coordinator.worker()
    }

    pub fn budget(&self) -> Arc<BudgetThrottle> {
        self.shared.budget.clone()
    }

    /// A producer sharing this worker's routing table and budget gate.
    pub fn producer(&self) -> JobProducer {
        JobProducer::new(
            self.shared.jobs.clone(),
            self.shared.registry.clone(),
            self.shared.router.clone(),
        )
        .with_budget(self.shared.budget.clone())
    }

    /// Spawn the polling and reaper loops.
    pub async fn start(self) -> Result<WorkerHandle, JobStoreError> {
        let shared = self.shared;
        shared.semaphore.ensure().await?;

        for &queue in &shared.queues {
            let s = shared.clone();
            shared.tracker.spawn(async move { s.poll_loop(queue).await });
        }
        let s = shared.clone();
        shared.tracker.spawn(async move { s.reaper_loop().await });
        shared.tracker.close();

        info!(
            worker = %shared.coordinator.worker(),
            queues = ?shared.queues,
            "worker started"
        );
        Ok(WorkerHandle { shared })
    }
}

/// Handle to control a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<Shared>,
}

impl WorkerHandle {
    /// Stop claiming, signal handlers, and wait for in-flight work.
    pub async fn shutdown(self) {
        self.shared.cancel.cancel();
        self.shared.tracker.wait().await;
        info!(worker = %self.shared.coordinator.worker(), "worker stopped");
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    pub fn worker_id(&self) -> &WorkerId {
        self.shared.coordinator.worker()
    }

    pub fn stats(&self) -> WorkerStats {
        let c = &self.shared.counters;
        WorkerStats {
            worker_id: self.shared.coordinator.worker().to_string(),
            jobs_claimed: c.claimed.load(Ordering::Relaxed),
            jobs_succeeded: c.succeeded.load(Ordering::Relaxed),
            jobs_retried: c.retried.load(Ordering::Relaxed),
            jobs_dead: c.dead.load(Ordering::Relaxed),
            jobs_deferred: c.deferred.load(Ordering::Relaxed),
            lost_claims: c.lost_claims.load(Ordering::Relaxed),
            handler_panics: c.handler_panics.load(Ordering::Relaxed),
            store_errors: c.store_errors.load(Ordering::Relaxed),
            current_running: c.running.load(Ordering::Relaxed),
            uptime_secs: self.shared.started.elapsed().as_secs(),
        }
    }
}

/// Sleep unless cancelled first. False when cancelled.
async fn nap(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

enum Admission {
    Proceed(Option<SlotPermit>),
    Deferred,
}

impl Shared {
    fn worker(&self) -> &WorkerId {
        self.coordinator.worker()
    }

    async fn poll_loop(self: Arc<Self>, queue: Queue) {
        let interval = self.router.queue_config(queue).poll_interval();
        let mut backoff = Duration::ZERO;
        debug!(queue = %queue, interval_ms = interval.as_millis() as u64, "poll loop started");

        while !self.cancel.is_cancelled() {
            let pause = match self.poll_once(queue).await {
                Ok(0) => {
                    backoff = Duration::ZERO;
                    interval
                }
                Ok(_) => {
                    backoff = Duration::ZERO;
                    tokio::task::yield_now().await;
                    continue;
                }
                Err(e) => {
                    bump(&self.counters.store_errors);
                    backoff = if backoff.is_zero() {
                        interval
                    } else {
                        backoff.saturating_mul(2).min(self.store_backoff_max)
                    };
                    error!(
                        queue = %queue,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "poll failed; backing off"
                    );
                    backoff
                }
            };
            if !nap(&self.cancel, pause).await {
                break;
            }
        }
        debug!(queue = %queue, "poll loop stopped");
    }

    /// One tick: claim up to the queue's allowance and dispatch each job.
    async fn poll_once(self: &Arc<Self>, queue: Queue) -> Result<u32, JobStoreError> {
        let in_flight = self.jobs.count_in_flight(queue).await?;
        let allowance = self.router.claim_allowance(queue, in_flight);

        let mut claimed = 0;
        for _ in 0..allowance {
            if self.cancel.is_cancelled() {
                break;
            }
            let Some(job) = self.coordinator.claim_next(queue, Utc::now()).await? else {
                break;
            };
            claimed += 1;
            bump(&self.counters.claimed);

            let shared = self.clone();
            self.tracker.spawn(async move {
                let id = job.id;
                if let Err(e) = shared.dispatch(job).await {
                    bump(&shared.counters.store_errors);
                    error!(job_id = %id, error = %e, "dispatch failed; leaving claim to the reaper");
                }
            });
        }
        Ok(claimed)
    }

    async fn dispatch(&self, job: Job) -> Result<(), JobStoreError> {
        let permit = match self.admit_screenshot(&job).await? {
            Admission::Proceed(permit) => permit,
            Admission::Deferred => return Ok(()),
        };

        let result = self.admit_and_run(&job).await;

        if let Some(permit) = &permit {
            if let Err(e) = self.semaphore.release(permit).await {
                warn!(job_id = %job.id, error = %e, "slot release failed; reaper will reclaim it");
            }
        }
        result
    }

    async fn admit_screenshot(&self, job: &Job) -> Result<Admission, JobStoreError> {
        if job.queue != Queue::Screenshot {
            return Ok(Admission::Proceed(None));
        }
        match self.semaphore.acquire(job.id, &self.cancel).await? {
            Some(permit) => {
                self.telemetry.governor_decision(Governor::Semaphore, GovernorOutcome::Admit, &job.job_type);
                Ok(Admission::Proceed(Some(permit)))
            }
            None => {
                self.telemetry.governor_decision(Governor::Semaphore, GovernorOutcome::Defer, &job.job_type);
                let until = later_by(Utc::now(), self.semaphore_retry_after);
                self.coordinator.release(job, until).await?;
                bump(&self.counters.deferred);
                debug!(job_id = %job.id, until = %until, "no screenshot slot; job deferred");
                Ok(Admission::Deferred)
            }
        }
    }

    async fn admit_and_run(&self, job: &Job) -> Result<(), JobStoreError> {
        let governed = self.budget.governs(&job.job_type);
        let mut batch_size = None;
        if governed {
            match self.budget.evaluate(Utc::now()).await? {
                BudgetDecision::Admit { batch_size: b, .. } => {
                    self.telemetry.governor_decision(Governor::Budget, GovernorOutcome::Admit, &job.job_type);
                    batch_size = Some(b);
                }
                BudgetDecision::Defer { until, rejected } => {
                    let outcome = if rejected {
                        GovernorOutcome::Reject
                    } else {
                        GovernorOutcome::Defer
                    };
                    self.telemetry.governor_decision(Governor::Budget, outcome, &job.job_type);
                    self.coordinator.release(job, until).await?;
                    bump(&self.counters.deferred);
                    return Ok(());
                }
            }
        }

        let started_at = Utc::now();
        if !self.coordinator.start(job, started_at).await? {
            bump(&self.counters.lost_claims);
            return Ok(());
        }

        self.counters.running.fetch_add(1, Ordering::Relaxed);
        let result = self.execute(job, batch_size).await;
        self.counters.running.fetch_sub(1, Ordering::Relaxed);
        let finished = Utc::now();

        match result {
            Ok(output) => {
                match self.retry.on_success(job, self.worker(), started_at, finished).await? {
                    SuccessOutcome::Completed => bump(&self.counters.succeeded),
                    SuccessOutcome::NoOp => {}
                    SuccessOutcome::LostClaim => bump(&self.counters.lost_claims),
                }
                if governed && output.cost_micros > 0 {
                    self.budget.record_spend(output.cost_micros, finished).await?;
                }
            }
            Err(err) => {
                match self
                    .retry
                    .on_failure(job, self.worker(), &err, started_at, finished)
                    .await?
                {
                    FailureOutcome::Rescheduled { .. } => bump(&self.counters.retried),
                    FailureOutcome::Dead => bump(&self.counters.dead),
                    FailureOutcome::LostClaim => bump(&self.counters.lost_claims),
                }
            }
        }
        Ok(())
    }

    /// Run the handler in its own task with a heartbeat alongside.
    async fn execute(&self, job: &Job, batch_size: Option<u32>) -> Result<JobOutput, HandlerError> {
        let Some(handler) = self.registry.handler(&job.job_type) else {
            warn!(job_id = %job.id, job_type = %job.job_type, "no handler registered on this worker");
            return Err(HandlerError::transient(format!(
                "no handler registered for {}",
                job.job_type
            )));
        };

        let ctx = ExecutionContext {
            job_id: job.id,
            job_type: job.job_type.clone(),
            queue: job.queue,
            attempt: job.attempt_count,
            batch_size,
            cancel: self.cancel.child_token(),
        };
        let payload = job.payload.clone();

        let _heartbeat = self.spawn_heartbeat(job.id).drop_guard();
        match tokio::spawn(async move { handler.handle(payload, ctx).await }).await {
            Ok(result) => result,
            Err(join) => {
                bump(&self.counters.handler_panics);
                error!(job_id = %job.id, job_type = %job.job_type, error = %join, "handler panicked");
                Err(HandlerError::transient(format!("handler panicked: {join}")))
            }
        }
    }

    fn spawn_heartbeat(&self, id: JobId) -> CancellationToken {
        let stop = CancellationToken::new();
        let coordinator = self.coordinator.clone();
        let interval = self.heartbeat_interval;
        let token = stop.clone();
        tokio::spawn(async move {
            while nap(&token, interval).await {
                match coordinator.heartbeat(id, Utc::now()).await {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(job_id = %id, "heartbeat rejected; claim lost");
                        break;
                    }
                    Err(e) => warn!(job_id = %id, error = %e, "heartbeat failed"),
                }
            }
        });
        stop
    }

    async fn reaper_loop(self: Arc<Self>) {
        while nap(&self.cancel, self.reaper_interval).await {
            if let Err(e) = self.reaper.reap(Utc::now()).await {
                bump(&self.counters.store_errors);
                error!(error = %e, "reaper pass failed");
            }
        }
    }
}
