//! Job orchestration: queues, claims, governors, retries.
//!
//! ## Design
//!
//! - Jobs are durable rows; the store is the only coordination point between
//!   workers, so any number of worker processes may poll the same queues
//! - Claims use `FOR UPDATE SKIP LOCKED`; a stale-claim reaper returns jobs
//!   whose holder stopped heartbeating
//! - Governors (SCREENSHOT semaphore, budget throttle) gate execution after
//!   the claim and release the job on a negative decision
//! - Failures are classified, retried with jittered exponential backoff, and
//!   buried as DEAD with an escalation once attempts run out
//!
//! ## Components
//!
//! - `JobProducer`: validates and enqueues submissions
//! - `QueueRouter`: job type → queue, per-queue limits
//! - `ClaimCoordinator` / `StaleClaimReaper`: claim lifecycle
//! - `ConcurrencySemaphore` / `BudgetThrottle`: admission control
//! - `RetryEngine`: outcome handling and backoff
//! - `Worker`: poll loops, dispatch and graceful shutdown
//! - `JobStore`: persistence (`InMemoryJobStore`, `PostgresJobStore`)

pub mod claim;
pub mod escalation;
pub mod governors;
pub mod postgres;
pub mod producer;
pub mod registry;
pub mod retry;
pub mod router;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod worker;

pub use claim::{ClaimCoordinator, ReapReport, StaleClaimReaper};
pub use escalation::{
    AlertLevel, BudgetAlert, EscalationEvent, EscalationNotifier, InMemoryNotifier,
    TracingNotifier,
};
pub use governors::{
    BudgetDecision, BudgetSnapshot, BudgetThrottle, BudgetTier, ConcurrencySemaphore, SlotPermit,
};
pub use postgres::PostgresJobStore;
pub use producer::{JobProducer, SubmitError, SubmitRequest};
pub use registry::{ExecutionContext, HandlerRegistry, JobHandler, handler_fn};
pub use retry::{FailureOutcome, RetryEngine, RetryPolicy, SuccessOutcome};
pub use router::QueueRouter;
pub use store::{
    BudgetLedger, BudgetThreshold, InMemoryJobStore, JobStats, JobStore, JobStoreError,
    LedgerStore, QueueStats, SlotStore,
};
pub use telemetry::{
    GovernorCounts, InMemoryTelemetry, TelemetrySink, TracingTelemetry, TransitionEvent,
};
pub use types::{
    AttemptRecord, FailureCategory, HandlerError, Job, JobId, JobOutput, JobState, LastError,
    Queue, Route, WorkerId,
};
pub use worker::{Worker, WorkerDeps, WorkerHandle, WorkerStats};
