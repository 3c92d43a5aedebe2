//! Telemetry seam: one structured event per state transition and one
//! counter update per governor decision.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::info;

use super::types::{FailureCategory, Job, JobId, JobState, Queue};

/// A job lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionEvent {
    pub job_id: JobId,
    pub job_type: String,
    pub queue: Queue,
    pub attempt: u32,
    pub from: JobState,
    pub to: JobState,
    /// Why the transition happened, when it was not a plain success path.
    pub category: Option<FailureCategory>,
}

impl TransitionEvent {
    pub fn for_job(job: &Job, from: JobState, to: JobState) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            queue: job.queue,
            attempt: job.attempt_count,
            from,
            to,
            category: None,
        }
    }

    pub fn with_category(mut self, category: FailureCategory) -> Self {
        self.category = Some(category);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Governor {
    Semaphore,
    Budget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GovernorOutcome {
    Admit,
    Defer,
    Reject,
}

/// Receives lifecycle telemetry.
pub trait TelemetrySink: Send + Sync + 'static {
    fn transition(&self, event: &TransitionEvent);

    fn governor_decision(&self, governor: Governor, outcome: GovernorOutcome, job_type: &str);
}

/// Snapshot of governor decision counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GovernorCounts {
    pub semaphore_admit: u64,
    pub semaphore_defer: u64,
    pub budget_admit: u64,
    pub budget_defer: u64,
    pub budget_reject: u64,
}

#[derive(Debug, Default)]
struct Counters {
    semaphore_admit: AtomicU64,
    semaphore_defer: AtomicU64,
    budget_admit: AtomicU64,
    budget_defer: AtomicU64,
    budget_reject: AtomicU64,
}

impl Counters {
    fn bump(&self, governor: Governor, outcome: GovernorOutcome) {
        let counter = match (governor, outcome) {
            (Governor::Semaphore, GovernorOutcome::Admit) => &self.semaphore_admit,
            (Governor::Semaphore, _) => &self.semaphore_defer,
            (Governor::Budget, GovernorOutcome::Admit) => &self.budget_admit,
            (Governor::Budget, GovernorOutcome::Defer) => &self.budget_defer,
            (Governor::Budget, GovernorOutcome::Reject) => &self.budget_reject,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> GovernorCounts {
        GovernorCounts {
            semaphore_admit: self.semaphore_admit.load(Ordering::Relaxed),
            semaphore_defer: self.semaphore_defer.load(Ordering::Relaxed),
            budget_admit: self.budget_admit.load(Ordering::Relaxed),
            budget_defer: self.budget_defer.load(Ordering::Relaxed),
            budget_reject: self.budget_reject.load(Ordering::Relaxed),
        }
    }
}

/// Emits transitions as tracing events and keeps governor counters in process.
#[derive(Debug, Default)]
pub struct TracingTelemetry {
    counters: Counters,
}

impl TracingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn governor_counts(&self) -> GovernorCounts {
        self.counters.snapshot()
    }
}

impl TelemetrySink for TracingTelemetry {
    fn transition(&self, event: &TransitionEvent) {
        info!(
            target: "portaljobs::transition",
            job_id = %event.job_id,
            job_type = %event.job_type,
            queue = %event.queue,
            attempt = event.attempt,
            from = %event.from,
            to = %event.to,
            category = event.category.map(|c| c.as_str()).unwrap_or(""),
            "job transition"
        );
    }

    fn governor_decision(&self, governor: Governor, outcome: GovernorOutcome, job_type: &str) {
        self.counters.bump(governor, outcome);
        info!(
            target: "portaljobs::governor",
            governor = ?governor,
            outcome = ?outcome,
            job_type,
            "governor decision"
        );
    }
}

/// In-memory telemetry for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTelemetry {
    transitions: Mutex<Vec<TransitionEvent>>,
    counters: Counters,
}

impl InMemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transitions(&self) -> Vec<TransitionEvent> {
        self.transitions
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    pub fn transitions_for(&self, job_id: JobId) -> Vec<TransitionEvent> {
        self.transitions()
            .into_iter()
            .filter(|e| e.job_id == job_id)
            .collect()
    }

    pub fn governor_counts(&self) -> GovernorCounts {
        self.counters.snapshot()
    }
}

impl TelemetrySink for InMemoryTelemetry {
    fn transition(&self, event: &TransitionEvent) {
        if let Ok(mut v) = self.transitions.lock() {
            v.push(event.clone());
        }
    }

    fn governor_decision(&self, governor: Governor, outcome: GovernorOutcome, _job_type: &str) {
        self.counters.bump(governor, outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_each_decision() {
        let t = TracingTelemetry::new();
        t.governor_decision(Governor::Budget, GovernorOutcome::Defer, "ai.tagging");
        t.governor_decision(Governor::Budget, GovernorOutcome::Defer, "ai.tagging");
        t.governor_decision(Governor::Semaphore, GovernorOutcome::Admit, "screenshot.capture");

        let counts = t.governor_counts();
        assert_eq!(counts.budget_defer, 2);
        assert_eq!(counts.semaphore_admit, 1);
        assert_eq!(counts.budget_reject, 0);
    }
}
