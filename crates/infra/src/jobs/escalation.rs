//! Escalation seam: terminal job failures and budget threshold alerts.
//!
//! Delivery transports (email, chat, pager) live outside this crate and plug
//! in through [`EscalationNotifier`].

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, warn};

use super::store::BudgetThreshold;
use super::types::{AttemptRecord, FailureCategory, Job, JobId, LastError, Queue};

/// Structured payload delivered exactly once per DEAD transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EscalationEvent {
    pub job_id: JobId,
    pub job_type: String,
    pub queue: Queue,
    pub attempts: u32,
    pub last_error: Option<LastError>,
    pub first_failed_at: Option<DateTime<Utc>>,
    pub history: Vec<AttemptRecord>,
}

impl EscalationEvent {
    pub fn from_dead_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            queue: job.queue,
            attempts: job.attempt_count,
            last_error: job.last_error.clone(),
            first_failed_at: job.first_failed_at,
            history: job.history.clone(),
        }
    }

    pub fn category(&self) -> Option<FailureCategory> {
        self.last_error.as_ref().map(|e| e.category)
    }
}

/// Severity of a budget alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warning,
    Escalation,
}

/// Threshold-crossing alert of the budget throttle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetAlert {
    pub ledger_key: String,
    pub threshold: BudgetThreshold,
    pub level: AlertLevel,
    pub ratio: f64,
    pub spent_micros: u64,
    pub ceiling_micros: u64,
    pub period_start: DateTime<Utc>,
    pub deferred_until: DateTime<Utc>,
}

/// Sink for terminal failures and budget alerts.
#[async_trait]
pub trait EscalationNotifier: Send + Sync + 'static {
    async fn escalate(&self, event: EscalationEvent);

    async fn budget_alert(&self, alert: BudgetAlert);
}

/// Notifier that only writes to the process log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl EscalationNotifier for TracingNotifier {
    async fn escalate(&self, event: EscalationEvent) {
        error!(
            job_id = %event.job_id,
            job_type = %event.job_type,
            queue = %event.queue,
            attempts = event.attempts,
            category = ?event.category(),
            last_error = event.last_error.as_ref().map(|e| e.message.as_str()).unwrap_or(""),
            first_failed_at = ?event.first_failed_at,
            "job is dead; escalating"
        );
    }

    async fn budget_alert(&self, alert: BudgetAlert) {
        match alert.level {
            AlertLevel::Warning => warn!(
                ledger = %alert.ledger_key,
                ratio = alert.ratio,
                spent_micros = alert.spent_micros,
                ceiling_micros = alert.ceiling_micros,
                deferred_until = %alert.deferred_until,
                "budget warning threshold crossed"
            ),
            AlertLevel::Escalation => error!(
                ledger = %alert.ledger_key,
                ratio = alert.ratio,
                spent_micros = alert.spent_micros,
                ceiling_micros = alert.ceiling_micros,
                deferred_until = %alert.deferred_until,
                "budget exhausted"
            ),
        }
    }
}

/// In-memory notifier for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryNotifier {
    escalations: Mutex<Vec<EscalationEvent>>,
    alerts: Mutex<Vec<BudgetAlert>>,
}

impl InMemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn escalations(&self) -> Vec<EscalationEvent> {
        self.escalations
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    pub fn alerts(&self) -> Vec<BudgetAlert> {
        self.alerts.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl EscalationNotifier for InMemoryNotifier {
    async fn escalate(&self, event: EscalationEvent) {
        if let Ok(mut v) = self.escalations.lock() {
            v.push(event);
        }
    }

    async fn budget_alert(&self, alert: BudgetAlert) {
        if let Ok(mut v) = self.alerts.lock() {
            v.push(alert);
        }
    }
}
