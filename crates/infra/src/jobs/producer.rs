//! Submission API used by business modules.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

use super::governors::BudgetThrottle;
use super::registry::HandlerRegistry;
use super::router::QueueRouter;
use super::store::{JobStore, JobStoreError};
use super::types::{FailureCategory, Job, JobId};

/// A job submission.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub job_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Overrides the queue default.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Earliest execution time; defaults to now.
    #[serde(default)]
    pub run_after: Option<DateTime<Utc>>,
}

impl SubmitRequest {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            max_attempts: None,
            run_after: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_run_after(mut self, run_after: DateTime<Utc>) -> Self {
        self.run_after = Some(run_after);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid job type: {0}")]
    InvalidJobType(String),
    #[error("max_attempts must be at least 1")]
    InvalidMaxAttempts,
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

impl SubmitError {
    pub fn category(&self) -> Option<FailureCategory> {
        match self {
            SubmitError::InvalidJobType(_) => Some(FailureCategory::InvalidJobType),
            _ => None,
        }
    }
}

/// Validates, routes and enqueues jobs.
#[derive(Clone)]
pub struct JobProducer {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    router: Arc<QueueRouter>,
    budget: Option<Arc<BudgetThrottle>>,
}

impl JobProducer {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<HandlerRegistry>, router: Arc<QueueRouter>) -> Self {
        Self {
            store,
            registry,
            router,
            budget: None,
        }
    }

    /// Hold governed submissions back while the budget tier pauses them.
    pub fn with_budget(mut self, budget: Arc<BudgetThrottle>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub async fn submit(&self, req: SubmitRequest) -> Result<JobId, SubmitError> {
        self.submit_at(req, Utc::now()).await
    }

    /// Submit as of `now`.
    pub async fn submit_at(&self, req: SubmitRequest, now: DateTime<Utc>) -> Result<JobId, SubmitError> {
        let Some(hint) = self.registry.queue_hint(&req.job_type) else {
            return Err(SubmitError::InvalidJobType(req.job_type));
        };
        if req.max_attempts == Some(0) {
            return Err(SubmitError::InvalidMaxAttempts);
        }

        let mut route = self.router.route(&req.job_type, Some(hint));
        if let Some(max) = req.max_attempts {
            route.max_attempts = max;
        }

        let mut run_after = req.run_after.unwrap_or(now);
        if let Some(budget) = &self.budget {
            if let Some(held) = budget.submission_run_after(&req.job_type, now).await? {
                run_after = run_after.max(held);
            }
        }

        let job = Job::new(req.job_type, req.payload, route, run_after, now);
        let id = self.store.insert(job).await?;
        info!(
            job_id = %id,
            queue = %route.queue,
            max_attempts = route.max_attempts,
            run_after = %run_after,
            "job submitted"
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BudgetConfig, DeferScope, QueueTable, RouteOverride};
    use crate::jobs::escalation::InMemoryNotifier;
    use crate::jobs::registry::handler_fn;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{JobOutput, JobState, Queue};
    use chrono::TimeZone;

    fn registry() -> Arc<HandlerRegistry> {
        let mut r = HandlerRegistry::new();
        for (t, q) in [
            ("screenshot.capture", Queue::Screenshot),
            ("ai.tagging", Queue::Low),
            ("feed.refresh", Queue::Default),
        ] {
            r.register(t, q, handler_fn(|_, _| async { Ok(JobOutput::default()) }));
        }
        Arc::new(r)
    }

    fn producer(store: Arc<InMemoryJobStore>, routes: Vec<RouteOverride>) -> JobProducer {
        JobProducer::new(
            store,
            registry(),
            Arc::new(QueueRouter::new(QueueTable::default(), routes)),
        )
    }

    #[tokio::test]
    async fn unregistered_job_type_is_rejected() {
        let store = InMemoryJobStore::arc();
        let p = producer(store.clone(), vec![]);

        let err = p
            .submit(SubmitRequest::new("nope", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::InvalidJobType(ref t) if t == "nope"));
        assert_eq!(err.category(), Some(FailureCategory::InvalidJobType));
        assert!(store.list_by_state(JobState::Pending, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn submission_routes_by_hint_and_override() {
        let store = InMemoryJobStore::arc();
        let p = producer(
            store.clone(),
            vec![RouteOverride {
                pattern: "feed.*".to_string(),
                queue: Queue::High,
            }],
        );

        let shot = p
            .submit(SubmitRequest::new("screenshot.capture", serde_json::json!({"url": "https://example.com"})))
            .await
            .unwrap();
        let feed = p
            .submit(SubmitRequest::new("feed.refresh", serde_json::json!({})).with_max_attempts(7))
            .await
            .unwrap();

        let shot = store.get(shot).await.unwrap().unwrap();
        assert_eq!(shot.queue, Queue::Screenshot);
        assert_eq!(shot.state, JobState::Pending);
        assert_eq!(shot.attempt_count, 0);
        assert_eq!(shot.max_attempts, 3);

        let feed = store.get(feed).await.unwrap().unwrap();
        assert_eq!(feed.queue, Queue::High);
        assert_eq!(feed.max_attempts, 7);
    }

    #[tokio::test]
    async fn explicit_run_after_is_kept() {
        let store = InMemoryJobStore::arc();
        let p = producer(store.clone(), vec![]);
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let later = now + chrono::Duration::hours(1);

        let id = p
            .submit_at(
                SubmitRequest::new("feed.refresh", serde_json::json!({})).with_run_after(later),
                now,
            )
            .await
            .unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().run_after, later);
    }

    #[tokio::test]
    async fn zero_max_attempts_is_rejected() {
        let store = InMemoryJobStore::arc();
        let p = producer(store, vec![]);
        let err = p
            .submit(SubmitRequest::new("feed.refresh", serde_json::json!({})).with_max_attempts(0))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::InvalidMaxAttempts));
    }

    #[tokio::test]
    async fn paused_budget_holds_new_governed_submissions() {
        let store = InMemoryJobStore::arc();
        let budget = Arc::new(BudgetThrottle::new(
            store.clone(),
            store.clone(),
            Arc::new(InMemoryNotifier::new()),
            BudgetConfig {
                ceiling_micros: 1_000,
                defer_scope: DeferScope::AllPending,
                ..BudgetConfig::default()
            },
        ));
        let p = producer(store.clone(), vec![]).with_budget(budget.clone());
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        budget.record_spend(950, now).await.unwrap();

        let tagging = p
            .submit_at(SubmitRequest::new("ai.tagging", serde_json::json!({})), now)
            .await
            .unwrap();
        let feed = p
            .submit_at(SubmitRequest::new("feed.refresh", serde_json::json!({})), now)
            .await
            .unwrap();

        let next_cycle = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        assert_eq!(store.get(tagging).await.unwrap().unwrap().run_after, next_cycle);
        assert_eq!(store.get(feed).await.unwrap().unwrap().run_after, now);
    }
}
