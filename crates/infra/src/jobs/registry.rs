//! Handler registry: job-type identifier to executable handler.
//!
//! The registry is a lookup table only. It performs no retries or state
//! changes; every outcome flows back through the retry engine.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::types::{HandlerError, JobId, JobOutput, Queue};

/// Per-execution context handed to a handler.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job_id: JobId,
    pub job_type: String,
    pub queue: Queue,
    /// 1-based attempt number of this execution.
    pub attempt: u32,
    /// Batch size hint from the budget throttle, for governed job types.
    pub batch_size: Option<u32>,
    /// Cancelled when the worker shuts down.
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Executable unit behind a job type.
///
/// Handlers must be idempotent: delivery is at-least-once.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        payload: serde_json::Value,
        ctx: ExecutionContext,
    ) -> Result<JobOutput, HandlerError>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(serde_json::Value, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JobOutput, HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(serde_json::Value, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JobOutput, HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        payload: serde_json::Value,
        ctx: ExecutionContext,
    ) -> Result<JobOutput, HandlerError> {
        (self.0)(payload, ctx).await
    }
}

#[derive(Clone)]
struct Registration {
    handler: Arc<dyn JobHandler>,
    queue_hint: Queue,
}

/// Job-type dispatch table.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Registration>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `job_type`, replacing any previous one.
    pub fn register<H>(&mut self, job_type: impl Into<String>, queue_hint: Queue, handler: H)
    where
        H: JobHandler,
    {
        self.handlers.insert(
            job_type.into(),
            Registration {
                handler: Arc::new(handler),
                queue_hint,
            },
        );
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn handler(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).map(|r| r.handler.clone())
    }

    pub fn queue_hint(&self, job_type: &str) -> Option<Queue> {
        self.handlers.get(job_type).map(|r| r.queue_hint)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}
