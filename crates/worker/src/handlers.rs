//! Handlers registered by every worker process.
//!
//! Business modules register their own job types on top of these.

use std::time::Duration;

use portaljobs_infra::jobs::{HandlerError, HandlerRegistry, JobOutput, Queue, handler_fn};
use tracing::info;

/// Completes immediately. Useful for smoke-testing a deployment.
pub const NOOP: &str = "system.noop";

/// Sleeps for `{"millis": n}` (capped), honouring shutdown.
pub const SLEEP: &str = "system.sleep";

const MAX_SLEEP_MS: u64 = 60_000;

pub fn register_builtin(registry: &mut HandlerRegistry) {
    registry.register(
        NOOP,
        Queue::Default,
        handler_fn(|payload, ctx| async move {
            info!(job_id = %ctx.job_id, attempt = ctx.attempt, %payload, "noop job");
            Ok(JobOutput::default())
        }),
    );

    registry.register(
        SLEEP,
        Queue::Low,
        handler_fn(|payload, ctx| async move {
            let Some(millis) = payload.get("millis").and_then(|v| v.as_u64()) else {
                return Err(HandlerError::permanent("payload.millis must be an unsigned integer"));
            };
            let pause = Duration::from_millis(millis.min(MAX_SLEEP_MS));
            tokio::select! {
                _ = ctx.cancel.cancelled() => Err(HandlerError::transient("interrupted by shutdown")),
                _ = tokio::time::sleep(pause) => Ok(JobOutput::default()),
            }
        }),
    );
}

pub fn builtin_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    register_builtin(&mut registry);
    registry
}
