//! Queue router: classifies a job type into a queue at submission time and
//! enforces each queue's coarse in-flight ceiling.

use crate::config::{QueueConfig, QueueTable, RouteOverride};

use super::types::{Queue, Route};

#[derive(Debug, Clone)]
pub struct QueueRouter {
    queues: QueueTable,
    overrides: Vec<RouteOverride>,
}

impl QueueRouter {
    pub fn new(queues: QueueTable, overrides: Vec<RouteOverride>) -> Self {
        Self { queues, overrides }
    }

    pub fn queue_config(&self, queue: Queue) -> &QueueConfig {
        self.queues.get(queue)
    }

    /// Resolve `job_type` to its queue and per-queue defaults.
    ///
    /// Precedence: configured override, then the handler's queue hint, then
    /// `DEFAULT`.
    pub fn route(&self, job_type: &str, queue_hint: Option<Queue>) -> Route {
        let queue = self
            .override_for(job_type)
            .or(queue_hint)
            .unwrap_or(Queue::Default);
        let cfg = self.queues.get(queue);
        Route {
            queue,
            max_attempts: cfg.default_max_attempts,
            priority_weight: cfg.priority_weight,
        }
    }

    /// How many claims a poll tick of `queue` may make, given the number of
    /// jobs already in flight cluster-wide.
    pub fn claim_allowance(&self, queue: Queue, in_flight: u32) -> u32 {
        let cfg = self.queues.get(queue);
        cfg.max_in_flight
            .saturating_sub(in_flight)
            .min(cfg.priority_weight)
    }

    fn override_for(&self, job_type: &str) -> Option<Queue> {
        // Try exact match first
        if let Some(o) = self.overrides.iter().find(|o| o.pattern == job_type) {
            return Some(o.queue);
        }

        // Try category match (e.g., "ai.*" matches "ai.tagging"); longest prefix wins
        let category = self
            .overrides
            .iter()
            .filter_map(|o| {
                let prefix = o.pattern.strip_suffix(".*")?;
                let rest = job_type.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), o.queue))
            })
            .max_by_key(|(len, _)| *len);
        if let Some((_, queue)) = category {
            return Some(queue);
        }

        // Try wildcard
        self.overrides
            .iter()
            .find(|o| o.pattern == "*")
            .map(|o| o.queue)
    }
}
