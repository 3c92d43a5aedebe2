//! Configuration loading and representation.
//!
//! Resolution order: built-in defaults, then an optional JSON file named by
//! `PORTALJOBS_CONFIG`, then individual environment overrides. Every field is
//! defaulted so a partial file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use portaljobs_core::Queue;

/// Environment variable naming an optional JSON config file.
pub const CONFIG_PATH_ENV: &str = "PORTALJOBS_CONFIG";

/// Upper bound of `retry.max_delay_ms` (30 days).
pub const MAX_RETRY_DELAY_MS: u64 = 30 * 24 * 60 * 60 * 1_000;
/// Upper bound of `store_backoff_max_ms` (1 hour).
pub const MAX_STORE_BACKOFF_MS: u64 = 60 * 60 * 1_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Polling cadence and ceilings of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Sleep between empty polls.
    pub poll_interval_ms: u64,
    /// Cluster-wide ceiling of CLAIMED + RUNNING jobs in this queue.
    pub max_in_flight: u32,
    /// `max_attempts` for jobs submitted without an explicit value.
    pub default_max_attempts: u32,
    /// Maximum number of claims a single poll tick may make.
    pub priority_weight: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            max_in_flight: 10,
            default_max_attempts: 5,
            priority_weight: 4,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Built-in defaults per queue: low-latency queues poll every second or
    /// two, background queues every tens of seconds.
    pub fn defaults_for(queue: Queue) -> Self {
        match queue {
            Queue::High => Self {
                poll_interval_ms: 1_000,
                max_in_flight: 20,
                default_max_attempts: 5,
                priority_weight: 8,
            },
            Queue::Default => Self::default(),
            Queue::Screenshot => Self {
                poll_interval_ms: 2_000,
                max_in_flight: 6,
                default_max_attempts: 3,
                priority_weight: 2,
            },
            Queue::Low => Self {
                poll_interval_ms: 10_000,
                max_in_flight: 5,
                default_max_attempts: 5,
                priority_weight: 2,
            },
            Queue::Bulk => Self {
                poll_interval_ms: 30_000,
                max_in_flight: 4,
                default_max_attempts: 3,
                priority_weight: 1,
            },
        }
    }
}

/// Per-queue configuration table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "lowercase")]
pub struct QueueTable {
    pub high: QueueConfig,
    pub default: QueueConfig,
    pub screenshot: QueueConfig,
    pub low: QueueConfig,
    pub bulk: QueueConfig,
}

impl Default for QueueTable {
    fn default() -> Self {
        Self {
            high: QueueConfig::defaults_for(Queue::High),
            default: QueueConfig::defaults_for(Queue::Default),
            screenshot: QueueConfig::defaults_for(Queue::Screenshot),
            low: QueueConfig::defaults_for(Queue::Low),
            bulk: QueueConfig::defaults_for(Queue::Bulk),
        }
    }
}

impl QueueTable {
    pub fn get(&self, queue: Queue) -> &QueueConfig {
        match queue {
            Queue::High => &self.high,
            Queue::Default => &self.default,
            Queue::Screenshot => &self.screenshot,
            Queue::Low => &self.low,
            Queue::Bulk => &self.bulk,
        }
    }

    pub fn get_mut(&mut self, queue: Queue) -> &mut QueueConfig {
        match queue {
            Queue::High => &mut self.high,
            Queue::Default => &mut self.default,
            Queue::Screenshot => &mut self.screenshot,
            Queue::Low => &mut self.low,
            Queue::Bulk => &mut self.bulk,
        }
    }
}

/// Exponential backoff bounds for job-level retries.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60 * 60 * 1_000,
        }
    }
}

/// Stale-claim reaper cadence.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// A claim whose `locked_at` is older than this is presumed dead.
    pub liveness_threshold_secs: u64,
    pub interval_secs: u64,
    /// Maximum rows reset per sweep.
    pub batch_size: u32,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            liveness_threshold_secs: 300,
            interval_secs: 30,
            batch_size: 100,
        }
    }
}

impl ReaperConfig {
    pub fn liveness_threshold(&self) -> Duration {
        Duration::from_secs(self.liveness_threshold_secs)
    }

    /// Handlers refresh their claim three times per liveness window.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis((self.liveness_threshold_secs * 1_000 / 3).max(1))
    }
}

/// SCREENSHOT concurrency semaphore.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SemaphoreConfig {
    /// Name of the leased resource in the slot table.
    pub resource: String,
    pub capacity: u32,
    /// Bounded wait for a free slot before the job is released.
    pub max_wait_ms: u64,
    /// Interval between slot acquisition attempts while waiting.
    pub poll_interval_ms: u64,
    /// How far `run_after` is pushed when the wait expires.
    pub retry_after_ms: u64,
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self {
            resource: "screenshot".to_string(),
            capacity: 3,
            max_wait_ms: 5_000,
            poll_interval_ms: 250,
            retry_after_ms: 15_000,
        }
    }
}

/// Which AI-tagging jobs the 0.90 budget tier pauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferScope {
    /// Only the job being evaluated is pushed to the next cycle.
    #[default]
    ClaimedOnly,
    /// Every pending governed job, and every new governed submission, is
    /// pushed to the next cycle while the tier holds.
    AllPending,
}

/// Length of a budget billing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    /// Calendar month (UTC).
    #[default]
    Monthly,
    /// Calendar day (UTC).
    Daily,
}

/// Budget throttle for metered AI-tagging jobs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Job types subject to the throttle.
    pub job_types: Vec<String>,
    pub ledger_key: String,
    /// Spend ceiling per cycle, in micro-units of currency.
    pub ceiling_micros: u64,
    pub full_batch_size: u32,
    pub reduced_batch_size: u32,
    pub defer_scope: DeferScope,
    pub cycle: BillingCycle,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            job_types: vec!["ai.tagging".to_string()],
            ledger_key: "ai_tagging".to_string(),
            ceiling_micros: 50_000_000,
            full_batch_size: 50,
            reduced_batch_size: 10,
            defer_scope: DeferScope::ClaimedOnly,
            cycle: BillingCycle::Monthly,
        }
    }
}

/// Job-type to queue override; `pattern` is exact, `prefix.*`, or `*`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteOverride {
    pub pattern: String,
    pub queue: Queue,
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub database_url: Option<String>,
    /// Stable worker identity; generated per process when absent.
    pub worker_id: Option<String>,
    pub queues: QueueTable,
    pub retry: RetryConfig,
    pub reaper: ReaperConfig,
    pub screenshot: SemaphoreConfig,
    pub budget: BudgetConfig,
    pub routes: Vec<RouteOverride>,
    /// Cap of the polling loop's own backoff after store failures.
    pub store_backoff_max_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            worker_id: None,
            queues: QueueTable::default(),
            retry: RetryConfig::default(),
            reaper: ReaperConfig::default(),
            screenshot: SemaphoreConfig::default(),
            budget: BudgetConfig::default(),
            routes: Vec::new(),
            store_backoff_max_ms: 30_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(id) = lookup("PORTALJOBS_WORKER_ID") {
            self.worker_id = Some(id);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for queue in Queue::ALL {
            let q = self.queues.get(queue);
            if q.poll_interval_ms == 0 {
                return Err(invalid(format!("queue {queue}: poll_interval_ms must be > 0")));
            }
            if q.max_in_flight == 0 {
                return Err(invalid(format!("queue {queue}: max_in_flight must be > 0")));
            }
            if q.default_max_attempts == 0 {
                return Err(invalid(format!(
                    "queue {queue}: default_max_attempts must be > 0"
                )));
            }
            if q.priority_weight == 0 {
                return Err(invalid(format!("queue {queue}: priority_weight must be > 0")));
            }
        }
        if self.retry.base_delay_ms == 0 {
            return Err(invalid("retry.base_delay_ms must be > 0"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(invalid("retry.max_delay_ms must be >= retry.base_delay_ms"));
        }
        if self.retry.max_delay_ms > MAX_RETRY_DELAY_MS {
            return Err(invalid(format!(
                "retry.max_delay_ms must be <= {MAX_RETRY_DELAY_MS}"
            )));
        }
        if self.store_backoff_max_ms > MAX_STORE_BACKOFF_MS {
            return Err(invalid(format!(
                "store_backoff_max_ms must be <= {MAX_STORE_BACKOFF_MS}"
            )));
        }
        if self.reaper.liveness_threshold_secs == 0 || self.reaper.interval_secs == 0 {
            return Err(invalid("reaper intervals must be > 0"));
        }
        // A job waiting for a screenshot slot is CLAIMED without heartbeats.
        if self.screenshot.max_wait_ms >= self.reaper.liveness_threshold_secs.saturating_mul(1_000) {
            return Err(invalid(
                "screenshot.max_wait_ms must be below reaper.liveness_threshold_secs",
            ));
        }
        if self.screenshot.capacity == 0 {
            return Err(invalid("screenshot.capacity must be > 0"));
        }
        if self.screenshot.poll_interval_ms == 0 {
            return Err(invalid("screenshot.poll_interval_ms must be > 0"));
        }
        if self.budget.reduced_batch_size == 0
            || self.budget.reduced_batch_size > self.budget.full_batch_size
        {
            return Err(invalid(
                "budget.reduced_batch_size must be in 1..=budget.full_batch_size",
            ));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = OrchestratorConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.screenshot.capacity, 3);
        assert!(
            cfg.queues.get(Queue::High).poll_interval()
                < cfg.queues.get(Queue::Bulk).poll_interval()
        );
    }

    #[test]
    fn partial_json_keeps_other_defaults() {
        let cfg = OrchestratorConfig::from_json_str(
            r#"{
                "queues": { "bulk": { "poll_interval_ms": 45000 } },
                "budget": { "defer_scope": "all_pending" },
                "routes": [ { "pattern": "render.*", "queue": "SCREENSHOT" } ]
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.queues.bulk.poll_interval_ms, 45_000);
        assert_eq!(cfg.queues.high, QueueConfig::defaults_for(Queue::High));
        assert_eq!(cfg.budget.defer_scope, DeferScope::AllPending);
        assert_eq!(cfg.routes[0].queue, Queue::Screenshot);
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = OrchestratorConfig::default();
        cfg.apply_env(|key| match key {
            "DATABASE_URL" => Some("postgres://localhost/jobs".to_string()),
            "PORTALJOBS_WORKER_ID" => Some("w-7".to_string()),
            _ => None,
        });
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/jobs"));
        assert_eq!(cfg.worker_id.as_deref(), Some("w-7"));
    }

    #[test]
    fn rejects_inverted_retry_bounds() {
        let err = OrchestratorConfig::from_json_str(
            r#"{ "retry": { "base_delay_ms": 5000, "max_delay_ms": 10 } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_zero_semaphore_capacity() {
        let err =
            OrchestratorConfig::from_json_str(r#"{ "screenshot": { "capacity": 0 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn slot_wait_must_fit_inside_the_liveness_window() {
        let err = OrchestratorConfig::from_json_str(
            r#"{ "reaper": { "liveness_threshold_secs": 10 }, "screenshot": { "max_wait_ms": 10000 } }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("screenshot.max_wait_ms"));

        OrchestratorConfig::from_json_str(
            r#"{ "reaper": { "liveness_threshold_secs": 10 }, "screenshot": { "max_wait_ms": 9999 } }"#,
        )
        .unwrap();
    }

    #[test]
    fn rejects_unbounded_delays() {
        let err = OrchestratorConfig::from_json_str(&format!(
            r#"{{ "retry": {{ "max_delay_ms": {} }} }}"#,
            u64::MAX
        ))
        .unwrap_err();
        assert!(err.to_string().contains("retry.max_delay_ms"));

        let err = OrchestratorConfig::from_json_str(&format!(
            r#"{{ "store_backoff_max_ms": {} }}"#,
            MAX_STORE_BACKOFF_MS + 1
        ))
        .unwrap_err();
        assert!(err.to_string().contains("store_backoff_max_ms"));

        let cfg = OrchestratorConfig::from_json_str(&format!(
            r#"{{ "retry": {{ "max_delay_ms": {MAX_RETRY_DELAY_MS} }} }}"#
        ))
        .unwrap();
        assert_eq!(cfg.retry.max_delay_ms, MAX_RETRY_DELAY_MS);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = OrchestratorConfig::from_file("/nonexistent/portaljobs.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/portaljobs.json"));
    }
}
