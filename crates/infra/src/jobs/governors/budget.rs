//! Tiered budget throttle for metered job types.
//!
//! | spent / ceiling | decision                                        |
//! |-----------------|-------------------------------------------------|
//! | `< 0.75`        | admit, full batch size                          |
//! | `0.75 .. 0.90`  | admit, reduced batch size hint                  |
//! | `0.90 .. 1.00`  | defer to next cycle, warning alert once         |
//! | `>= 1.00`       | reject: deferred the same way, escalation alert |
//!
//! The ledger is read on every evaluation; concurrent completions move the
//! ratio between claim and execution.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{BillingCycle, BudgetConfig, DeferScope};
use crate::jobs::escalation::{AlertLevel, BudgetAlert, EscalationNotifier};
use crate::jobs::store::{BudgetLedger, BudgetThreshold, JobStore, JobStoreError, LedgerStore};

/// Ratio at which batches shrink.
pub const REDUCED_RATIO: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetTier {
    Full,
    Reduced,
    Deferred,
    Exhausted,
}

impl BudgetTier {
    pub fn admits(&self) -> bool {
        matches!(self, BudgetTier::Full | BudgetTier::Reduced)
    }
}

pub fn tier_for_ratio(ratio: f64) -> BudgetTier {
    if ratio >= BudgetThreshold::Exhausted.ratio() {
        BudgetTier::Exhausted
    } else if ratio >= BudgetThreshold::Warning.ratio() {
        BudgetTier::Deferred
    } else if ratio >= REDUCED_RATIO {
        BudgetTier::Reduced
    } else {
        BudgetTier::Full
    }
}

/// `[start, end)` of the billing cycle containing `now`, in UTC.
pub fn billing_period(cycle: BillingCycle, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let today = now.date_naive();
    let (start, end) = match cycle {
        BillingCycle::Daily => (today, today + Days::new(1)),
        BillingCycle::Monthly => {
            let first = today - Days::new(u64::from(today.day0()));
            (first, first + Months::new(1))
        }
    };
    (midnight(start), midnight(end))
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetSnapshot {
    pub ledger: BudgetLedger,
    pub ceiling_micros: u64,
    pub ratio: f64,
    pub tier: BudgetTier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
    Admit { batch_size: u32, reduced: bool },
    /// Hold the job until `until` (start of the next cycle). `rejected` marks
    /// the hard ceiling.
    Defer { until: DateTime<Utc>, rejected: bool },
}

/// Admission gate for budget-metered job types.
pub struct BudgetThrottle {
    ledger: Arc<dyn LedgerStore>,
    jobs: Arc<dyn JobStore>,
    notifier: Arc<dyn EscalationNotifier>,
    config: BudgetConfig,
}

impl BudgetThrottle {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        jobs: Arc<dyn JobStore>,
        notifier: Arc<dyn EscalationNotifier>,
        config: BudgetConfig,
    ) -> Self {
        Self {
            ledger,
            jobs,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    pub fn governs(&self, job_type: &str) -> bool {
        self.config.job_types.iter().any(|t| t == job_type)
    }

    /// Ledger state for the cycle containing `now`, rolling the cycle over
    /// when the stored one has ended.
    pub async fn current(&self, now: DateTime<Utc>) -> Result<BudgetSnapshot, JobStoreError> {
        let key = self.config.ledger_key.as_str();
        let (start, end) = billing_period(self.config.cycle, now);

        let mut ledger = self.ledger.open_ledger(key, start, end).await?;
        if ledger.period_end <= now {
            if self
                .ledger
                .roll_ledger(key, ledger.period_start, start, end)
                .await?
            {
                info!(ledger = key, period_start = %start, "budget cycle rolled over");
            }
            ledger = self.ledger.open_ledger(key, start, end).await?;
        }

        let ceiling = self.config.ceiling_micros;
        let ratio = if ceiling == 0 {
            f64::INFINITY
        } else {
            ledger.spent_micros as f64 / ceiling as f64
        };
        Ok(BudgetSnapshot {
            ledger,
            ceiling_micros: ceiling,
            ratio,
            tier: tier_for_ratio(ratio),
        })
    }

    /// Decide admission for one governed job.
    pub async fn evaluate(&self, now: DateTime<Utc>) -> Result<BudgetDecision, JobStoreError> {
        let snapshot = self.current(now).await?;
        match snapshot.tier {
            BudgetTier::Full => Ok(BudgetDecision::Admit {
                batch_size: self.config.full_batch_size,
                reduced: false,
            }),
            BudgetTier::Reduced => Ok(BudgetDecision::Admit {
                batch_size: self.config.reduced_batch_size,
                reduced: true,
            }),
            BudgetTier::Deferred | BudgetTier::Exhausted => {
                let until = snapshot.ledger.period_end;
                self.raise_alerts(&snapshot, until).await?;

                if self.config.defer_scope == DeferScope::AllPending {
                    let moved = self.jobs.defer_pending(&self.config.job_types, until).await?;
                    if moved > 0 {
                        debug!(moved, until = %until, "pending governed jobs deferred");
                    }
                }
                Ok(BudgetDecision::Defer {
                    until,
                    rejected: snapshot.tier == BudgetTier::Exhausted,
                })
            }
        }
    }

    /// Earliest `run_after` for a new submission of `job_type`. Only
    /// `all_pending` scope holds new submissions back.
    pub async fn submission_run_after(
        &self,
        job_type: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, JobStoreError> {
        if self.config.defer_scope != DeferScope::AllPending || !self.governs(job_type) {
            return Ok(None);
        }
        let snapshot = self.current(now).await?;
        Ok((!snapshot.tier.admits()).then_some(snapshot.ledger.period_end))
    }

    /// Add the metered cost of a completed execution.
    pub async fn record_spend(
        &self,
        amount_micros: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let snapshot = self.current(now).await?;
        if amount_micros == 0 {
            return Ok(snapshot.ledger.spent_micros);
        }
        self.ledger
            .add_spend(&self.config.ledger_key, amount_micros)
            .await
    }

    async fn raise_alerts(
        &self,
        snapshot: &BudgetSnapshot,
        deferred_until: DateTime<Utc>,
    ) -> Result<(), JobStoreError> {
        for (threshold, level) in [
            (BudgetThreshold::Warning, AlertLevel::Warning),
            (BudgetThreshold::Exhausted, AlertLevel::Escalation),
        ] {
            if snapshot.ratio < threshold.ratio() || snapshot.ledger.alert_sent(threshold) {
                continue;
            }
            let first = self
                .ledger
                .mark_alert_sent(
                    &snapshot.ledger.key,
                    snapshot.ledger.period_start,
                    threshold,
                )
                .await?;
            if first {
                self.notifier
                    .budget_alert(BudgetAlert {
                        ledger_key: snapshot.ledger.key.clone(),
                        threshold,
                        level,
                        ratio: snapshot.ratio,
                        spent_micros: snapshot.ledger.spent_micros,
                        ceiling_micros: snapshot.ceiling_micros,
                        period_start: snapshot.ledger.period_start,
                        deferred_until,
                    })
                    .await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::escalation::InMemoryNotifier;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{Job, JobState, Queue, Route};
    use chrono::TimeZone;

    const CEILING: u64 = 1_000_000;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn config(scope: DeferScope) -> BudgetConfig {
        BudgetConfig {
            ceiling_micros: CEILING,
            defer_scope: scope,
            ..BudgetConfig::default()
        }
    }

    fn throttle(
        store: Arc<InMemoryJobStore>,
        notifier: Arc<InMemoryNotifier>,
        scope: DeferScope,
    ) -> BudgetThrottle {
        BudgetThrottle::new(store.clone(), store, notifier, config(scope))
    }

    #[test]
    fn tiers_follow_thresholds() {
        assert_eq!(tier_for_ratio(0.0), BudgetTier::Full);
        assert_eq!(tier_for_ratio(0.7499), BudgetTier::Full);
        assert_eq!(tier_for_ratio(0.75), BudgetTier::Reduced);
        assert_eq!(tier_for_ratio(0.8999), BudgetTier::Reduced);
        assert_eq!(tier_for_ratio(0.90), BudgetTier::Deferred);
        assert_eq!(tier_for_ratio(0.9999), BudgetTier::Deferred);
        assert_eq!(tier_for_ratio(1.0), BudgetTier::Exhausted);
        assert_eq!(tier_for_ratio(f64::INFINITY), BudgetTier::Exhausted);
    }

    #[test]
    fn monthly_period_spans_the_calendar_month() {
        let (start, end) = billing_period(BillingCycle::Monthly, at(2026, 12, 17, 9));
        assert_eq!(start, at(2026, 12, 1, 0));
        assert_eq!(end, at(2027, 1, 1, 0));

        let (start, end) = billing_period(BillingCycle::Monthly, at(2028, 2, 29, 23));
        assert_eq!(start, at(2028, 2, 1, 0));
        assert_eq!(end, at(2028, 3, 1, 0));
    }

    #[test]
    fn daily_period_spans_the_day() {
        let (start, end) = billing_period(BillingCycle::Daily, at(2026, 5, 31, 18));
        assert_eq!(start, at(2026, 5, 31, 0));
        assert_eq!(end, at(2026, 6, 1, 0));
    }

    #[tokio::test]
    async fn admits_full_then_reduced() {
        let store = InMemoryJobStore::arc();
        let t = throttle(store, Arc::new(InMemoryNotifier::new()), DeferScope::ClaimedOnly);
        let now = at(2026, 3, 10, 12);

        assert_eq!(
            t.evaluate(now).await.unwrap(),
            BudgetDecision::Admit {
                batch_size: t.config().full_batch_size,
                reduced: false
            }
        );

        t.record_spend(800_000, now).await.unwrap();
        assert_eq!(
            t.evaluate(now).await.unwrap(),
            BudgetDecision::Admit {
                batch_size: t.config().reduced_batch_size,
                reduced: true
            }
        );
    }

    #[tokio::test]
    async fn ratio_095_defers_to_next_cycle_with_one_alert() {
        let store = InMemoryJobStore::arc();
        let notifier = Arc::new(InMemoryNotifier::new());
        let t = throttle(store, notifier.clone(), DeferScope::ClaimedOnly);
        let now = at(2026, 3, 10, 12);
        t.record_spend(950_000, now).await.unwrap();

        for _ in 0..5 {
            assert_eq!(
                t.evaluate(now).await.unwrap(),
                BudgetDecision::Defer {
                    until: at(2026, 4, 1, 0),
                    rejected: false
                }
            );
        }

        let alerts = notifier.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].threshold, BudgetThreshold::Warning);
        assert_eq!(alerts[0].level, AlertLevel::Warning);
        assert_eq!(alerts[0].deferred_until, at(2026, 4, 1, 0));
    }

    #[tokio::test]
    async fn exhausted_budget_rejects_with_escalation_alert() {
        let store = InMemoryJobStore::arc();
        let notifier = Arc::new(InMemoryNotifier::new());
        let t = throttle(store, notifier.clone(), DeferScope::ClaimedOnly);
        let now = at(2026, 3, 10, 12);

        t.record_spend(920_000, now).await.unwrap();
        t.evaluate(now).await.unwrap();
        t.record_spend(100_000, now).await.unwrap();

        for _ in 0..3 {
            assert_eq!(
                t.evaluate(now).await.unwrap(),
                BudgetDecision::Defer {
                    until: at(2026, 4, 1, 0),
                    rejected: true
                }
            );
        }

        let levels: Vec<_> = notifier.alerts().iter().map(|a| a.level).collect();
        assert_eq!(levels, vec![AlertLevel::Warning, AlertLevel::Escalation]);
    }

    #[tokio::test]
    async fn zero_ceiling_counts_as_exhausted() {
        let store = InMemoryJobStore::arc();
        let notifier = Arc::new(InMemoryNotifier::new());
        let mut cfg = config(DeferScope::ClaimedOnly);
        cfg.ceiling_micros = 0;
        let t = BudgetThrottle::new(store.clone(), store, notifier, cfg);

        assert!(matches!(
            t.evaluate(at(2026, 3, 10, 12)).await.unwrap(),
            BudgetDecision::Defer { rejected: true, .. }
        ));
    }

    #[tokio::test]
    async fn new_cycle_resets_spend_and_alerts() {
        let store = InMemoryJobStore::arc();
        let notifier = Arc::new(InMemoryNotifier::new());
        let t = throttle(store, notifier.clone(), DeferScope::ClaimedOnly);

        let march = at(2026, 3, 10, 12);
        t.record_spend(950_000, march).await.unwrap();
        t.evaluate(march).await.unwrap();

        let april = at(2026, 4, 1, 0);
        let snapshot = t.current(april).await.unwrap();
        assert_eq!(snapshot.ledger.period_start, april);
        assert_eq!(snapshot.ledger.spent_micros, 0);
        assert!(matches!(
            t.evaluate(april).await.unwrap(),
            BudgetDecision::Admit { reduced: false, .. }
        ));

        t.record_spend(950_000, april).await.unwrap();
        t.evaluate(april).await.unwrap();
        assert_eq!(notifier.alerts().len(), 2);
    }

    fn tagging_job(now: DateTime<Utc>) -> Job {
        Job::new(
            "ai.tagging",
            serde_json::json!({"images": 40}),
            Route {
                queue: Queue::Low,
                max_attempts: 5,
                priority_weight: 2,
            },
            now,
            now,
        )
    }

    #[tokio::test]
    async fn claimed_only_scope_leaves_other_pending_jobs_alone() {
        let store = InMemoryJobStore::arc();
        let t = throttle(store.clone(), Arc::new(InMemoryNotifier::new()), DeferScope::ClaimedOnly);
        let now = at(2026, 3, 10, 12);
        let id = store.insert(tagging_job(now)).await.unwrap();
        t.record_spend(950_000, now).await.unwrap();

        t.evaluate(now).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().run_after, now);
        assert_eq!(t.submission_run_after("ai.tagging", now).await.unwrap(), None);
    }

    #[tokio::test]
    async fn all_pending_scope_pauses_every_governed_job() {
        let store = InMemoryJobStore::arc();
        let t = throttle(store.clone(), Arc::new(InMemoryNotifier::new()), DeferScope::AllPending);
        let now = at(2026, 3, 10, 12);
        let governed = store.insert(tagging_job(now)).await.unwrap();
        let mut other = tagging_job(now);
        other.job_type = "feed.refresh".to_string();
        let other = store.insert(other).await.unwrap();
        t.record_spend(950_000, now).await.unwrap();

        t.evaluate(now).await.unwrap();

        let next_cycle = at(2026, 4, 1, 0);
        let g = store.get(governed).await.unwrap().unwrap();
        assert_eq!(g.run_after, next_cycle);
        assert_eq!(g.state, JobState::Pending);
        assert_eq!(store.get(other).await.unwrap().unwrap().run_after, now);

        assert_eq!(
            t.submission_run_after("ai.tagging", now).await.unwrap(),
            Some(next_cycle)
        );
        assert_eq!(t.submission_run_after("feed.refresh", now).await.unwrap(), None);
    }
}
