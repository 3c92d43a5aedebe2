//! Postgres-backed job, slot and ledger store.
//!
//! The claim is a single `UPDATE … FROM (SELECT … FOR UPDATE SKIP LOCKED)`
//! statement, so concurrent pollers step over each other's rows instead of
//! queueing behind them. Every other transition is a conditional update on
//! `(state, locked_by)`; the affected row count says whether it applied.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` on insert, else `Storage` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / PoolTimedOut / Io / Tls | N/A | `Unavailable` |
//! | ColumnDecode / Decode / ColumnNotFound | N/A | `Corrupt` |
//! | Other | N/A | `Storage` |

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use super::store::{
    BudgetLedger, BudgetThreshold, CompleteOutcome, JobStats, JobStore, JobStoreError,
    LedgerStore, ReapedJob, SlotStore, recover_stale_claim,
};
use super::types::{AttemptRecord, Job, JobId, JobState, LastError, Queue, WorkerId};

/// Idempotent schema, applied statement by statement by [`PostgresJobStore::migrate`].
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id              UUID PRIMARY KEY,
        queue           TEXT NOT NULL,
        job_type        TEXT NOT NULL,
        payload         JSONB NOT NULL,
        state           TEXT NOT NULL,
        attempt_count   INTEGER NOT NULL DEFAULT 0 CHECK (attempt_count >= 0),
        max_attempts    INTEGER NOT NULL CHECK (max_attempts > 0),
        priority_weight INTEGER NOT NULL DEFAULT 1,
        run_after       TIMESTAMPTZ NOT NULL,
        locked_by       TEXT,
        locked_at       TIMESTAMPTZ,
        last_error      JSONB,
        created_at      TIMESTAMPTZ NOT NULL,
        completed_at    TIMESTAMPTZ,
        first_failed_at TIMESTAMPTZ,
        history         JSONB NOT NULL DEFAULT '[]'::jsonb,
        CHECK (attempt_count <= max_attempts)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobs_claim_idx
        ON jobs (queue, run_after, id)
        WHERE state = 'PENDING'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobs_in_flight_idx
        ON jobs (locked_at)
        WHERE state IN ('CLAIMED', 'RUNNING')
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS budget_ledger (
        key                  TEXT PRIMARY KEY,
        period_start         TIMESTAMPTZ NOT NULL,
        period_end           TIMESTAMPTZ NOT NULL,
        spent_micros         BIGINT NOT NULL DEFAULT 0 CHECK (spent_micros >= 0),
        warning_alert_sent   BOOLEAN NOT NULL DEFAULT FALSE,
        exhausted_alert_sent BOOLEAN NOT NULL DEFAULT FALSE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS resource_slots (
        resource    TEXT NOT NULL,
        slot        INTEGER NOT NULL,
        holder      UUID,
        lease       UUID,
        acquired_at TIMESTAMPTZ,
        PRIMARY KEY (resource, slot)
    )
    "#,
    r#"
    ALTER TABLE resource_slots ADD COLUMN IF NOT EXISTS lease UUID
    "#,
];

/// Postgres-backed store for jobs, semaphore slots and budget ledgers.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    async fn fetch_job(&self, operation: &str, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        row.map(|r| job_from_row(&r)).transpose()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type), err)]
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, queue, job_type, payload, state, attempt_count, max_attempts,
                priority_weight, run_after, locked_by, locked_at, last_error,
                created_at, completed_at, first_failed_at, history
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.queue.as_str())
        .bind(&job.job_type)
        .bind(&job.payload)
        .bind(job.state.as_str())
        .bind(job.attempt_count as i32)
        .bind(job.max_attempts as i32)
        .bind(job.priority_weight as i32)
        .bind(job.run_after)
        .bind(job.locked_by.as_ref().map(|w| w.as_str()))
        .bind(job.locked_at)
        .bind(job.last_error.as_ref().map(Json))
        .bind(job.created_at)
        .bind(job.completed_at)
        .bind(job.first_failed_at)
        .bind(Json(&job.history))
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("insert", e)
            }
        })?;
        Ok(job.id)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.fetch_job("get", id).await
    }

    #[instrument(skip(self), fields(worker = %worker), err)]
    async fn claim_next(
        &self,
        queue: Queue,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(
            r#"
            WITH next AS (
                SELECT id
                FROM jobs
                WHERE queue = $1
                  AND state = 'PENDING'
                  AND run_after <= $3
                  AND attempt_count < max_attempts
                ORDER BY run_after ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET state = 'CLAIMED',
                locked_by = $2,
                locked_at = $3,
                attempt_count = jobs.attempt_count + 1
            FROM next
            WHERE jobs.id = next.id
            RETURNING jobs.*
            "#,
        )
        .bind(queue.as_str())
        .bind(worker.as_str())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(skip(self), fields(worker = %worker), err)]
    async fn mark_running(
        &self,
        id: JobId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'RUNNING', locked_at = $3
            WHERE id = $1 AND state = 'CLAIMED' AND locked_by = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(worker.as_str())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_running", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(worker = %worker), err)]
    async fn heartbeat(
        &self,
        id: JobId,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET locked_at = $3
            WHERE id = $1 AND state IN ('CLAIMED', 'RUNNING') AND locked_by = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(worker.as_str())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("heartbeat", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, record), fields(worker = %worker), err)]
    async fn complete(
        &self,
        id: JobId,
        worker: &WorkerId,
        record: AttemptRecord,
        now: DateTime<Utc>,
    ) -> Result<CompleteOutcome, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'SUCCEEDED',
                completed_at = $3,
                last_error = NULL,
                locked_by = NULL,
                locked_at = NULL,
                history = history || jsonb_build_array($4::jsonb)
            WHERE id = $1 AND state = 'RUNNING' AND locked_by = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(worker.as_str())
        .bind(now)
        .bind(Json(&record))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        if result.rows_affected() == 1 {
            return Ok(CompleteOutcome::Completed);
        }
        match self.fetch_job("complete", id).await? {
            None => Err(JobStoreError::NotFound(id)),
            Some(job) if job.state == JobState::Succeeded => Ok(CompleteOutcome::AlreadySucceeded),
            Some(_) => Ok(CompleteOutcome::NotHeld),
        }
    }

    #[instrument(skip(self, error, record), fields(worker = %worker), err)]
    async fn reschedule(
        &self,
        id: JobId,
        worker: &WorkerId,
        run_after: DateTime<Utc>,
        error: LastError,
        record: AttemptRecord,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'PENDING',
                run_after = GREATEST(run_after, $3),
                last_error = $4,
                first_failed_at = COALESCE(first_failed_at, $5),
                locked_by = NULL,
                locked_at = NULL,
                history = history || jsonb_build_array($6::jsonb)
            WHERE id = $1 AND state = 'RUNNING' AND locked_by = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(worker.as_str())
        .bind(run_after)
        .bind(Json(&error))
        .bind(record.finished_at)
        .bind(Json(&record))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reschedule", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, error, record), fields(worker = %worker), err)]
    async fn bury(
        &self,
        id: JobId,
        worker: &WorkerId,
        error: LastError,
        record: AttemptRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'DEAD',
                completed_at = $3,
                last_error = $4,
                first_failed_at = COALESCE(first_failed_at, $5),
                locked_by = NULL,
                locked_at = NULL,
                history = history || jsonb_build_array($6::jsonb)
            WHERE id = $1 AND state = 'RUNNING' AND locked_by = $2
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(worker.as_str())
        .bind(now)
        .bind(Json(&error))
        .bind(record.finished_at)
        .bind(Json(&record))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("bury", e))?;

        row.map(|r| job_from_row(&r)).transpose()
    }

    #[instrument(skip(self), fields(worker = %worker), err)]
    async fn release(
        &self,
        id: JobId,
        worker: &WorkerId,
        run_after: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'PENDING',
                attempt_count = GREATEST(attempt_count - 1, 0),
                run_after = GREATEST(run_after, $3),
                locked_by = NULL,
                locked_at = NULL
            WHERE id = $1 AND state = 'CLAIMED' AND locked_by = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(worker.as_str())
        .bind(run_after)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn reap_stale(
        &self,
        locked_before: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ReapedJob>, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let rows = sqlx::query(
            r#"
            SELECT *
            FROM jobs
            WHERE state IN ('CLAIMED', 'RUNNING') AND locked_at < $1
            ORDER BY locked_at ASC, id ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(locked_before)
        .bind(i64::from(limit))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reap_stale_select", e))?;

        let mut reaped = Vec::with_capacity(rows.len());
        for row in rows {
            let mut job = job_from_row(&row)?;
            let recovered = recover_stale_claim(&mut job, now);

            sqlx::query(
                r#"
                UPDATE jobs
                SET state = $2,
                    completed_at = $3,
                    first_failed_at = $4,
                    last_error = $5,
                    history = $6,
                    locked_by = NULL,
                    locked_at = NULL
                WHERE id = $1
                "#,
            )
            .bind(job.id.as_uuid())
            .bind(job.state.as_str())
            .bind(job.completed_at)
            .bind(job.first_failed_at)
            .bind(job.last_error.as_ref().map(Json))
            .bind(Json(&job.history))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("reap_stale_update", e))?;

            reaped.push(recovered);
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(reaped)
    }

    #[instrument(skip(self), err)]
    async fn count_in_flight(&self, queue: Queue) -> Result<u32, JobStoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE queue = $1 AND state IN ('CLAIMED', 'RUNNING')",
        )
        .bind(queue.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_in_flight", e))?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    #[instrument(skip(self), err)]
    async fn defer_pending(
        &self,
        job_types: &[String],
        until: DateTime<Utc>,
    ) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET run_after = $2
            WHERE state = 'PENDING' AND job_type = ANY($1) AND run_after < $2
            "#,
        )
        .bind(job_types)
        .bind(until)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("defer_pending", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn list_by_state(&self, state: JobState, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT *
            FROM jobs
            WHERE state = $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(state.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_state", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT queue, state, COUNT(*) AS n FROM jobs GROUP BY queue, state")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let queue: String = row.try_get("queue").map_err(|e| map_sqlx_error("stats", e))?;
            let state: String = row.try_get("state").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let queue = Queue::from_str(&queue).map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
            let state = JobState::from_str(&state).map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
            stats
                .queues
                .entry(queue)
                .or_default()
                .add(state, n.max(0) as u64);
        }
        Ok(stats)
    }
}

#[async_trait]
impl SlotStore for PostgresJobStore {
    #[instrument(skip(self), err)]
    async fn ensure_slots(&self, resource: &str, capacity: u32) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO resource_slots (resource, slot)
            SELECT $1, g FROM generate_series(0, $2 - 1) AS g
            ON CONFLICT (resource, slot) DO NOTHING
            "#,
        )
        .bind(resource)
        .bind(capacity as i32)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("ensure_slots", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn try_acquire_slot(
        &self,
        resource: &str,
        capacity: u32,
        holder: JobId,
        lease: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>, JobStoreError> {
        let slot: Option<i32> = sqlx::query_scalar(
            r#"
            WITH free AS (
                SELECT resource, slot
                FROM resource_slots
                WHERE resource = $1 AND slot < $2 AND holder IS NULL
                ORDER BY slot ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE resource_slots
            SET holder = $3, lease = $4, acquired_at = $5
            FROM free
            WHERE resource_slots.resource = free.resource AND resource_slots.slot = free.slot
            RETURNING resource_slots.slot
            "#,
        )
        .bind(resource)
        .bind(capacity as i32)
        .bind(holder.as_uuid())
        .bind(lease)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("try_acquire_slot", e))?;
        Ok(slot.map(|s| s.max(0) as u32))
    }

    #[instrument(skip(self), err)]
    async fn release_slot(
        &self,
        resource: &str,
        slot: u32,
        lease: Uuid,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE resource_slots
            SET holder = NULL, lease = NULL, acquired_at = NULL
            WHERE resource = $1 AND slot = $2 AND lease = $3
            "#,
        )
        .bind(resource)
        .bind(slot as i32)
        .bind(lease)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_slot", e))?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn slots_in_use(&self, resource: &str) -> Result<u32, JobStoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM resource_slots WHERE resource = $1 AND holder IS NOT NULL",
        )
        .bind(resource)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("slots_in_use", e))?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    #[instrument(skip(self), err)]
    async fn reclaim_orphaned_slots(&self, resource: &str) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE resource_slots AS s
            SET holder = NULL, lease = NULL, acquired_at = NULL
            WHERE s.resource = $1
              AND s.holder IS NOT NULL
              AND NOT EXISTS (
                  SELECT 1 FROM jobs j
                  WHERE j.id = s.holder AND j.state IN ('CLAIMED', 'RUNNING')
              )
            "#,
        )
        .bind(resource)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reclaim_orphaned_slots", e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl LedgerStore for PostgresJobStore {
    #[instrument(skip(self), err)]
    async fn open_ledger(
        &self,
        key: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<BudgetLedger, JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO budget_ledger (key, period_start, period_end)
            VALUES ($1, $2, $3)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(period_start)
        .bind(period_end)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("open_ledger", e))?;

        let row = sqlx::query("SELECT * FROM budget_ledger WHERE key = $1")
            .bind(key)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("open_ledger", e))?;
        let ledger = LedgerRow::from_row(&row).map_err(|e| map_sqlx_error("open_ledger", e))?;
        Ok(ledger.into())
    }

    #[instrument(skip(self), err)]
    async fn roll_ledger(
        &self,
        key: &str,
        expected_start: DateTime<Utc>,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE budget_ledger
            SET period_start = $3,
                period_end = $4,
                spent_micros = 0,
                warning_alert_sent = FALSE,
                exhausted_alert_sent = FALSE
            WHERE key = $1 AND period_start = $2
            "#,
        )
        .bind(key)
        .bind(expected_start)
        .bind(period_start)
        .bind(period_end)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("roll_ledger", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn add_spend(&self, key: &str, amount_micros: u64) -> Result<u64, JobStoreError> {
        let amount = i64::try_from(amount_micros)
            .map_err(|_| JobStoreError::Storage(format!("spend {amount_micros} out of range")))?;
        let spent: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE budget_ledger
            SET spent_micros = spent_micros + $2
            WHERE key = $1
            RETURNING spent_micros
            "#,
        )
        .bind(key)
        .bind(amount)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("add_spend", e))?;

        spent
            .map(|s| s.max(0) as u64)
            .ok_or_else(|| JobStoreError::Storage(format!("ledger {key} not opened")))
    }

    #[instrument(skip(self), err)]
    async fn mark_alert_sent(
        &self,
        key: &str,
        period_start: DateTime<Utc>,
        threshold: BudgetThreshold,
    ) -> Result<bool, JobStoreError> {
        let sql = match threshold {
            BudgetThreshold::Warning => {
                r#"
                UPDATE budget_ledger SET warning_alert_sent = TRUE
                WHERE key = $1 AND period_start = $2 AND NOT warning_alert_sent
                "#
            }
            BudgetThreshold::Exhausted => {
                r#"
                UPDATE budget_ledger SET exhausted_alert_sent = TRUE
                WHERE key = $1 AND period_start = $2 AND NOT exhausted_alert_sent
                "#
            }
        };
        let result = sqlx::query(sql)
            .bind(key)
            .bind(period_start)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_alert_sent", e))?;
        Ok(result.rows_affected() == 1)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            JobStoreError::Unavailable(format!("connection pool unavailable in {}", operation))
        }
        sqlx::Error::Io(e) => JobStoreError::Unavailable(format!("io error in {}: {}", operation, e)),
        sqlx::Error::Tls(e) => JobStoreError::Unavailable(format!("tls error in {}: {}", operation, e)),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            JobStoreError::Corrupt(format!("undecodable row in {}: {}", operation, err))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    queue: String,
    job_type: String,
    payload: serde_json::Value,
    state: String,
    attempt_count: i32,
    max_attempts: i32,
    priority_weight: i32,
    run_after: DateTime<Utc>,
    locked_by: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    last_error: Option<Json<LastError>>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    first_failed_at: Option<DateTime<Utc>>,
    history: Json<Vec<AttemptRecord>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            queue: row.try_get("queue")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            state: row.try_get("state")?,
            attempt_count: row.try_get("attempt_count")?,
            max_attempts: row.try_get("max_attempts")?,
            priority_weight: row.try_get("priority_weight")?,
            run_after: row.try_get("run_after")?,
            locked_by: row.try_get("locked_by")?,
            locked_at: row.try_get("locked_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            completed_at: row.try_get("completed_at")?,
            first_failed_at: row.try_get("first_failed_at")?,
            history: row.try_get("history")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |e: portaljobs_core::DomainError| {
            JobStoreError::Corrupt(format!("job {}: {}", row.id, e))
        };
        Ok(Job {
            id: JobId::from_uuid(row.id),
            queue: Queue::from_str(&row.queue).map_err(corrupt)?,
            job_type: row.job_type,
            payload: row.payload,
            state: JobState::from_str(&row.state).map_err(corrupt)?,
            attempt_count: row.attempt_count.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            priority_weight: row.priority_weight.max(0) as u32,
            run_after: row.run_after,
            locked_by: row.locked_by.map(WorkerId::new).transpose().map_err(corrupt)?,
            locked_at: row.locked_at,
            last_error: row.last_error.map(|j| j.0),
            created_at: row.created_at,
            completed_at: row.completed_at,
            first_failed_at: row.first_failed_at,
            history: row.history.0,
        })
    }
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let raw = JobRow::from_row(row).map_err(|e| map_sqlx_error("decode_job", e))?;
    Job::try_from(raw)
}

#[derive(Debug)]
struct LedgerRow {
    key: String,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    spent_micros: i64,
    warning_alert_sent: bool,
    exhausted_alert_sent: bool,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for LedgerRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(LedgerRow {
            key: row.try_get("key")?,
            period_start: row.try_get("period_start")?,
            period_end: row.try_get("period_end")?,
            spent_micros: row.try_get("spent_micros")?,
            warning_alert_sent: row.try_get("warning_alert_sent")?,
            exhausted_alert_sent: row.try_get("exhausted_alert_sent")?,
        })
    }
}

impl From<LedgerRow> for BudgetLedger {
    fn from(row: LedgerRow) -> Self {
        BudgetLedger {
            key: row.key,
            period_start: row.period_start,
            period_end: row.period_end,
            spent_micros: row.spent_micros.max(0) as u64,
            warning_alert_sent: row.warning_alert_sent,
            exhausted_alert_sent: row.exhausted_alert_sent,
        }
    }
}
