//! Postgres store backend.
//!
//! All mutual exclusion is expressed as conditional `UPDATE ... WHERE`
//! statements whose affected-row count tells the caller whether it won;
//! nothing here takes advisory locks or `FOR UPDATE` on the claim path.
//! Optional filters are appended through `QueryBuilder` from a
//! [`JobFilter`] value so every operation scopes identically.
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE jobq_jobs (
//!   id BIGSERIAL PRIMARY KEY,
//!   worker_name TEXT NOT NULL,
//!   method TEXT NOT NULL,
//!   args JSONB NOT NULL,
//!   fingerprint TEXT NOT NULL,
//!   status TEXT NOT NULL,
//!   priority INTEGER NOT NULL,
//!   when_at TIMESTAMPTZ,
//!   expires_at TIMESTAMPTZ,
//!   locked BOOLEAN,
//!   locked_at TIMESTAMPTZ,
//!   run_id UUID,
//!   -- retry counters and budgets, message, created_at, updated_at
//! );
//! ```
//!
//! `jobq_archived_jobs` mirrors the full column set plus `archived_at`, so
//! resets restore a job without loss; `jobq_job_timings` holds the optional
//! timing records.
//! [`PgJobStore::run_migrations`] creates all three.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::models::{ArchivedJob, Job, JobId, JobStatus, JobTiming, NewJob};
use crate::scheduler::filter::{ClaimOrdering, JobFilter};

use super::{JobStore, SessionGuard, StatusRollupRow, StorageRealm};
use crate::config::PriorityDirection;

const JOB_COLUMNS: &str = "id, worker_name, method, args, fingerprint, status, priority, \
     when_at, expires_at, locked, locked_at, run_id, retries, max_retries, stalled_count, \
     max_stalled, error_count, max_error, message, created_at, updated_at";

const ARCHIVED_COLUMNS: &str = "id, worker_name, method, args, fingerprint, status, priority, \
     when_at, expires_at, locked, locked_at, run_id, retries, max_retries, stalled_count, \
     max_stalled, error_count, max_error, message, created_at, updated_at, archived_at";

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS jobq_jobs (
        id BIGSERIAL PRIMARY KEY,
        worker_name TEXT NOT NULL,
        method TEXT NOT NULL,
        args JSONB NOT NULL,
        fingerprint TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'new',
        priority INTEGER NOT NULL DEFAULT 0,
        when_at TIMESTAMPTZ,
        expires_at TIMESTAMPTZ,
        locked BOOLEAN,
        locked_at TIMESTAMPTZ,
        run_id UUID,
        retries INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER,
        stalled_count INTEGER NOT NULL DEFAULT 0,
        max_stalled INTEGER,
        error_count INTEGER NOT NULL DEFAULT 0,
        max_error INTEGER,
        message TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS jobq_jobs_claim_idx
        ON jobq_jobs (status, priority, when_at) WHERE locked IS NULL",
    "CREATE INDEX IF NOT EXISTS jobq_jobs_fingerprint_idx
        ON jobq_jobs (fingerprint) WHERE status = 'new'",
    "CREATE TABLE IF NOT EXISTS jobq_archived_jobs (
        id BIGINT PRIMARY KEY,
        worker_name TEXT NOT NULL,
        method TEXT NOT NULL,
        args JSONB NOT NULL,
        fingerprint TEXT NOT NULL,
        status TEXT NOT NULL,
        priority INTEGER NOT NULL,
        when_at TIMESTAMPTZ,
        expires_at TIMESTAMPTZ,
        locked BOOLEAN,
        locked_at TIMESTAMPTZ,
        run_id UUID,
        retries INTEGER NOT NULL,
        max_retries INTEGER,
        stalled_count INTEGER NOT NULL,
        max_stalled INTEGER,
        error_count INTEGER NOT NULL,
        max_error INTEGER,
        message TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        archived_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS jobq_archived_jobs_updated_idx
        ON jobq_archived_jobs (updated_at)",
    "CREATE TABLE IF NOT EXISTS jobq_job_timings (
        job_id BIGINT NOT NULL,
        status TEXT NOT NULL,
        recorded_at TIMESTAMPTZ NOT NULL
    )",
];

/// Runs the query on the active transaction when one is open, otherwise on
/// the pool.
macro_rules! on_session {
    ($self:expr, $query:expr, $method:ident) => {{
        let mut tx = $self.tx.lock().await;
        match tx.as_mut() {
            Some(tx) => $query.$method(&mut **tx).await,
            None => $query.$method(&$self.pool).await,
        }
    }};
}

pub struct PgJobStore {
    pool: PgPool,
    guard: SessionGuard,
    tx: tokio::sync::Mutex<Option<Transaction<'static, Postgres>>>,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            guard: SessionGuard::default(),
            tx: tokio::sync::Mutex::new(None),
        }
    }

    /// Create the queue tables and indexes if they do not exist yet.
    pub async fn run_migrations(&self) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, filter: &JobFilter) {
        if let Some(worker_name) = &filter.worker_name {
            builder.push(" AND worker_name = ");
            builder.push_bind(worker_name.clone());
        }
        if let Some(method) = &filter.method {
            builder.push(" AND method = ");
            builder.push_bind(method.clone());
        }
    }

    /// Pushes the eligibility predicate shared by claim selection and the
    /// live count.
    fn push_eligibility(builder: &mut QueryBuilder<'_, Postgres>, filter: &JobFilter, now: DateTime<Utc>) {
        builder.push(" WHERE status = 'new' AND locked IS NULL AND (when_at IS NULL OR when_at <= ");
        builder.push_bind(now);
        builder.push(") AND (expires_at IS NULL OR expires_at > ");
        builder.push_bind(now);
        builder.push(")");
        Self::push_filter(builder, filter);
    }

    fn realm_table(realm: StorageRealm) -> &'static str {
        match realm {
            StorageRealm::Live => "jobq_jobs",
            StorageRealm::Archive => "jobq_archived_jobs",
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert_job(&self, job: NewJob) -> Result<Job> {
        self.guard.enter_insert()?;
        let now = Utc::now();
        let sql = format!(
            "INSERT INTO jobq_jobs (worker_name, method, args, fingerprint, status, priority, \
                 when_at, expires_at, max_retries, max_stalled, max_error, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, 'new', $5, $6, $7, $8, $9, $10, $11, $11) \
             RETURNING {JOB_COLUMNS}"
        );
        let query = sqlx::query_as::<_, JobRow>(&sql)
        .bind(job.worker_name)
        .bind(job.method)
        .bind(job.args)
        .bind(job.fingerprint)
        .bind(job.priority)
        .bind(job.when_at)
        .bind(job.expires_at)
        .bind(job.max_retries)
        .bind(job.max_stalled)
        .bind(job.max_error)
        .bind(now);
        let row: JobRow = on_session!(self, query, fetch_one)?;
        row.try_into()
    }

    async fn find_job(&self, id: JobId) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobq_jobs WHERE id = $1");
        let query = sqlx::query_as::<_, JobRow>(&sql).bind(id);
        let row: Option<JobRow> = on_session!(self, query, fetch_optional)?;
        row.map(Job::try_from).transpose()
    }

    async fn job_status(&self, id: JobId) -> Result<Option<JobStatus>> {
        let query =
            sqlx::query_scalar::<_, String>("SELECT status FROM jobq_jobs WHERE id = $1").bind(id);
        let status: Option<String> = on_session!(self, query, fetch_optional)?;
        status
            .map(|s| s.parse().map_err(QueueError::Validation))
            .transpose()
    }

    async fn select_next_eligible(
        &self,
        filter: &JobFilter,
        ordering: ClaimOrdering,
        now: DateTime<Utc>,
    ) -> Result<Option<JobId>> {
        let mut builder = QueryBuilder::new("SELECT id FROM jobq_jobs");
        Self::push_eligibility(&mut builder, filter, now);
        builder.push(match ordering {
            ClaimOrdering::Priority(PriorityDirection::Desc) => {
                " ORDER BY priority DESC, when_at ASC NULLS FIRST, id ASC"
            }
            ClaimOrdering::Priority(PriorityDirection::Asc) => {
                " ORDER BY priority ASC, when_at ASC NULLS FIRST, id ASC"
            }
            ClaimOrdering::WhenAt => " ORDER BY when_at ASC NULLS FIRST, id ASC",
        });
        builder.push(" LIMIT 1");

        let query = builder.build_query_scalar::<JobId>();
        let id = on_session!(self, query, fetch_optional)?;
        Ok(id)
    }

    async fn try_claim(&self, id: JobId, now: DateTime<Utc>, run_id: Option<Uuid>) -> Result<u64> {
        // The WHERE clause re-checks the selection guard; this is the whole
        // at-most-one-winner mechanism.
        let mut builder = QueryBuilder::new("UPDATE jobq_jobs SET locked = TRUE, locked_at = ");
        builder.push_bind(now);
        builder.push(", status = 'running', updated_at = ");
        builder.push_bind(now);
        if let Some(run_id) = run_id {
            builder.push(", run_id = ");
            builder.push_bind(run_id);
        }
        builder.push(" WHERE id = ");
        builder.push_bind(id);
        builder.push(" AND locked IS NULL AND status = 'new'");

        let query = builder.build();
        let result = on_session!(self, query, execute)?;
        Ok(result.rows_affected())
    }

    async fn finish_success(&self, id: JobId, now: DateTime<Utc>) -> Result<u64> {
        let query = sqlx::query(
            "UPDATE jobq_jobs SET status = 'success', locked = NULL, locked_at = NULL, \
                 updated_at = $2 \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(now);
        let result = on_session!(self, query, execute)?;
        Ok(result.rows_affected())
    }

    async fn requeue_errored(&self, id: JobId, message: &str, now: DateTime<Utc>) -> Result<u64> {
        let query = sqlx::query(
            "UPDATE jobq_jobs SET status = 'new', locked = NULL, locked_at = NULL, \
                 retries = retries + 1, error_count = error_count + 1, message = $2, updated_at = $3 \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(message)
        .bind(now);
        let result = on_session!(self, query, execute)?;
        Ok(result.rows_affected())
    }

    async fn finish_errored(
        &self,
        id: JobId,
        status: JobStatus,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let query = sqlx::query(
            "UPDATE jobq_jobs SET status = $2, locked = NULL, locked_at = NULL, \
                 retries = retries + 1, error_count = error_count + 1, message = $3, updated_at = $4 \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(message)
        .bind(now);
        let result = on_session!(self, query, execute)?;
        Ok(result.rows_affected())
    }

    async fn select_stalled(
        &self,
        filter: &JobFilter,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<JobId>> {
        let mut builder = QueryBuilder::new(
            "SELECT id FROM jobq_jobs WHERE status = 'running' AND locked IS NOT NULL AND locked_at < ",
        );
        builder.push_bind(cutoff);
        Self::push_filter(&mut builder, filter);
        builder.push(" ORDER BY locked_at ASC, id ASC LIMIT ");
        builder.push_bind(limit);

        let query = builder.build_query_scalar::<JobId>();
        let ids = on_session!(self, query, fetch_all)?;
        Ok(ids)
    }

    async fn requeue_stalled(&self, id: JobId, now: DateTime<Utc>) -> Result<u64> {
        let query = sqlx::query(
            "UPDATE jobq_jobs SET status = 'new', locked = NULL, locked_at = NULL, \
                 retries = retries + 1, stalled_count = stalled_count + 1, updated_at = $2 \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(now);
        let result = on_session!(self, query, execute)?;
        Ok(result.rows_affected())
    }

    async fn finish_stalled(&self, id: JobId, status: JobStatus, now: DateTime<Utc>) -> Result<u64> {
        let query = sqlx::query(
            "UPDATE jobq_jobs SET status = $2, locked = NULL, locked_at = NULL, \
                 retries = retries + 1, stalled_count = stalled_count + 1, updated_at = $3 \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(now);
        let result = on_session!(self, query, execute)?;
        Ok(result.rows_affected())
    }

    async fn expire_overdue(&self, filter: &JobFilter, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let mut builder = QueryBuilder::new(
            "UPDATE jobq_jobs SET status = 'expired', updated_at = ",
        );
        builder.push_bind(now);
        builder.push(" WHERE status = 'new' AND expires_at IS NOT NULL AND expires_at <= ");
        builder.push_bind(now);
        Self::push_filter(&mut builder, filter);
        builder.push(" RETURNING id");

        let query = builder.build_query_scalar::<JobId>();
        let ids = on_session!(self, query, fetch_all)?;
        Ok(ids)
    }

    async fn find_oldest_pending_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobq_jobs \
             WHERE fingerprint = $1 AND status = 'new' \
             ORDER BY when_at ASC NULLS FIRST, id ASC LIMIT 1"
        );
        let query = sqlx::query_as::<_, JobRow>(&sql).bind(fingerprint);
        let row: Option<JobRow> = on_session!(self, query, fetch_optional)?;
        row.map(Job::try_from).transpose()
    }

    async fn update_pending_schedule(
        &self,
        id: JobId,
        priority: i32,
        when_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let query = sqlx::query(
            "UPDATE jobq_jobs SET priority = $2, when_at = $3, updated_at = $4 \
             WHERE id = $1 AND status = 'new' AND locked IS NULL",
        )
        .bind(id)
        .bind(priority)
        .bind(when_at)
        .bind(now);
        let result = on_session!(self, query, execute)?;
        Ok(result.rows_affected())
    }

    async fn archive_job(&self, id: JobId, now: DateTime<Utc>) -> Result<u64> {
        let sql = format!(
            "WITH moved AS ( \
                 DELETE FROM jobq_jobs \
                 WHERE id = $1 AND status NOT IN ('new', 'running') \
                 RETURNING {JOB_COLUMNS} \
             ) \
             INSERT INTO jobq_archived_jobs ({ARCHIVED_COLUMNS}) \
             SELECT {JOB_COLUMNS}, $2 \
             FROM moved"
        );
        let query = sqlx::query(&sql).bind(id).bind(now);
        let result = on_session!(self, query, execute)?;
        Ok(result.rows_affected())
    }

    async fn find_archived_job(&self, id: JobId) -> Result<Option<ArchivedJob>> {
        let sql = format!("SELECT {ARCHIVED_COLUMNS} FROM jobq_archived_jobs WHERE id = $1");
        let query = sqlx::query_as::<_, ArchivedJobRow>(&sql).bind(id);
        let row: Option<ArchivedJobRow> = on_session!(self, query, fetch_optional)?;
        row.map(ArchivedJob::try_from).transpose()
    }

    async fn count_eligible(&self, filter: &JobFilter, now: DateTime<Utc>) -> Result<i64> {
        let mut builder = QueryBuilder::new("SELECT COUNT(*) FROM jobq_jobs");
        Self::push_eligibility(&mut builder, filter, now);
        let query = builder.build_query_scalar::<i64>();
        let count = on_session!(self, query, fetch_one)?;
        Ok(count)
    }

    async fn count_by_status(
        &self,
        realm: StorageRealm,
        status: JobStatus,
        filter: &JobFilter,
    ) -> Result<i64> {
        let mut builder = QueryBuilder::new(format!(
            "SELECT COUNT(*) FROM {} WHERE status = ",
            Self::realm_table(realm)
        ));
        builder.push_bind(status.as_str());
        Self::push_filter(&mut builder, filter);
        let query = builder.build_query_scalar::<i64>();
        let count = on_session!(self, query, fetch_one)?;
        Ok(count)
    }

    async fn status_rollup(&self, realm: StorageRealm) -> Result<Vec<StatusRollupRow>> {
        let sql = format!(
            "SELECT worker_name, method, status, COUNT(*) FROM {} \
             GROUP BY worker_name, method, status",
            Self::realm_table(realm)
        );
        let query = sqlx::query_as::<_, (String, String, String, i64)>(&sql);
        let rows = on_session!(self, query, fetch_all)?;
        rows.into_iter()
            .map(|(worker_name, method, status, count)| {
                Ok(StatusRollupRow {
                    worker_name,
                    method,
                    status: status.parse().map_err(QueueError::Validation)?,
                    count,
                })
            })
            .collect()
    }

    async fn delete_archived_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let query =
            sqlx::query("DELETE FROM jobq_archived_jobs WHERE updated_at < $1").bind(cutoff);
        let result = on_session!(self, query, execute)?;
        Ok(result.rows_affected())
    }

    async fn delete_erroneous(&self, filter: &JobFilter) -> Result<u64> {
        let mut builder = QueryBuilder::new("DELETE FROM jobq_jobs WHERE status = 'error'");
        Self::push_filter(&mut builder, filter);
        let query = builder.build();
        let result = on_session!(self, query, execute)?;
        Ok(result.rows_affected())
    }

    async fn reset_erroneous(&self, filter: &JobFilter, now: DateTime<Utc>) -> Result<u64> {
        self.guard.enter_reset()?;
        let mut builder = QueryBuilder::new(
            "WITH moved AS ( \
                 DELETE FROM jobq_archived_jobs WHERE status = 'error'",
        );
        Self::push_filter(&mut builder, filter);
        // Schedule, budgets, and counters come back out of the archive;
        // the lease and run identity start clear for the fresh attempt.
        builder.push(
            " RETURNING worker_name, method, args, fingerprint, priority, when_at, expires_at, \
                        retries, max_retries, stalled_count, max_stalled, error_count, max_error, \
                        message, created_at \
             ) \
             INSERT INTO jobq_jobs (worker_name, method, args, fingerprint, status, priority, \
                 when_at, expires_at, retries, max_retries, stalled_count, max_stalled, \
                 error_count, max_error, message, created_at, updated_at) \
             SELECT worker_name, method, args, fingerprint, 'new', priority, when_at, expires_at, \
                    retries, max_retries, stalled_count, max_stalled, error_count, max_error, \
                    message, created_at, ",
        );
        builder.push_bind(now);
        builder.push(" FROM moved");

        let query = builder.build();
        let result = on_session!(self, query, execute)?;
        Ok(result.rows_affected())
    }

    async fn begin(&self) -> Result<()> {
        let mut tx = self.tx.lock().await;
        if tx.is_some() {
            return Err(QueueError::Transaction(
                "transaction already active on this session".into(),
            ));
        }
        *tx = Some(
            self.pool
                .begin()
                .await
                .map_err(|e| QueueError::Transaction(e.to_string()))?,
        );
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let tx = self.tx.lock().await.take();
        match tx {
            Some(tx) => tx
                .commit()
                .await
                .map_err(|e| QueueError::Transaction(e.to_string())),
            None => Ok(()),
        }
    }

    async fn rollback(&self) -> Result<()> {
        let tx = self.tx.lock().await.take();
        match tx {
            Some(tx) => tx
                .rollback()
                .await
                .map_err(|e| QueueError::Transaction(e.to_string())),
            None => Ok(()),
        }
    }

    async fn record_timing(&self, timing: JobTiming) -> Result<()> {
        let query =
            sqlx::query("INSERT INTO jobq_job_timings (job_id, status, recorded_at) VALUES ($1, $2, $3)")
                .bind(timing.job_id)
                .bind(timing.status.as_str())
                .bind(timing.recorded_at);
        on_session!(self, query, execute)?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    worker_name: String,
    method: String,
    args: serde_json::Value,
    fingerprint: String,
    status: String,
    priority: i32,
    when_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    locked: Option<bool>,
    locked_at: Option<DateTime<Utc>>,
    run_id: Option<Uuid>,
    retries: i32,
    max_retries: Option<i32>,
    stalled_count: i32,
    max_stalled: Option<i32>,
    error_count: i32,
    max_error: Option<i32>,
    message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self> {
        let status = row.status.parse().map_err(QueueError::Validation)?;
        Ok(Job {
            id: row.id,
            worker_name: row.worker_name,
            method: row.method,
            args: row.args,
            fingerprint: row.fingerprint,
            status,
            priority: row.priority,
            when_at: row.when_at,
            expires_at: row.expires_at,
            locked: row.locked,
            locked_at: row.locked_at,
            run_id: row.run_id,
            retries: row.retries,
            max_retries: row.max_retries,
            stalled_count: row.stalled_count,
            max_stalled: row.max_stalled,
            error_count: row.error_count,
            max_error: row.max_error,
            message: row.message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ArchivedJobRow {
    id: i64,
    worker_name: String,
    method: String,
    args: serde_json::Value,
    fingerprint: String,
    status: String,
    priority: i32,
    when_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    locked: Option<bool>,
    locked_at: Option<DateTime<Utc>>,
    run_id: Option<Uuid>,
    retries: i32,
    max_retries: Option<i32>,
    stalled_count: i32,
    max_stalled: Option<i32>,
    error_count: i32,
    max_error: Option<i32>,
    message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    archived_at: DateTime<Utc>,
}

impl TryFrom<ArchivedJobRow> for ArchivedJob {
    type Error = QueueError;

    fn try_from(row: ArchivedJobRow) -> Result<Self> {
        let status = row.status.parse().map_err(QueueError::Validation)?;
        Ok(ArchivedJob {
            id: row.id,
            worker_name: row.worker_name,
            method: row.method,
            args: row.args,
            fingerprint: row.fingerprint,
            status,
            priority: row.priority,
            when_at: row.when_at,
            expires_at: row.expires_at,
            locked: row.locked,
            locked_at: row.locked_at,
            run_id: row.run_id,
            retries: row.retries,
            max_retries: row.max_retries,
            stalled_count: row.stalled_count,
            max_stalled: row.max_stalled,
            error_count: row.error_count,
            max_error: row.max_error,
            message: row.message,
            created_at: row.created_at,
            updated_at: row.updated_at,
            archived_at: row.archived_at,
        })
    }
}
