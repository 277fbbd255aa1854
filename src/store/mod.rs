//! Storage boundary of the scheduling core.
//!
//! The core never talks to a database directly; every component works
//! against [`JobStore`], which exposes exactly the capabilities the
//! scheduling protocols need: predicate-filtered selection with two-key
//! ordering, conditional updates that report affected-row counts, and
//! optional transactions. Mutual exclusion between workers comes entirely
//! from the conditional writes, never from in-process locks.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::models::{ArchivedJob, Job, JobId, JobStatus, JobTiming, NewJob};
use crate::scheduler::filter::{ClaimOrdering, JobFilter};

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

/// Which side of the archival boundary an operation reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageRealm {
    Live,
    Archive,
}

/// One group in a status rollup: jobs for a worker/method pair in one
/// status, with their count.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusRollupRow {
    pub worker_name: String,
    pub method: String,
    pub status: JobStatus,
    pub count: i64,
}

/// Per-session exclusivity between "insert new work" and "reset the
/// queue". The backend may cache a prepared write plan that is
/// inconsistent across that combination, so mixing the two on one session
/// fails fast instead of corrupting state.
#[derive(Debug, Default)]
pub struct SessionGuard {
    state: Mutex<GuardState>,
}

#[derive(Debug, Default)]
struct GuardState {
    insert_called: bool,
    reset_called: bool,
}

impl SessionGuard {
    /// Record an insert, failing if a reset already ran on this session.
    pub fn enter_insert(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.reset_called {
            return Err(QueueError::OperationSequence(
                "cannot insert jobs and reset jobs on the same store session".into(),
            ));
        }
        state.insert_called = true;
        Ok(())
    }

    /// Record a reset, failing if an insert already ran on this session.
    pub fn enter_reset(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.insert_called {
            return Err(QueueError::OperationSequence(
                "cannot reset jobs and insert jobs on the same store session".into(),
            ));
        }
        state.reset_called = true;
        Ok(())
    }
}

/// Storage operations consumed by the scheduling core.
///
/// Conditional updates return the number of affected rows; zero means a
/// competing writer got there first, which callers treat as a retry
/// signal, not an error.
#[async_trait]
pub trait JobStore: Send + Sync {
    // -- producers ---------------------------------------------------------

    /// Insert a new job in state `New`. Guarded against reset on the same
    /// session.
    async fn insert_job(&self, job: NewJob) -> Result<Job>;

    // -- single-row reads --------------------------------------------------

    async fn find_job(&self, id: JobId) -> Result<Option<Job>>;

    /// Authoritative current status, read directly from the store. Stall
    /// recovery uses this instead of trusting its candidate snapshot.
    async fn job_status(&self, id: JobId) -> Result<Option<JobStatus>>;

    // -- claim protocol ----------------------------------------------------

    /// Id of the single best eligible job at `now`, or `None`.
    async fn select_next_eligible(
        &self,
        filter: &JobFilter,
        ordering: ClaimOrdering,
        now: DateTime<Utc>,
    ) -> Result<Option<JobId>>;

    /// Conditionally claim `id`: set `locked`/`locked_at`/`Running` (and
    /// `run_id`) only where the row is still unlocked and `New`.
    async fn try_claim(&self, id: JobId, now: DateTime<Utc>, run_id: Option<Uuid>) -> Result<u64>;

    // -- completion path ---------------------------------------------------

    /// `Running` -> `Success`, lock cleared.
    async fn finish_success(&self, id: JobId, now: DateTime<Utc>) -> Result<u64>;

    /// `Running` -> `New` after a worker error: lock cleared, error and
    /// retry counters incremented, message recorded.
    async fn requeue_errored(&self, id: JobId, message: &str, now: DateTime<Utc>) -> Result<u64>;

    /// `Running` -> terminal error state (`Error`/`MaxError`/`MaxRetries`):
    /// lock cleared, counters incremented, message recorded.
    async fn finish_errored(
        &self,
        id: JobId,
        status: JobStatus,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    // -- stall recovery ----------------------------------------------------

    /// Ids of `Running` jobs whose lease started before `cutoff`.
    async fn select_stalled(
        &self,
        filter: &JobFilter,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<JobId>>;

    /// `Running` -> `New` for a reclaimed lease: lock cleared, stalled and
    /// retry counters incremented.
    async fn requeue_stalled(&self, id: JobId, now: DateTime<Utc>) -> Result<u64>;

    /// `Running` -> terminal stall state (`MaxStalled`/`MaxRetries`).
    async fn finish_stalled(&self, id: JobId, status: JobStatus, now: DateTime<Utc>) -> Result<u64>;

    // -- expiry ------------------------------------------------------------

    /// `New` -> `Expired` for every live job whose `expires_at` has
    /// elapsed, returning the affected ids.
    async fn expire_overdue(&self, filter: &JobFilter, now: DateTime<Utc>) -> Result<Vec<JobId>>;

    // -- dedup merge -------------------------------------------------------

    /// The single oldest (`when_at` ascending) live `New` job with this
    /// fingerprint.
    async fn find_oldest_pending_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Job>>;

    /// In-place schedule update for a pending job, conditional on it still
    /// being `New` and unlocked.
    async fn update_pending_schedule(
        &self,
        id: JobId,
        priority: i32,
        when_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    // -- archival ----------------------------------------------------------

    /// Move a terminal live job into the archive. Affects zero rows if the
    /// job is gone or not terminal.
    async fn archive_job(&self, id: JobId, now: DateTime<Utc>) -> Result<u64>;

    async fn find_archived_job(&self, id: JobId) -> Result<Option<ArchivedJob>>;

    // -- reporting ---------------------------------------------------------

    /// Count of live jobs satisfying the full eligibility predicate.
    async fn count_eligible(&self, filter: &JobFilter, now: DateTime<Utc>) -> Result<i64>;

    /// Count of jobs in one status within one realm.
    async fn count_by_status(
        &self,
        realm: StorageRealm,
        status: JobStatus,
        filter: &JobFilter,
    ) -> Result<i64>;

    /// Counts grouped by worker, method, and status within one realm.
    async fn status_rollup(&self, realm: StorageRealm) -> Result<Vec<StatusRollupRow>>;

    // -- pruning / reset ---------------------------------------------------

    /// Delete archive rows with `updated_at < cutoff`.
    async fn delete_archived_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Delete live jobs stuck in `Error`.
    async fn delete_erroneous(&self, filter: &JobFilter) -> Result<u64>;

    /// Move archived `Error` jobs back into the live set as fresh `New`
    /// rows. Guarded against insert on the same session.
    async fn reset_erroneous(&self, filter: &JobFilter, now: DateTime<Utc>) -> Result<u64>;

    // -- transactions ------------------------------------------------------

    fn supports_transactions(&self) -> bool {
        true
    }

    async fn begin(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;

    // -- timings -----------------------------------------------------------

    async fn record_timing(&self, timing: JobTiming) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_rejects_insert_after_reset() {
        let guard = SessionGuard::default();
        guard.enter_reset().unwrap();
        guard.enter_reset().unwrap();
        assert!(matches!(
            guard.enter_insert(),
            Err(QueueError::OperationSequence(_))
        ));
    }

    #[test]
    fn guard_rejects_reset_after_insert() {
        let guard = SessionGuard::default();
        guard.enter_insert().unwrap();
        guard.enter_insert().unwrap();
        assert!(matches!(
            guard.enter_reset(),
            Err(QueueError::OperationSequence(_))
        ));
    }
}
