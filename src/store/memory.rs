//! In-process store backend.
//!
//! Serves two roles: a real backend for embedded/single-process queues,
//! and the contention harness for the scheduling protocols. Transactions
//! are snapshot/restore over the whole state; [`inject_commit_failures`]
//! and [`inject_write_failures`] let tests drive the bounded-retry paths
//! (dedup merge, stall-recovery fallback) deterministically.
//!
//! [`inject_commit_failures`]: MemoryJobStore::inject_commit_failures
//! [`inject_write_failures`]: MemoryJobStore::inject_write_failures

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use uuid::Uuid;

use crate::config::PriorityDirection;
use crate::error::{QueueError, Result};
use crate::models::{ArchivedJob, Job, JobId, JobStatus, JobTiming, NewJob};
use crate::scheduler::filter::{ClaimOrdering, JobFilter};

use super::{JobStore, SessionGuard, StatusRollupRow, StorageRealm};

#[derive(Debug, Clone, Default)]
struct StoreState {
    jobs: BTreeMap<JobId, Job>,
    archive: BTreeMap<JobId, ArchivedJob>,
    timings: Vec<JobTiming>,
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: Mutex<StoreState>,
    snapshot: Mutex<Option<StoreState>>,
    guard: SessionGuard,
    next_id: AtomicI64,
    fail_commits: AtomicU32,
    fail_writes: AtomicU32,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a transaction error. The failed
    /// commit keeps its snapshot, so a following `rollback` restores the
    /// pre-transaction state.
    pub fn inject_commit_failures(&self, n: u32) {
        self.fail_commits.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` conditional writes fail with a transaction error.
    pub fn inject_write_failures(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Number of timing records written so far.
    pub fn timing_count(&self) -> usize {
        self.state.lock().timings.len()
    }

    /// Number of live jobs, regardless of status.
    pub fn live_count(&self) -> usize {
        self.state.lock().jobs.len()
    }

    /// Number of archived jobs.
    pub fn archive_count(&self) -> usize {
        self.state.lock().archive.len()
    }

    /// Import an archive row directly, bypassing the live lifecycle. For
    /// restores and test setup; does not count as an insert for the
    /// session guard.
    pub fn seed_archived(&self, job: ArchivedJob) {
        let mut state = self.state.lock();
        self.next_id.fetch_max(job.id, Ordering::SeqCst);
        state.archive.insert(job.id, job);
    }

    fn check_write(&self) -> Result<()> {
        if take_one(&self.fail_writes) {
            return Err(QueueError::Transaction("injected write failure".into()));
        }
        Ok(())
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn compare_candidates(a: &Job, b: &Job, ordering: ClaimOrdering) -> std::cmp::Ordering {
    // Option's ordering puts None first, matching "null when_at means
    // eligible immediately".
    let by_when = a.when_at.cmp(&b.when_at).then(a.id.cmp(&b.id));
    match ordering {
        ClaimOrdering::Priority(PriorityDirection::Desc) => {
            b.priority.cmp(&a.priority).then(by_when)
        }
        ClaimOrdering::Priority(PriorityDirection::Asc) => {
            a.priority.cmp(&b.priority).then(by_when)
        }
        ClaimOrdering::WhenAt => by_when,
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_job(&self, job: NewJob) -> Result<Job> {
        self.guard.enter_insert()?;
        let now = Utc::now();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let job = Job {
            id,
            worker_name: job.worker_name,
            method: job.method,
            args: job.args,
            fingerprint: job.fingerprint,
            status: JobStatus::New,
            priority: job.priority,
            when_at: job.when_at,
            expires_at: job.expires_at,
            locked: None,
            locked_at: None,
            run_id: None,
            retries: 0,
            max_retries: job.max_retries,
            stalled_count: 0,
            max_stalled: job.max_stalled,
            error_count: 0,
            max_error: job.max_error,
            message: None,
            created_at: now,
            updated_at: now,
        };
        self.state.lock().jobs.insert(id, job.clone());
        Ok(job)
    }

    async fn find_job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.state.lock().jobs.get(&id).cloned())
    }

    async fn job_status(&self, id: JobId) -> Result<Option<JobStatus>> {
        Ok(self.state.lock().jobs.get(&id).map(|j| j.status))
    }

    async fn select_next_eligible(
        &self,
        filter: &JobFilter,
        ordering: ClaimOrdering,
        now: DateTime<Utc>,
    ) -> Result<Option<JobId>> {
        let state = self.state.lock();
        let best = state
            .jobs
            .values()
            .filter(|j| j.is_eligible(now) && filter.matches(j))
            .min_by(|a, b| compare_candidates(a, b, ordering));
        Ok(best.map(|j| j.id))
    }

    async fn try_claim(&self, id: JobId, now: DateTime<Utc>, run_id: Option<Uuid>) -> Result<u64> {
        let mut state = self.state.lock();
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::New && job.locked.is_none() => {
                job.locked = Some(true);
                job.locked_at = Some(now);
                job.status = JobStatus::Running;
                if run_id.is_some() {
                    job.run_id = run_id;
                }
                job.updated_at = now;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn finish_success(&self, id: JobId, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock();
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running => {
                job.status = JobStatus::Success;
                job.locked = None;
                job.locked_at = None;
                job.updated_at = now;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn requeue_errored(&self, id: JobId, message: &str, now: DateTime<Utc>) -> Result<u64> {
        self.check_write()?;
        let mut state = self.state.lock();
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running => {
                job.status = JobStatus::New;
                job.locked = None;
                job.locked_at = None;
                job.retries += 1;
                job.error_count += 1;
                job.message = Some(message.to_string());
                job.updated_at = now;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn finish_errored(
        &self,
        id: JobId,
        status: JobStatus,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.check_write()?;
        let mut state = self.state.lock();
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running => {
                job.status = status;
                job.locked = None;
                job.locked_at = None;
                job.retries += 1;
                job.error_count += 1;
                job.message = Some(message.to_string());
                job.updated_at = now;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn select_stalled(
        &self,
        filter: &JobFilter,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<JobId>> {
        let state = self.state.lock();
        let mut stalled: Vec<&Job> = state
            .jobs
            .values()
            .filter(|j| j.lease_expired(cutoff) && filter.matches(j))
            .collect();
        stalled.sort_by_key(|j| (j.locked_at, j.id));
        Ok(stalled
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|j| j.id)
            .collect())
    }

    async fn requeue_stalled(&self, id: JobId, now: DateTime<Utc>) -> Result<u64> {
        self.check_write()?;
        let mut state = self.state.lock();
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running => {
                job.status = JobStatus::New;
                job.locked = None;
                job.locked_at = None;
                job.retries += 1;
                job.stalled_count += 1;
                job.updated_at = now;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn finish_stalled(&self, id: JobId, status: JobStatus, now: DateTime<Utc>) -> Result<u64> {
        self.check_write()?;
        let mut state = self.state.lock();
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running => {
                job.status = status;
                job.locked = None;
                job.locked_at = None;
                job.retries += 1;
                job.stalled_count += 1;
                job.updated_at = now;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn expire_overdue(&self, filter: &JobFilter, now: DateTime<Utc>) -> Result<Vec<JobId>> {
        let mut state = self.state.lock();
        let mut expired = Vec::new();
        for job in state.jobs.values_mut() {
            if job.status == JobStatus::New
                && job.expires_at.is_some_and(|e| e <= now)
                && filter.matches(job)
            {
                job.status = JobStatus::Expired;
                job.locked = None;
                job.locked_at = None;
                job.updated_at = now;
                expired.push(job.id);
            }
        }
        Ok(expired)
    }

    async fn find_oldest_pending_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Job>> {
        let state = self.state.lock();
        let oldest = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::New && j.fingerprint == fingerprint)
            .min_by(|a, b| a.when_at.cmp(&b.when_at).then(a.id.cmp(&b.id)));
        Ok(oldest.cloned())
    }

    async fn update_pending_schedule(
        &self,
        id: JobId,
        priority: i32,
        when_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.check_write()?;
        let mut state = self.state.lock();
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::New && job.locked.is_none() => {
                job.priority = priority;
                job.when_at = when_at;
                job.updated_at = now;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn archive_job(&self, id: JobId, now: DateTime<Utc>) -> Result<u64> {
        self.check_write()?;
        let mut state = self.state.lock();
        let Some(job) = state.jobs.remove(&id) else {
            return Ok(0);
        };
        if !job.status.is_terminal() {
            state.jobs.insert(id, job);
            return Ok(0);
        }
        state
            .archive
            .insert(job.id, ArchivedJob::from_job(&job, now));
        Ok(1)
    }

    async fn find_archived_job(&self, id: JobId) -> Result<Option<ArchivedJob>> {
        Ok(self.state.lock().archive.get(&id).cloned())
    }

    async fn count_eligible(&self, filter: &JobFilter, now: DateTime<Utc>) -> Result<i64> {
        let state = self.state.lock();
        Ok(state
            .jobs
            .values()
            .filter(|j| j.is_eligible(now) && filter.matches(j))
            .count() as i64)
    }

    async fn count_by_status(
        &self,
        realm: StorageRealm,
        status: JobStatus,
        filter: &JobFilter,
    ) -> Result<i64> {
        let state = self.state.lock();
        let count = match realm {
            StorageRealm::Live => state
                .jobs
                .values()
                .filter(|j| j.status == status && filter.matches(j))
                .count(),
            StorageRealm::Archive => state
                .archive
                .values()
                .filter(|a| {
                    a.status == status
                        && filter.worker_name.as_deref().map_or(true, |w| a.worker_name == w)
                        && filter.method.as_deref().map_or(true, |m| a.method == m)
                })
                .count(),
        };
        Ok(count as i64)
    }

    async fn status_rollup(&self, realm: StorageRealm) -> Result<Vec<StatusRollupRow>> {
        let state = self.state.lock();
        let mut groups: HashMap<(String, String, JobStatus), i64> = HashMap::new();
        match realm {
            StorageRealm::Live => {
                for job in state.jobs.values() {
                    *groups
                        .entry((job.worker_name.clone(), job.method.clone(), job.status))
                        .or_insert(0) += 1;
                }
            }
            StorageRealm::Archive => {
                for job in state.archive.values() {
                    *groups
                        .entry((job.worker_name.clone(), job.method.clone(), job.status))
                        .or_insert(0) += 1;
                }
            }
        }
        Ok(groups
            .into_iter()
            .map(|((worker_name, method, status), count)| StatusRollupRow {
                worker_name,
                method,
                status,
                count,
            })
            .collect())
    }

    async fn delete_archived_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock();
        let before = state.archive.len();
        state.archive.retain(|_, a| a.updated_at >= cutoff);
        Ok((before - state.archive.len()) as u64)
    }

    async fn delete_erroneous(&self, filter: &JobFilter) -> Result<u64> {
        let mut state = self.state.lock();
        let before = state.jobs.len();
        state
            .jobs
            .retain(|_, j| !(j.status == JobStatus::Error && filter.matches(j)));
        Ok((before - state.jobs.len()) as u64)
    }

    async fn reset_erroneous(&self, filter: &JobFilter, now: DateTime<Utc>) -> Result<u64> {
        self.guard.enter_reset()?;
        let mut state = self.state.lock();
        let matching: Vec<i64> = state
            .archive
            .values()
            .filter(|a| {
                a.status == JobStatus::Error
                    && filter.worker_name.as_deref().map_or(true, |w| a.worker_name == w)
                    && filter.method.as_deref().map_or(true, |m| a.method == m)
            })
            .map(|a| a.id)
            .collect();

        let mut reset = 0u64;
        for archived_id in matching {
            let Some(archived) = state.archive.remove(&archived_id) else {
                continue;
            };
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            // Schedule, budgets, and counters survive the round-trip; only
            // the lease and run identity are cleared for the fresh attempt.
            state.jobs.insert(
                id,
                Job {
                    id,
                    worker_name: archived.worker_name,
                    method: archived.method,
                    args: archived.args,
                    fingerprint: archived.fingerprint,
                    status: JobStatus::New,
                    priority: archived.priority,
                    when_at: archived.when_at,
                    expires_at: archived.expires_at,
                    locked: None,
                    locked_at: None,
                    run_id: None,
                    retries: archived.retries,
                    max_retries: archived.max_retries,
                    stalled_count: archived.stalled_count,
                    max_stalled: archived.max_stalled,
                    error_count: archived.error_count,
                    max_error: archived.max_error,
                    message: archived.message,
                    created_at: archived.created_at,
                    updated_at: now,
                },
            );
            reset += 1;
        }
        Ok(reset)
    }

    async fn begin(&self) -> Result<()> {
        let mut snapshot = self.snapshot.lock();
        if snapshot.is_some() {
            return Err(QueueError::Transaction("transaction already active".into()));
        }
        *snapshot = Some(self.state.lock().clone());
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        if take_one(&self.fail_commits) {
            // Snapshot stays in place so the caller's rollback restores it.
            return Err(QueueError::Transaction("injected commit failure".into()));
        }
        self.snapshot.lock().take();
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        if let Some(snapshot) = self.snapshot.lock().take() {
            *self.state.lock() = snapshot;
        }
        Ok(())
    }

    async fn record_timing(&self, timing: JobTiming) -> Result<()> {
        self.state.lock().timings.push(timing);
        Ok(())
    }
}
