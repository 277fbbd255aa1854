//! # Stall Recovery
//!
//! Reclaims leases from workers that died or hung. Candidates are jobs
//! still `Running` with a lease older than the staleness cutoff; each one
//! is re-checked against the store's authoritative status before anything
//! happens to it, because its worker may have finished between candidate
//! selection and processing.
//!
//! The batch runs inside one store transaction where the backend supports
//! them. On any failure the transaction rolls back and the whole batch is
//! reprocessed exactly once without the wrapper, so a transient conflict
//! does not silently drop a recovery cycle; a second failure propagates.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::models::{JobId, JobStatus};
use crate::scheduler::filter::JobFilter;
use crate::store::JobStore;

/// What one recovery cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Candidates looked at.
    pub examined: usize,
    /// Requeued as `New` with budget remaining.
    pub requeued: usize,
    /// Escalated to a terminal stall state and archived.
    pub failed: usize,
    /// No longer `Running` by the time they were processed.
    pub skipped: usize,
}

pub struct StallRecovery<S: JobStore> {
    store: Arc<S>,
}

impl<S: JobStore> StallRecovery<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Select stalled candidates (lease older than `lease_older_than`)
    /// and recover them.
    #[instrument(skip(self), fields(worker = ?filter.worker_name))]
    pub async fn run(
        &self,
        filter: &JobFilter,
        lease_older_than: Duration,
        limit: i64,
    ) -> Result<RecoveryReport> {
        let cutoff = Utc::now() - lease_older_than;
        let candidates = self.store.select_stalled(filter, cutoff, limit).await?;
        debug!(candidates = candidates.len(), "selected stall candidates");
        self.recover(&candidates).await
    }

    /// Process a candidate batch: transactional first pass, one
    /// non-transactional fallback on failure.
    pub async fn recover(&self, candidates: &[JobId]) -> Result<RecoveryReport> {
        if candidates.is_empty() {
            return Ok(RecoveryReport::default());
        }
        if !self.store.supports_transactions() {
            return self.process_batch(candidates).await;
        }

        self.store.begin().await?;
        let report = match self.process_batch(candidates).await {
            Ok(report) => match self.store.commit().await {
                Ok(()) => Ok(report),
                Err(err) => {
                    let _ = self.store.rollback().await;
                    warn!(error = %err, "stalled batch commit failed, reprocessing without transaction");
                    self.process_batch(candidates).await
                }
            },
            Err(err) => {
                let _ = self.store.rollback().await;
                warn!(error = %err, "stalled batch failed, reprocessing without transaction");
                self.process_batch(candidates).await
            }
        }?;

        info!(
            examined = report.examined,
            requeued = report.requeued,
            failed = report.failed,
            skipped = report.skipped,
            "stall recovery cycle finished"
        );
        Ok(report)
    }

    async fn process_batch(&self, candidates: &[JobId]) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let now = Utc::now();

        for &id in candidates {
            report.examined += 1;

            // Authoritative re-read; the candidate snapshot may be stale.
            match self.store.job_status(id).await? {
                Some(JobStatus::Running) => {}
                _ => {
                    report.skipped += 1;
                    continue;
                }
            }
            let Some(job) = self.store.find_job(id).await? else {
                report.skipped += 1;
                continue;
            };

            let next = job.status_after_stall();
            if next == JobStatus::New {
                if self.store.requeue_stalled(id, now).await? == 1 {
                    debug!(job_id = id, stalled_count = job.stalled_count + 1, "requeued stalled job");
                    report.requeued += 1;
                } else {
                    report.skipped += 1;
                }
            } else if self.store.finish_stalled(id, next, now).await? == 1 {
                self.store.archive_job(id, now).await?;
                warn!(job_id = id, status = %next, "stalled job out of budget, archived");
                report.failed += 1;
            } else {
                report.skipped += 1;
            }
        }
        Ok(report)
    }
}
