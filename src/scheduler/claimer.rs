//! # Job Claimer
//!
//! Atomic hand-off of one pending job to one worker, plus the completion
//! path that reports the worker's result back.
//!
//! ## At-most-one-winner
//!
//! Selection and claim are two steps with no lock held between them. The
//! claim is a conditional write whose precondition re-checks the selection
//! guard (`New`, unlocked), so under concurrent callers racing on the same
//! candidate at most one conditional write affects a row; everyone else
//! gets `None` back and re-polls. Losing the race is not an error.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::Result;
use crate::models::{Job, JobStatus, JobTiming};
use crate::scheduler::filter::{ClaimOrdering, JobFilter};
use crate::store::JobStore;

/// Worker-reported result for a claimed job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Success,
    Error(String),
}

pub struct JobClaimer<S: JobStore> {
    store: Arc<S>,
    config: QueueConfig,
}

impl<S: JobStore> JobClaimer<S> {
    pub fn new(store: Arc<S>, config: QueueConfig) -> Self {
        Self { store, config }
    }

    /// Claim the next eligible job, optionally scoped by worker/method.
    ///
    /// With `prioritize`, candidates order by priority (direction per
    /// configuration) then `when_at` ascending; otherwise by `when_at`
    /// alone. Returns `None` when nothing is eligible or another caller
    /// won the race; both mean "re-poll later".
    #[instrument(skip(self), fields(worker = ?filter.worker_name, method = ?filter.method))]
    pub async fn next_job(
        &self,
        filter: &JobFilter,
        prioritize: bool,
        run_id: Option<Uuid>,
    ) -> Result<Option<Job>> {
        let now = Utc::now();
        let ordering = ClaimOrdering::for_claim(prioritize, self.config.priority_direction);

        let Some(id) = self.store.select_next_eligible(filter, ordering, now).await? else {
            debug!("no eligible job");
            return Ok(None);
        };

        let affected = self.store.try_claim(id, now, run_id).await?;
        if affected != 1 {
            debug!(job_id = id, "claim lost to a concurrent caller");
            return Ok(None);
        }

        let job = self.store.find_job(id).await?;
        if let Some(job) = &job {
            info!(job_id = job.id, worker = %job.worker_name, method = %job.method, "claimed job");
            if self.config.record_timings {
                self.store
                    .record_timing(JobTiming::new(job.id, JobStatus::Running, now))
                    .await?;
            }
        }
        Ok(job)
    }

    /// Report a claimed job's outcome and apply the state-machine
    /// transition: success and exhausted-budget errors are terminal and
    /// archive the job; recoverable errors requeue it as `New`.
    ///
    /// The transitions are conditional on the job still being `Running`.
    /// If another path moved it first (stall recovery reclaiming the
    /// lease, typically), nothing is written and the job's authoritative
    /// status is returned instead of the computed one.
    #[instrument(skip(self, job, outcome), fields(job_id = job.id))]
    pub async fn complete_job(&self, job: &Job, outcome: JobOutcome) -> Result<JobStatus> {
        let now = Utc::now();
        let (status, affected) = match outcome {
            JobOutcome::Success => (
                JobStatus::Success,
                self.store.finish_success(job.id, now).await?,
            ),
            JobOutcome::Error(message) => {
                let next = job.status_after_error();
                let affected = if next == JobStatus::New {
                    self.store.requeue_errored(job.id, &message, now).await?
                } else {
                    self.store.finish_errored(job.id, next, &message, now).await?
                };
                (next, affected)
            }
        };

        if affected != 1 {
            let current = match self.store.job_status(job.id).await? {
                Some(current) => Some(current),
                None => self
                    .store
                    .find_archived_job(job.id)
                    .await?
                    .map(|a| a.status),
            };
            let current = current.unwrap_or(status);
            debug!(job_id = job.id, status = %current, "completion overtaken by a concurrent transition");
            return Ok(current);
        }

        if status.is_terminal() {
            self.store.archive_job(job.id, now).await?;
        }
        if self.config.record_timings {
            self.store
                .record_timing(JobTiming::new(job.id, status, now))
                .await?;
        }
        info!(job_id = job.id, status = %status, "job completed");
        Ok(status)
    }
}
