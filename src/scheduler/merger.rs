//! # Batch Merger
//!
//! Folds a newly submitted job into an already-pending job with the same
//! fingerprint instead of enqueuing a duplicate. The merged job keeps the
//! more urgent priority and the earlier `when_at`, so the surviving row
//! runs at least as urgently and at least as early as the most demanding
//! pending request.
//!
//! The merge runs inside a store transaction with a bounded retry loop:
//! each attempt is a self-contained read-then-conditional-write, safe to
//! re-run. Exhausting the budget means the store is unavailable or highly
//! contended; the caller falls back to a plain insert rather than failing.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::models::{Job, NewJob};
use crate::store::JobStore;

const MAX_MERGE_ATTEMPTS: u32 = 5;

pub struct BatchMerger<S: JobStore> {
    store: Arc<S>,
    config: QueueConfig,
}

impl<S: JobStore> BatchMerger<S> {
    pub fn new(store: Arc<S>, config: QueueConfig) -> Self {
        Self { store, config }
    }

    /// Plain enqueue with priority validation; no dedup.
    pub async fn enqueue(&self, job: NewJob) -> Result<Job> {
        self.validate(&job)?;
        self.store.insert_job(job).await
    }

    /// Deduplicating enqueue: merge into an equivalent pending job when
    /// one exists, otherwise insert as new.
    #[instrument(skip(self, job), fields(worker = %job.worker_name, method = %job.method))]
    pub async fn enqueue_batched(&self, job: NewJob) -> Result<Job> {
        self.validate(&job)?;
        if let Some(existing) = self.merge_into_pending(&job).await? {
            debug!(job_id = existing.id, "merged into pending job");
            return Ok(existing);
        }
        self.store.insert_job(job).await
    }

    /// Try to fold `candidate` into the oldest pending job with the same
    /// fingerprint. `Ok(None)` means either no equivalent pending job
    /// exists or the retry budget ran out; in both cases the caller
    /// inserts the candidate itself. The candidate is never inserted here.
    pub async fn merge_into_pending(&self, candidate: &NewJob) -> Result<Option<Job>> {
        let mut attempt = 0;
        while attempt < MAX_MERGE_ATTEMPTS {
            attempt += 1;
            match self.try_merge(candidate).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_contention() => {
                    warn!(attempt, error = %err, "merge attempt failed, retrying");
                }
                Err(err) => return Err(err),
            }
        }
        warn!(
            attempts = MAX_MERGE_ATTEMPTS,
            "merge retry budget exhausted, treating as no merge"
        );
        Ok(None)
    }

    /// One transactional merge attempt. Leaves no transaction open,
    /// whatever the outcome.
    async fn try_merge(&self, candidate: &NewJob) -> Result<Option<Job>> {
        self.store.begin().await?;
        match self.merge_step(candidate).await {
            Ok(None) => {
                self.store.rollback().await?;
                Ok(None)
            }
            Ok(Some(merged)) => match self.store.commit().await {
                Ok(()) => Ok(Some(merged)),
                Err(err) => {
                    let _ = self.store.rollback().await;
                    Err(err)
                }
            },
            Err(err) => {
                let _ = self.store.rollback().await;
                Err(err)
            }
        }
    }

    async fn merge_step(&self, candidate: &NewJob) -> Result<Option<Job>> {
        let Some(mut existing) = self
            .store
            .find_oldest_pending_by_fingerprint(&candidate.fingerprint)
            .await?
        else {
            return Ok(None);
        };

        // More urgent always means numerically higher, regardless of the
        // configured claim direction.
        let priority = existing.priority.max(candidate.priority);
        let when_at = earlier_of(existing.when_at, candidate.when_at);
        let now = Utc::now();

        let affected = self
            .store
            .update_pending_schedule(existing.id, priority, when_at, now)
            .await?;
        if affected != 1 {
            // A competing writer claimed or changed the row between the
            // read and the write; re-run the whole step.
            return Err(QueueError::Transaction(
                "pending job changed during merge".into(),
            ));
        }

        existing.priority = priority;
        existing.when_at = when_at;
        existing.updated_at = now;
        Ok(Some(existing))
    }

    fn validate(&self, job: &NewJob) -> Result<()> {
        if job.priority < 0 || job.priority > self.config.priority_max {
            return Err(QueueError::Validation(format!(
                "priority {} outside 0..={}",
                job.priority, self.config.priority_max
            )));
        }
        Ok(())
    }
}

/// `None` on either side wins: no `when_at` means eligible immediately,
/// which is earlier than any scheduled time.
fn earlier_of(
    a: Option<DateTime<Utc>>,
    b: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        _ => None,
    }
}
