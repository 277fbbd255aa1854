//! # Pruning Service
//!
//! Retention for the archive, purging for live jobs stuck in `Error`, and
//! the expiry sweep that retires live `New` jobs whose window has closed.
//! None of these operations touch a non-terminal job, other than the
//! `New -> Expired` transition itself.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::error::Result;
use crate::scheduler::filter::JobFilter;
use crate::store::JobStore;

pub struct Pruner<S: JobStore> {
    store: Arc<S>,
}

impl<S: JobStore> Pruner<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Delete archive records last updated before `older_than`.
    #[instrument(skip(self))]
    pub async fn prune_archived_jobs(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let removed = self.store.delete_archived_before(older_than).await?;
        info!(removed, "pruned archived jobs");
        Ok(removed)
    }

    /// Delete live jobs permanently stuck in `Error`, optionally scoped by
    /// worker/method.
    #[instrument(skip(self), fields(worker = ?filter.worker_name))]
    pub async fn prune_erroneous_jobs(&self, filter: &JobFilter) -> Result<u64> {
        let removed = self.store.delete_erroneous(filter).await?;
        info!(removed, "pruned erroneous jobs");
        Ok(removed)
    }

    /// Transition live `New` jobs whose `expires_at` has elapsed to
    /// `Expired` and move them to the archive, returning the count.
    #[instrument(skip(self), fields(worker = ?filter.worker_name))]
    pub async fn prune_expired_jobs(&self, filter: &JobFilter) -> Result<u64> {
        let now = Utc::now();
        let expired = self.store.expire_overdue(filter, now).await?;
        for &id in &expired {
            self.store.archive_job(id, now).await?;
        }
        info!(expired = expired.len(), "expired overdue jobs");
        Ok(expired.len() as u64)
    }
}
