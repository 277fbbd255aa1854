//! # Status Aggregator
//!
//! Read-only rollup of job counts per `"<worker>-><method>()"` across the
//! live set and the archive. Counts come back in a fixed-shape struct with
//! one field per status, zero-filled, so callers can compute rates without
//! existence-checking keys.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;

use crate::error::Result;
use crate::models::JobStatus;
use crate::scheduler::filter::JobFilter;
use crate::store::{JobStore, StorageRealm};

/// Counts for every status, zero-initialized. A fixed shape instead of a
/// status-keyed map: an unseen status reads as zero rather than a missing
/// key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub new: i64,
    pub running: i64,
    pub success: i64,
    pub error: i64,
    pub expired: i64,
    pub max_error: i64,
    pub max_stalled: i64,
    pub max_retries: i64,
}

impl StatusCounts {
    pub fn record(&mut self, status: JobStatus, count: i64) {
        *self.slot(status) += count;
    }

    pub fn get(&self, status: JobStatus) -> i64 {
        match status {
            JobStatus::New => self.new,
            JobStatus::Running => self.running,
            JobStatus::Success => self.success,
            JobStatus::Error => self.error,
            JobStatus::Expired => self.expired,
            JobStatus::MaxError => self.max_error,
            JobStatus::MaxStalled => self.max_stalled,
            JobStatus::MaxRetries => self.max_retries,
        }
    }

    pub fn total(&self) -> i64 {
        JobStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }

    fn slot(&mut self, status: JobStatus) -> &mut i64 {
        match status {
            JobStatus::New => &mut self.new,
            JobStatus::Running => &mut self.running,
            JobStatus::Success => &mut self.success,
            JobStatus::Error => &mut self.error,
            JobStatus::Expired => &mut self.expired,
            JobStatus::MaxError => &mut self.max_error,
            JobStatus::MaxStalled => &mut self.max_stalled,
            JobStatus::MaxRetries => &mut self.max_retries,
        }
    }
}

/// Snapshot key for one handler: `"mailer->send()"`.
pub fn method_key(worker_name: &str, method: &str) -> String {
    format!("{worker_name}->{method}()")
}

pub struct StatusAggregator<S: JobStore> {
    store: Arc<S>,
}

impl<S: JobStore> StatusAggregator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Per-handler status counts combined across live and archive storage.
    #[instrument(skip(self))]
    pub async fn snapshot(&self) -> Result<BTreeMap<String, StatusCounts>> {
        let mut result: BTreeMap<String, StatusCounts> = BTreeMap::new();
        for realm in [StorageRealm::Live, StorageRealm::Archive] {
            for row in self.store.status_rollup(realm).await? {
                result
                    .entry(method_key(&row.worker_name, &row.method))
                    .or_default()
                    .record(row.status, row.count);
            }
        }
        Ok(result)
    }

    /// Count of live jobs that could actually be claimed right now,
    /// applying the same eligibility predicate as claim selection.
    pub async fn live_job_count(&self, filter: &JobFilter) -> Result<i64> {
        self.store.count_eligible(filter, Utc::now()).await
    }

    /// Count of jobs in one status within one realm.
    pub async fn count_by_status(
        &self,
        realm: StorageRealm,
        status: JobStatus,
        filter: &JobFilter,
    ) -> Result<i64> {
        self.store.count_by_status(realm, status, filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_start_zeroed_and_accumulate() {
        let mut counts = StatusCounts::default();
        for status in JobStatus::ALL {
            assert_eq!(counts.get(status), 0);
        }

        counts.record(JobStatus::New, 2);
        counts.record(JobStatus::New, 1);
        counts.record(JobStatus::MaxStalled, 4);
        assert_eq!(counts.get(JobStatus::New), 3);
        assert_eq!(counts.get(JobStatus::MaxStalled), 4);
        assert_eq!(counts.total(), 7);
    }

    #[test]
    fn method_key_format() {
        assert_eq!(method_key("mailer", "send"), "mailer->send()");
    }
}
