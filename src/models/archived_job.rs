//! Archived copy of a terminal job, kept out of the live working set so
//! claim selection never scans finished work. Retention pruning cuts on
//! `updated_at`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::{Job, JobStatus};

/// Carries the full `Job` attribute set plus `archived_at`, so a job can
/// round-trip through the archive (reset of erroneous jobs) without losing
/// its schedule or retry budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedJob {
    pub id: i64,
    pub worker_name: String,
    pub method: String,
    pub args: serde_json::Value,
    pub fingerprint: String,
    pub status: JobStatus,
    pub priority: i32,
    pub when_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub locked: Option<bool>,
    pub locked_at: Option<DateTime<Utc>>,
    pub run_id: Option<Uuid>,
    pub retries: i32,
    pub max_retries: Option<i32>,
    pub stalled_count: i32,
    pub max_stalled: Option<i32>,
    pub error_count: i32,
    pub max_error: Option<i32>,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
}

impl ArchivedJob {
    /// Snapshot a terminal job into its archive form.
    pub fn from_job(job: &Job, archived_at: DateTime<Utc>) -> Self {
        Self {
            id: job.id,
            worker_name: job.worker_name.clone(),
            method: job.method.clone(),
            args: job.args.clone(),
            fingerprint: job.fingerprint.clone(),
            status: job.status,
            priority: job.priority,
            when_at: job.when_at,
            expires_at: job.expires_at,
            locked: job.locked,
            locked_at: job.locked_at,
            run_id: job.run_id,
            retries: job.retries,
            max_retries: job.max_retries,
            stalled_count: job.stalled_count,
            max_stalled: job.max_stalled,
            error_count: job.error_count,
            max_error: job.max_error,
            message: job.message.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            archived_at,
        }
    }
}
