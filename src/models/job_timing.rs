//! Timing side records, written only when `record_timings` is enabled.
//! They carry no scheduling semantics; status reporters can use them to
//! chart throughput over time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::{JobId, JobStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTiming {
    pub job_id: JobId,
    pub status: JobStatus,
    pub recorded_at: DateTime<Utc>,
}

impl JobTiming {
    pub fn new(job_id: JobId, status: JobStatus, recorded_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            status,
            recorded_at,
        }
    }
}
