//! # Job Model
//!
//! The persisted unit of work. A job is created `New`, claimed into
//! `Running` by exactly one worker, and finishes in a terminal state from
//! which it is moved to the archive.
//!
//! ## Deduplication
//!
//! Jobs carry a `fingerprint`: a SHA-256 over the worker name, method, and
//! canonical argument JSON. Two live `New` jobs with the same fingerprint
//! represent the same logical work, and the batch merger folds one into the
//! other instead of enqueuing both.
//!
//! ## Leases
//!
//! `locked` and `locked_at` are set together by the claim protocol and
//! cleared together on requeue; neither is ever mutated on its own. A
//! `Running` job whose `locked_at` has fallen behind the staleness cutoff
//! is a stall candidate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type JobId = i64;

/// Job lifecycle states. String forms are snake_case and round-trip
/// through `Display`/`FromStr`, which is also how the Postgres backend
/// persists them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    New,
    Running,
    Success,
    Error,
    Expired,
    MaxError,
    MaxStalled,
    MaxRetries,
}

impl JobStatus {
    /// Every status, in rollup order.
    pub const ALL: [JobStatus; 8] = [
        JobStatus::New,
        JobStatus::Running,
        JobStatus::Success,
        JobStatus::Error,
        JobStatus::Expired,
        JobStatus::MaxError,
        JobStatus::MaxStalled,
        JobStatus::MaxRetries,
    ];

    /// Terminal states trigger archival and are never left via the public
    /// surface (reset of archived error jobs is a store-level operation).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::New | JobStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::New => "new",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Error => "error",
            JobStatus::Expired => "expired",
            JobStatus::MaxError => "max_error",
            JobStatus::MaxStalled => "max_stalled",
            JobStatus::MaxRetries => "max_retries",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(JobStatus::New),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "error" => Ok(JobStatus::Error),
            "expired" => Ok(JobStatus::Expired),
            "max_error" => Ok(JobStatus::MaxError),
            "max_stalled" => Ok(JobStatus::MaxStalled),
            "max_retries" => Ok(JobStatus::MaxRetries),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A live job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
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
}

impl Job {
    /// The eligibility predicate: may this job be claimed at `now`?
    ///
    /// The claim selection query and the live-count query both apply
    /// exactly this predicate, so counts never include jobs that could not
    /// actually be handed out.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::New
            && self.locked.is_none()
            && self.when_at.map_or(true, |w| w <= now)
            && self.expires_at.map_or(true, |e| e > now)
    }

    /// Whether a `Running` job's lease has fallen behind `cutoff`.
    pub fn lease_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running
            && self.locked.is_some()
            && self.locked_at.map_or(false, |at| at < cutoff)
    }

    /// Status this job moves to when its worker reports an error, assuming
    /// the error/retry counters are incremented by one as part of the same
    /// transition.
    pub fn status_after_error(&self) -> JobStatus {
        let retries = self.retries + 1;
        let error_count = self.error_count + 1;
        if self.max_retries.is_some_and(|m| retries >= m) {
            JobStatus::MaxRetries
        } else if self.max_error.is_some_and(|m| error_count >= m) {
            JobStatus::MaxError
        } else if self.max_retries.is_some() || self.max_error.is_some() {
            JobStatus::New
        } else {
            JobStatus::Error
        }
    }

    /// Status this job moves to when stall recovery reclaims its lease,
    /// assuming the stalled/retry counters are incremented by one as part
    /// of the same transition. Jobs with no stall budget requeue without
    /// bound; the staleness cutoff keeps that from looping hot.
    pub fn status_after_stall(&self) -> JobStatus {
        let retries = self.retries + 1;
        let stalled_count = self.stalled_count + 1;
        if self.max_retries.is_some_and(|m| retries >= m) {
            JobStatus::MaxRetries
        } else if self.max_stalled.is_some_and(|m| stalled_count >= m) {
            JobStatus::MaxStalled
        } else {
            JobStatus::New
        }
    }
}

/// A job submission, before the store assigns identity and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub worker_name: String,
    pub method: String,
    pub args: serde_json::Value,
    pub fingerprint: String,
    pub priority: i32,
    pub when_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_retries: Option<i32>,
    pub max_stalled: Option<i32>,
    pub max_error: Option<i32>,
}

impl NewJob {
    pub fn new(worker_name: impl Into<String>, method: impl Into<String>, args: serde_json::Value) -> Self {
        let worker_name = worker_name.into();
        let method = method.into();
        let fingerprint = fingerprint(&worker_name, &method, &args);
        Self {
            worker_name,
            method,
            args,
            fingerprint,
            priority: 0,
            when_at: None,
            expires_at: None,
            max_retries: None,
            max_stalled: None,
            max_error: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn when_at(mut self, when_at: DateTime<Utc>) -> Self {
        self.when_at = Some(when_at);
        self
    }

    pub fn expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn retry_budgets(mut self, max_retries: Option<i32>, max_stalled: Option<i32>, max_error: Option<i32>) -> Self {
        self.max_retries = max_retries;
        self.max_stalled = max_stalled;
        self.max_error = max_error;
        self
    }
}

/// Deterministic hash identifying logically-equivalent work: two
/// submissions with the same worker, method, and arguments fingerprint
/// identically regardless of priority or scheduling hints.
pub fn fingerprint(worker_name: &str, method: &str, args: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(worker_name.as_bytes());
    hasher.update(b"|");
    hasher.update(method.as_bytes());
    hasher.update(b"|");
    hasher.update(serde_json::to_string(args).unwrap_or_default().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
