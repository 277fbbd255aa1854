//! Optional worker/method scoping and claim ordering.
//!
//! Filters are built up as a value from optional fields before any query is
//! constructed, so every code path (claim selection, counts, pruning)
//! scopes identically instead of each one conditionally appending criteria.

use serde::{Deserialize, Serialize};

use crate::config::PriorityDirection;
use crate::models::Job;

/// Scopes an operation to a worker and/or method. An empty filter matches
/// every job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    pub worker_name: Option<String>,
    pub method: Option<String>,
}

impl JobFilter {
    /// Matches every job.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_worker(worker_name: impl Into<String>) -> Self {
        Self {
            worker_name: Some(worker_name.into()),
            method: None,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn is_unscoped(&self) -> bool {
        self.worker_name.is_none() && self.method.is_none()
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.worker_name
            .as_deref()
            .map_or(true, |w| job.worker_name == w)
            && self.method.as_deref().map_or(true, |m| job.method == m)
    }
}

/// Ordering applied when selecting the next claim candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOrdering {
    /// Priority first (direction as configured), then `when_at` ascending.
    Priority(PriorityDirection),
    /// `when_at` ascending only.
    WhenAt,
}

impl ClaimOrdering {
    pub fn for_claim(prioritize: bool, direction: PriorityDirection) -> Self {
        if prioritize {
            ClaimOrdering::Priority(direction)
        } else {
            ClaimOrdering::WhenAt
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewJob;
    use chrono::Utc;
    use serde_json::json;

    fn job(worker: &str, method: &str) -> Job {
        let new = NewJob::new(worker, method, json!({}));
        let now = Utc::now();
        Job {
            id: 1,
            worker_name: new.worker_name,
            method: new.method,
            args: new.args,
            fingerprint: new.fingerprint,
            status: crate::models::JobStatus::New,
            priority: 0,
            when_at: None,
            expires_at: None,
            locked: None,
            locked_at: None,
            run_id: None,
            retries: 0,
            max_retries: None,
            stalled_count: 0,
            max_stalled: None,
            error_count: 0,
            max_error: None,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn unscoped_filter_matches_everything() {
        let filter = JobFilter::any();
        assert!(filter.is_unscoped());
        assert!(filter.matches(&job("mailer", "send")));
    }

    #[test]
    fn scoped_filter_checks_both_fields() {
        let filter = JobFilter::for_worker("mailer").with_method("send");
        assert!(filter.matches(&job("mailer", "send")));
        assert!(!filter.matches(&job("mailer", "bounce")));
        assert!(!filter.matches(&job("billing", "send")));
    }

    #[test]
    fn ordering_ignores_direction_when_not_prioritizing() {
        assert_eq!(
            ClaimOrdering::for_claim(false, PriorityDirection::Asc),
            ClaimOrdering::WhenAt
        );
        assert_eq!(
            ClaimOrdering::for_claim(true, PriorityDirection::Asc),
            ClaimOrdering::Priority(PriorityDirection::Asc)
        );
    }
}
