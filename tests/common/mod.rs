//! Shared helpers for the behavioral test suites.

use jobq_core::store::MemoryJobStore;
use jobq_core::{NewJob, QueueConfig};
use serde_json::json;
use std::sync::Arc;

pub fn store() -> Arc<MemoryJobStore> {
    Arc::new(MemoryJobStore::new())
}

pub fn config() -> QueueConfig {
    QueueConfig::default()
}

/// A submission whose fingerprint depends only on worker and method.
pub fn job(worker: &str, method: &str) -> NewJob {
    NewJob::new(worker, method, json!({}))
}

/// A submission with a distinct fingerprint per `n`.
pub fn unique_job(worker: &str, method: &str, n: i64) -> NewJob {
    NewJob::new(worker, method, json!({ "n": n }))
}
