//! # jobq-core
//!
//! Job-scheduling core of a persistent work queue: selects the next
//! eligible unit of work under priority and time constraints, atomically
//! leases it to exactly one worker, recovers stalled leases, merges
//! duplicate pending jobs, and reports aggregate queue health.
//!
//! ## Architecture
//!
//! Multiple independent worker processes poll a shared store concurrently;
//! there is no central coordinator. All mutual exclusion is expressed as
//! conditional writes against the store (optimistic concurrency), never as
//! in-memory locks, because workers are assumed to be separate processes.
//!
//! ## Module Organization
//!
//! - [`models`] - jobs, archived jobs, timing records, the status enum
//! - [`scheduler`] - claim protocol, dedup merger, stall recovery, status
//!   aggregation, pruning
//! - [`store`] - the `JobStore` boundary with Postgres and in-memory
//!   backends
//! - [`config`] - queue configuration (priority bound and direction,
//!   timing records)
//! - [`error`] - structured error handling
//! - [`logging`] - tracing initialization for embedding processes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use jobq_core::{BatchMerger, JobClaimer, JobFilter, JobOutcome, NewJob, QueueConfig};
//! use jobq_core::store::MemoryJobStore;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryJobStore::new());
//! let config = QueueConfig::default();
//!
//! // Producer side: dedup-merging enqueue.
//! let merger = BatchMerger::new(store.clone(), config.clone());
//! merger
//!     .enqueue_batched(NewJob::new("mailer", "send", json!({"to": "a@example.com"})))
//!     .await?;
//!
//! // Worker side: claim, work, report.
//! let claimer = JobClaimer::new(store, config);
//! if let Some(job) = claimer.next_job(&JobFilter::any(), true, None).await? {
//!     claimer.complete_job(&job, JobOutcome::Success).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod scheduler;
pub mod store;

pub use config::{PriorityDirection, QueueConfig};
pub use error::{QueueError, Result};
pub use models::{ArchivedJob, Job, JobId, JobStatus, JobTiming, NewJob};
pub use scheduler::{
    method_key, BatchMerger, ClaimOrdering, JobClaimer, JobFilter, JobOutcome, Pruner,
    RecoveryReport, StallRecovery, StatusAggregator, StatusCounts,
};
pub use store::{JobStore, MemoryJobStore, PgJobStore, StatusRollupRow, StorageRealm};
