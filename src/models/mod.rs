//! Persisted entities of the work queue: live jobs, their archived
//! counterparts, and optional timing side records.

pub mod archived_job;
pub mod job;
pub mod job_timing;

pub use archived_job::ArchivedJob;
pub use job::{Job, JobId, JobStatus, NewJob};
pub use job_timing::JobTiming;
