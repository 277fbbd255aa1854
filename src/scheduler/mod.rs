//! Scheduling protocols: eligibility filtering, the claim protocol and
//! completion path, dedup merging, stall recovery, status aggregation,
//! and pruning. Everything here is generic over the [`JobStore`] backend.
//!
//! [`JobStore`]: crate::store::JobStore

pub mod claimer;
pub mod filter;
pub mod merger;
pub mod pruner;
pub mod recovery;
pub mod status;

pub use claimer::{JobClaimer, JobOutcome};
pub use filter::{ClaimOrdering, JobFilter};
pub use merger::BatchMerger;
pub use pruner::Pruner;
pub use recovery::{RecoveryReport, StallRecovery};
pub use status::{method_key, StatusAggregator, StatusCounts};
