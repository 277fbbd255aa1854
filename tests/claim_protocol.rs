//! Claim protocol behavior: at-most-one-winner, eligibility windows,
//! ordering, and the completion path.

mod common;

use chrono::{Duration, Utc};
use common::{config, job, store, unique_job};
use jobq_core::store::JobStore;
use jobq_core::{
    JobClaimer, JobFilter, JobOutcome, JobStatus, PriorityDirection, QueueConfig, StatusAggregator,
};
use uuid::Uuid;

#[tokio::test]
async fn concurrent_claims_have_exactly_one_winner() {
    let store = store();
    let claimer = JobClaimer::new(store.clone(), config());
    store.insert_job(job("mailer", "send")).await.unwrap();

    let filter = JobFilter::any();
    let attempts = (0..16).map(|_| claimer.next_job(&filter, true, None));
    let results = futures::future::join_all(attempts).await;

    let claimed: Vec<_> = results
        .into_iter()
        .map(|r| r.expect("claim attempts never error"))
        .flatten()
        .collect();
    assert_eq!(claimed.len(), 1, "exactly one attempt wins the job");
    assert_eq!(claimed[0].status, JobStatus::Running);
}

#[tokio::test]
async fn job_with_future_when_at_is_not_claimable() {
    let store = store();
    let claimer = JobClaimer::new(store.clone(), config());
    let aggregator = StatusAggregator::new(store.clone());

    store
        .insert_job(job("mailer", "send").when_at(Utc::now() + Duration::hours(1)))
        .await
        .unwrap();

    assert!(claimer.next_job(&JobFilter::any(), true, None).await.unwrap().is_none());
    assert_eq!(aggregator.live_job_count(&JobFilter::any()).await.unwrap(), 0);
}

#[tokio::test]
async fn job_becomes_claimable_once_when_at_elapses() {
    let store = store();
    let claimer = JobClaimer::new(store.clone(), config());

    store
        .insert_job(job("mailer", "send").when_at(Utc::now() - Duration::milliseconds(1)))
        .await
        .unwrap();

    let claimed = claimer.next_job(&JobFilter::any(), true, None).await.unwrap();
    assert!(claimed.is_some());
}

#[tokio::test]
async fn expired_job_is_never_claimable_and_not_counted() {
    let store = store();
    let claimer = JobClaimer::new(store.clone(), config());
    let aggregator = StatusAggregator::new(store.clone());

    store
        .insert_job(job("mailer", "send").expires_at(Utc::now() - Duration::seconds(1)))
        .await
        .unwrap();

    assert!(claimer.next_job(&JobFilter::any(), true, None).await.unwrap().is_none());
    assert_eq!(aggregator.live_job_count(&JobFilter::any()).await.unwrap(), 0);
}

#[tokio::test]
async fn prioritized_claim_takes_highest_priority_first() {
    let store = store();
    let claimer = JobClaimer::new(store.clone(), config());

    store
        .insert_job(unique_job("w", "m", 1).priority(1))
        .await
        .unwrap();
    let urgent = store
        .insert_job(unique_job("w", "m", 2).priority(5))
        .await
        .unwrap();

    let claimed = claimer
        .next_job(&JobFilter::any(), true, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, urgent.id);
}

#[tokio::test]
async fn ascending_direction_inverts_claim_order() {
    let store = store();
    let config = QueueConfig {
        priority_direction: PriorityDirection::Asc,
        ..QueueConfig::default()
    };
    let claimer = JobClaimer::new(store.clone(), config);

    let low = store
        .insert_job(unique_job("w", "m", 1).priority(1))
        .await
        .unwrap();
    store
        .insert_job(unique_job("w", "m", 2).priority(5))
        .await
        .unwrap();

    let claimed = claimer
        .next_job(&JobFilter::any(), true, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, low.id);
}

#[tokio::test]
async fn unprioritized_claim_orders_by_when_at_only() {
    let store = store();
    let claimer = JobClaimer::new(store.clone(), config());
    let now = Utc::now();

    let earlier = store
        .insert_job(
            unique_job("w", "m", 1)
                .priority(1)
                .when_at(now - Duration::minutes(10)),
        )
        .await
        .unwrap();
    store
        .insert_job(
            unique_job("w", "m", 2)
                .priority(9)
                .when_at(now - Duration::minutes(5)),
        )
        .await
        .unwrap();

    let claimed = claimer
        .next_job(&JobFilter::any(), false, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, earlier.id);
}

#[tokio::test]
async fn filter_scopes_claims_to_worker_and_method() {
    let store = store();
    let claimer = JobClaimer::new(store.clone(), config());

    store.insert_job(job("mailer", "send")).await.unwrap();
    let wanted = store.insert_job(job("billing", "invoice")).await.unwrap();

    let filter = JobFilter::for_worker("billing").with_method("invoice");
    let claimed = claimer.next_job(&filter, true, None).await.unwrap().unwrap();
    assert_eq!(claimed.id, wanted.id);

    let none = claimer
        .next_job(&JobFilter::for_worker("billing"), true, None)
        .await
        .unwrap();
    assert!(none.is_none(), "the only billing job is already claimed");
}

#[tokio::test]
async fn claim_records_run_identifier() {
    let store = store();
    let claimer = JobClaimer::new(store.clone(), config());
    store.insert_job(job("mailer", "send")).await.unwrap();

    let run_id = Uuid::new_v4();
    let claimed = claimer
        .next_job(&JobFilter::any(), true, Some(run_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.run_id, Some(run_id));
    assert_eq!(claimed.locked, Some(true));
    assert!(claimed.locked_at.is_some());
}

#[tokio::test]
async fn successful_completion_archives_the_job() {
    let store = store();
    let claimer = JobClaimer::new(store.clone(), config());
    store.insert_job(job("mailer", "send")).await.unwrap();

    let claimed = claimer
        .next_job(&JobFilter::any(), true, None)
        .await
        .unwrap()
        .unwrap();
    let status = claimer
        .complete_job(&claimed, JobOutcome::Success)
        .await
        .unwrap();

    assert_eq!(status, JobStatus::Success);
    assert_eq!(store.live_count(), 0);
    let archived = store.find_archived_job(claimed.id).await.unwrap().unwrap();
    assert_eq!(archived.status, JobStatus::Success);
}

#[tokio::test]
async fn error_without_budget_is_terminal() {
    let store = store();
    let claimer = JobClaimer::new(store.clone(), config());
    store.insert_job(job("mailer", "send")).await.unwrap();

    let claimed = claimer
        .next_job(&JobFilter::any(), true, None)
        .await
        .unwrap()
        .unwrap();
    let status = claimer
        .complete_job(&claimed, JobOutcome::Error("smtp down".into()))
        .await
        .unwrap();

    assert_eq!(status, JobStatus::Error);
    let archived = store.find_archived_job(claimed.id).await.unwrap().unwrap();
    assert_eq!(archived.error_count, 1);
    assert_eq!(archived.message.as_deref(), Some("smtp down"));
}

#[tokio::test]
async fn error_with_budget_requeues_then_escalates() {
    let store = store();
    let claimer = JobClaimer::new(store.clone(), config());
    store
        .insert_job(job("mailer", "send").retry_budgets(Some(5), None, Some(2)))
        .await
        .unwrap();

    let first = claimer
        .next_job(&JobFilter::any(), true, None)
        .await
        .unwrap()
        .unwrap();
    let status = claimer
        .complete_job(&first, JobOutcome::Error("timeout".into()))
        .await
        .unwrap();
    assert_eq!(status, JobStatus::New);

    let requeued = store.find_job(first.id).await.unwrap().unwrap();
    assert_eq!(requeued.error_count, 1);
    assert_eq!(requeued.retries, 1);
    assert_eq!(requeued.locked, None);
    assert_eq!(requeued.locked_at, None);

    // Second failure exhausts the error budget.
    let second = claimer
        .next_job(&JobFilter::any(), true, None)
        .await
        .unwrap()
        .unwrap();
    let status = claimer
        .complete_job(&second, JobOutcome::Error("timeout".into()))
        .await
        .unwrap();
    assert_eq!(status, JobStatus::MaxError);
    assert_eq!(store.live_count(), 0);
}

#[tokio::test]
async fn completion_after_stall_requeue_reports_the_requeued_status() {
    let store = store();
    let claimer = JobClaimer::new(store.clone(), config());
    store
        .insert_job(job("mailer", "send").retry_budgets(None, Some(3), None))
        .await
        .unwrap();

    let claimed = claimer
        .next_job(&JobFilter::any(), true, None)
        .await
        .unwrap()
        .unwrap();
    // Stall recovery reclaims the lease before the worker reports back.
    store.requeue_stalled(claimed.id, Utc::now()).await.unwrap();

    let status = claimer
        .complete_job(&claimed, JobOutcome::Success)
        .await
        .unwrap();
    assert_eq!(status, JobStatus::New, "the stale report does not stick");

    let live = store.find_job(claimed.id).await.unwrap().unwrap();
    assert_eq!(live.status, JobStatus::New);
    assert_eq!(store.live_count(), 1, "the requeued job is not archived");
}

#[tokio::test]
async fn timings_recorded_when_enabled() {
    let store = store();
    let config = QueueConfig {
        record_timings: true,
        ..QueueConfig::default()
    };
    let claimer = JobClaimer::new(store.clone(), config);
    store.insert_job(job("mailer", "send")).await.unwrap();

    let claimed = claimer
        .next_job(&JobFilter::any(), true, None)
        .await
        .unwrap()
        .unwrap();
    claimer
        .complete_job(&claimed, JobOutcome::Success)
        .await
        .unwrap();

    assert_eq!(store.timing_count(), 2);
}

#[tokio::test]
async fn timings_not_recorded_by_default() {
    let store = store();
    let claimer = JobClaimer::new(store.clone(), config());
    store.insert_job(job("mailer", "send")).await.unwrap();

    let claimed = claimer
        .next_job(&JobFilter::any(), true, None)
        .await
        .unwrap()
        .unwrap();
    claimer
        .complete_job(&claimed, JobOutcome::Success)
        .await
        .unwrap();

    assert_eq!(store.timing_count(), 0);
}
