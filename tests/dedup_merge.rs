//! Dedup/batch merge behavior: fold-into-pending semantics, bounded retry
//! under contention, and the fall-back-to-insert path.

mod common;

use chrono::{Duration, Utc};
use common::{config, job, store, unique_job};
use jobq_core::store::JobStore;
use jobq_core::{BatchMerger, JobClaimer, JobFilter, QueueError};

#[tokio::test]
async fn merge_keeps_higher_priority_and_earlier_when_at() {
    let store = store();
    let merger = BatchMerger::new(store.clone(), config());
    let t = Utc::now() + Duration::minutes(30);

    let existing = merger
        .enqueue(job("mailer", "send").priority(3).when_at(t))
        .await
        .unwrap();
    let merged = merger
        .enqueue_batched(
            job("mailer", "send")
                .priority(5)
                .when_at(t - Duration::seconds(10)),
        )
        .await
        .unwrap();

    assert_eq!(merged.id, existing.id, "the candidate is never inserted");
    assert_eq!(merged.priority, 5);
    assert_eq!(merged.when_at, Some(t - Duration::seconds(10)));
    assert_eq!(store.live_count(), 1, "exactly one live job after merge");

    let persisted = store.find_job(existing.id).await.unwrap().unwrap();
    assert_eq!(persisted.priority, 5);
    assert_eq!(persisted.when_at, Some(t - Duration::seconds(10)));
}

#[tokio::test]
async fn merge_treats_missing_when_at_as_immediate() {
    let store = store();
    let merger = BatchMerger::new(store.clone(), config());

    let existing = merger
        .enqueue(job("mailer", "send").when_at(Utc::now() + Duration::hours(1)))
        .await
        .unwrap();
    let merged = merger.enqueue_batched(job("mailer", "send")).await.unwrap();

    assert_eq!(merged.id, existing.id);
    assert_eq!(merged.when_at, None, "no when_at means eligible immediately");
}

#[tokio::test]
async fn no_pending_equivalent_inserts_as_new() {
    let store = store();
    let merger = BatchMerger::new(store.clone(), config());

    merger.enqueue_batched(unique_job("w", "m", 1)).await.unwrap();
    merger.enqueue_batched(unique_job("w", "m", 2)).await.unwrap();

    assert_eq!(store.live_count(), 2);
}

#[tokio::test]
async fn running_duplicate_does_not_absorb_new_submission() {
    let store = store();
    let merger = BatchMerger::new(store.clone(), config());
    let claimer = JobClaimer::new(store.clone(), config());

    merger.enqueue(job("mailer", "send")).await.unwrap();
    claimer
        .next_job(&JobFilter::any(), true, None)
        .await
        .unwrap()
        .unwrap();

    // The only fingerprint match is Running, so the candidate inserts.
    merger.enqueue_batched(job("mailer", "send")).await.unwrap();
    assert_eq!(store.live_count(), 2);
}

#[tokio::test]
async fn merge_retries_through_conflicts_and_succeeds_on_fifth_attempt() {
    let store = store();
    let merger = BatchMerger::new(store.clone(), config());

    let existing = merger.enqueue(job("mailer", "send").priority(1)).await.unwrap();

    store.inject_commit_failures(4);
    let merged = merger
        .merge_into_pending(&job("mailer", "send").priority(7))
        .await
        .unwrap();

    let merged = merged.expect("fifth attempt succeeds");
    assert_eq!(merged.id, existing.id);
    assert_eq!(merged.priority, 7);
}

#[tokio::test]
async fn merge_exhaustion_reports_no_merge_not_an_error() {
    let store = store();
    let merger = BatchMerger::new(store.clone(), config());

    merger.enqueue(job("mailer", "send")).await.unwrap();

    store.inject_commit_failures(5);
    let outcome = merger
        .merge_into_pending(&job("mailer", "send").priority(7))
        .await
        .unwrap();
    assert!(outcome.is_none(), "exhausted budget means no merge, caller inserts");
}

#[tokio::test]
async fn enqueue_batched_falls_back_to_insert_on_exhaustion() {
    let store = store();
    let merger = BatchMerger::new(store.clone(), config());

    merger.enqueue(job("mailer", "send")).await.unwrap();

    store.inject_commit_failures(5);
    merger.enqueue_batched(job("mailer", "send")).await.unwrap();
    assert_eq!(store.live_count(), 2, "failed merge degrades to a plain insert");
}

#[tokio::test]
async fn priority_above_configured_bound_is_rejected() {
    let store = store();
    let merger = BatchMerger::new(store, config());

    let err = merger
        .enqueue(job("mailer", "send").priority(300))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::Validation(_)));
}
