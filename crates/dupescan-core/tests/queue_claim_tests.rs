//! Integration tests for `JobQueue` claim semantics (spec.md §8, testable
//! properties #4 and #5). These exercise the real `FOR UPDATE SKIP LOCKED`
//! claim query against a live Postgres instance, so they are `#[ignore]`d by
//! default — run with `cargo test -- --ignored` against a database named by
//! `TEST_DATABASE_URL` (falls back to `DATABASE_URL`).

use chrono::Utc;
use dupescan_core::db::Db;
use dupescan_core::queue::JobQueue;
use dupescan_core::types::JobType;

async fn test_db() -> Db {
    let url = std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .expect("set TEST_DATABASE_URL or DATABASE_URL to run ignored Postgres integration tests");
    let db = Db::connect(&url).await.expect("connect to test database");
    db.migrate().await.expect("apply schema");
    db
}

#[tokio::test]
#[ignore = "requires a live Postgres instance"]
async fn concurrent_claim_yields_exactly_one_success() {
    let db = test_db().await;
    let queue = JobQueue::new(&db, 1_000);

    let job_id = queue
        .enqueue(JobType::Ingest, serde_json::json!({}), None, 3)
        .await
        .expect("enqueue");

    // Two claims against the same ready job, raced concurrently on the same
    // queue reference so both outstanding `claim()` calls are in flight
    // against Postgres at once. `FOR UPDATE SKIP LOCKED` must let exactly one
    // of these see the row.
    let (a, b) = tokio::join!(
        queue.claim(&[JobType::Ingest]),
        queue.claim(&[JobType::Ingest]),
    );
    let a = a.expect("claim a");
    let b = b.expect("claim b");

    let claimed: Vec<_> = [a, b].into_iter().flatten().collect();
    assert_eq!(claimed.len(), 1, "exactly one concurrent claim should succeed");
    assert_eq!(claimed[0].id, job_id);
    assert_eq!(claimed[0].attempts, 1);

    let reloaded = queue.get(job_id).await.expect("get").expect("job exists");
    assert_eq!(reloaded.status, dupescan_core::types::JobStatus::Running);
}

#[tokio::test]
#[ignore = "requires a live Postgres instance"]
async fn claim_is_unavailable_until_run_after_elapses() {
    let db = test_db().await;
    let queue = JobQueue::new(&db, 1_000);

    let job_id = queue
        .enqueue(JobType::Embed, serde_json::json!({}), None, 3)
        .await
        .expect("enqueue");

    queue
        .release(job_id, Utc::now() + chrono::Duration::hours(1))
        .await
        .expect("release with future run_after");

    let claimed = queue
        .claim(&[JobType::Embed])
        .await
        .expect("claim should not error");
    assert!(
        claimed.is_none(),
        "a job scheduled in the future must not be claimable yet"
    );
}

#[tokio::test]
#[ignore = "requires a live Postgres instance"]
async fn failed_retryable_job_is_reclaimable_after_backoff_with_incremented_attempts() {
    let db = test_db().await;
    let queue = JobQueue::new(&db, 1);

    let job_id = queue
        .enqueue(JobType::Cluster, serde_json::json!({}), None, 3)
        .await
        .expect("enqueue");

    let first_claim = queue
        .claim(&[JobType::Cluster])
        .await
        .expect("claim")
        .expect("job should be claimable");
    assert_eq!(first_claim.attempts, 1);

    // Simulate a crash before `complete`: a retryable failure releases the
    // job back to `queued` with backoff instead of completing it.
    queue
        .fail(job_id, "simulated transient failure", true)
        .await
        .expect("fail");

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let second_claim = queue
        .claim(&[JobType::Cluster])
        .await
        .expect("claim")
        .expect("job should be reclaimable once run_after elapses");
    assert_eq!(second_claim.id, job_id);
    assert_eq!(second_claim.attempts, 2);
}
