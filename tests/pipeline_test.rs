//! End-to-end pipeline tests against the in-memory backends.
//!
//! These drive the real admission layer, queue, job store and worker loop;
//! only the render engine is scripted.

mod helpers;

use chrono::Utc;

use render_pipeline::error::ApiError;
use render_pipeline::models::job::{ErrorKind, JobStatus, Tier};
use render_pipeline::queue::{QueueMessage, RenderQueue};
use render_pipeline::services::admission;
use render_pipeline::services::storage::OutputStore;
use render_pipeline::store::{JobStore, StoreError};
use render_pipeline::worker;

use helpers::{drain, harness, harness_with, submit_req, HarnessOptions};

#[tokio::test]
async fn submitted_job_renders_to_success() {
    let h = harness();

    let job = admission::submit(&h.state, submit_req("mock://ok/cv-1", "owner-1", Tier::Pro))
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempt_count, 0);

    drain(&h.state).await;

    let done = admission::get_status(&h.state, job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.attempt_count, 1);
    assert!(done.finished_at.is_some());
    assert!(done.duration_seconds().is_some());

    // The artifact is retrievable under the recorded reference.
    let key = done.result_ref.expect("succeeded job must carry a result ref");
    let bytes = h.output.get(&key).await.unwrap();
    assert_eq!(bytes, b"rendered:mock://ok/cv-1");
}

#[tokio::test]
async fn malformed_payload_ref_creates_no_job_record() {
    let h = harness();

    let err = admission::submit(&h.state, submit_req("not a uri", "owner-1", Tier::Free))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Validation(_)));

    assert_eq!(h.store.job_count().await, 0);
    assert_eq!(h.queue.snapshot().await.unwrap().depth, 0);
}

#[tokio::test]
async fn quota_ceiling_rejects_then_frees_on_completion() {
    let h = harness(); // free tier ceiling: 2

    let a = admission::submit(&h.state, submit_req("mock://ok/a", "owner-q", Tier::Free))
        .await
        .unwrap();
    admission::submit(&h.state, submit_req("mock://ok/b", "owner-q", Tier::Free))
        .await
        .unwrap();

    let err = admission::submit(&h.state, submit_req("mock://ok/c", "owner-q", Tier::Free))
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::QuotaExceeded(_)));

    // A different owner is unaffected.
    admission::submit(&h.state, submit_req("mock://ok/d", "owner-other", Tier::Free))
        .await
        .unwrap();

    drain(&h.state).await;
    let done = admission::get_status(&h.state, a.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Succeeded);

    // Terminal transitions released the slots.
    admission::submit(&h.state, submit_req("mock://ok/e", "owner-q", Tier::Free))
        .await
        .unwrap();
}

#[tokio::test]
async fn cancel_while_queued_never_runs() {
    let h = harness();

    let job = admission::submit(&h.state, submit_req("mock://ok/x", "owner-1", Tier::Free))
        .await
        .unwrap();

    let cancelled = admission::cancel(&h.state, job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    // The stranded message is discarded without executing anything.
    drain(&h.state).await;
    assert_eq!(h.renderer.total_calls().await, 0);

    let snapshot = h.queue.snapshot().await.unwrap();
    assert_eq!(snapshot.depth, 0);
    assert_eq!(snapshot.in_flight, 0);

    let final_job = admission::get_status(&h.state, job.id).await.unwrap();
    assert_eq!(final_job.status, JobStatus::Cancelled);
    assert!(final_job.result_ref.is_none());
}

#[tokio::test]
async fn cancel_during_render_is_honored_before_publish() {
    let h = harness();

    let job = admission::submit(
        &h.state,
        submit_req("mock://cancel-during/x", "owner-1", Tier::Pro),
    )
    .await
    .unwrap();

    drain(&h.state).await;

    let final_job = admission::get_status(&h.state, job.id).await.unwrap();
    assert_eq!(final_job.status, JobStatus::Cancelled);
    assert!(final_job.result_ref.is_none());
    assert_eq!(h.renderer.calls_for(job.id).await, 1);
}

#[tokio::test]
async fn cancelling_a_terminal_job_is_invalid_state() {
    let h = harness();

    let job = admission::submit(&h.state, submit_req("mock://ok/x", "owner-1", Tier::Free))
        .await
        .unwrap();
    drain(&h.state).await;

    let err = admission::cancel(&h.state, job.id).await.unwrap_err();
    assert!(matches!(err, ApiError::InvalidState(_)));
}

#[tokio::test]
async fn transient_failures_retry_until_success() {
    let h = harness(); // max_attempts: 3

    let job = admission::submit(&h.state, submit_req("mock://flaky/2/x", "owner-1", Tier::Pro))
        .await
        .unwrap();

    drain(&h.state).await;

    let done = admission::get_status(&h.state, job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.attempt_count, 3);
    assert_eq!(h.renderer.calls_for(job.id).await, 3);
}

#[tokio::test]
async fn exhausted_retry_budget_fails_with_max_retries() {
    let h = harness(); // max_attempts: 3

    let job = admission::submit(&h.state, submit_req("mock://down/x", "owner-1", Tier::Pro))
        .await
        .unwrap();

    drain(&h.state).await;

    let done = admission::get_status(&h.state, job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Failed);
    let error = done.error.expect("failed job must carry an error");
    assert_eq!(error.kind, ErrorKind::MaxRetriesExceeded);
    // attempt_count at MaxRetriesExceeded equals the configured maximum.
    assert_eq!(done.attempt_count, h.state.config.max_attempts);
    assert!(done.result_ref.is_none());
}

#[tokio::test]
async fn non_retryable_failure_fails_immediately() {
    let h = harness();

    let job = admission::submit(&h.state, submit_req("mock://reject/x", "owner-1", Tier::Pro))
        .await
        .unwrap();

    drain(&h.state).await;

    let done = admission::get_status(&h.state, job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.error.unwrap().kind, ErrorKind::RenderFailed);
    assert_eq!(done.attempt_count, 1);
    assert_eq!(h.renderer.calls_for(job.id).await, 1);
}

#[tokio::test]
async fn weighted_dequeue_prefers_enterprise_under_backlog() {
    // 1:3 free:enterprise weighting with a single worker.
    let h = harness_with(HarnessOptions {
        tier_weight_free: 1,
        tier_weight_pro: 1,
        tier_weight_enterprise: 3,
        ..HarnessOptions::default()
    });

    let free_job = admission::submit(&h.state, submit_req("mock://ok/a", "owner-f", Tier::Free))
        .await
        .unwrap();
    let ent_job = admission::submit(
        &h.state,
        submit_req("mock://ok/b", "owner-e", Tier::Enterprise),
    )
    .await
    .unwrap();

    // One worker step: the enterprise job is served first.
    assert!(worker::process_next_job(&h.state).await.unwrap());

    let ent = admission::get_status(&h.state, ent_job.id).await.unwrap();
    let free = admission::get_status(&h.state, free_job.id).await.unwrap();
    assert_eq!(ent.status, JobStatus::Succeeded);
    assert_eq!(free.status, JobStatus::Queued);

    drain(&h.state).await;
    let free = admission::get_status(&h.state, free_job.id).await.unwrap();
    assert_eq!(free.status, JobStatus::Succeeded);
}

#[tokio::test]
async fn racing_claims_have_exactly_one_winner() {
    let h = harness();

    let job = admission::submit(&h.state, submit_req("mock://ok/x", "owner-1", Tier::Pro))
        .await
        .unwrap();

    // Two workers read the same snapshot after a redelivery and race the
    // version-guarded claim.
    let store = h.store.clone();
    let (first, second) = tokio::join!(
        store.mark_running(job.id, job.version),
        store.mark_running(job.id, job.version),
    );

    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        outcomes
            .iter()
            .filter(|r| matches!(r, Err(StoreError::Conflict)))
            .count(),
        1
    );

    let claimed = admission::get_status(&h.state, job.id).await.unwrap();
    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(claimed.attempt_count, 1);
}

#[tokio::test]
async fn crashed_worker_lease_expires_and_job_completes_once() {
    let h = harness_with(HarnessOptions {
        visibility_timeout_secs: 0,
        stale_running_secs: 0,
        ..HarnessOptions::default()
    });

    let job = admission::submit(&h.state, submit_req("mock://ok/x", "owner-1", Tier::Pro))
        .await
        .unwrap();

    // Worker one claims the job and crashes: no render, no ack.
    let msg = h.queue.dequeue().await.unwrap().unwrap();
    assert_eq!(msg.job_id, job.id);
    h.store.mark_running(job.id, job.version).await.unwrap();

    // Lease expiry makes the message deliverable again.
    worker::reaper::reap_once(&h.state, Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();

    // Worker two reconciles the stale running record and completes the job.
    drain(&h.state).await;

    let done = admission::get_status(&h.state, job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(h.renderer.calls_for(job.id).await, 1);
}

#[tokio::test]
async fn dead_lettered_message_fails_its_job() {
    let h = harness_with(HarnessOptions {
        visibility_timeout_secs: 0,
        max_deliveries: 1,
        ..HarnessOptions::default()
    });

    let job = admission::submit(&h.state, submit_req("mock://ok/x", "owner-1", Tier::Free))
        .await
        .unwrap();

    // Crash-loop: every delivery is claimed by a worker that dies before
    // acking, until the delivery budget runs out.
    for _ in 0..2 {
        h.queue.dequeue().await.unwrap().unwrap();
        worker::reaper::reap_once(&h.state, Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
    }

    assert_eq!(h.queue.dead_letters().await.len(), 1);

    let done = admission::get_status(&h.state, job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.error.unwrap().kind, ErrorKind::MaxRetriesExceeded);
    assert!(done.result_ref.is_none());
}

#[tokio::test]
async fn queue_stats_reflect_depth_and_in_flight() {
    let h = harness();

    admission::submit(&h.state, submit_req("mock://ok/a", "owner-1", Tier::Free))
        .await
        .unwrap();
    admission::submit(
        &h.state,
        submit_req("mock://ok/b", "owner-2", Tier::Enterprise),
    )
    .await
    .unwrap();

    let stats = admission::queue_stats(&h.state).await.unwrap();
    assert_eq!(stats.depth, 2);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.per_tier.get("free"), Some(&1));
    assert_eq!(stats.per_tier.get("enterprise"), Some(&1));
    assert!(stats.oldest_enqueue_age_secs.is_some());

    // Lease one message; it leaves the pending depth and enters in-flight.
    h.queue.dequeue().await.unwrap().unwrap();
    let stats = admission::queue_stats(&h.state).await.unwrap();
    assert_eq!(stats.depth, 1);
    assert_eq!(stats.in_flight, 1);
}

#[tokio::test]
async fn message_for_vanished_job_is_discarded() {
    let h = harness();

    // A message whose job record never existed (e.g. enqueue raced a failed
    // create on a previous deploy) must not wedge the worker.
    h.queue
        .enqueue(QueueMessage::new(uuid::Uuid::new_v4(), Tier::Free))
        .await
        .unwrap();

    drain(&h.state).await;
    let snapshot = h.queue.snapshot().await.unwrap();
    assert_eq!(snapshot.depth, 0);
    assert_eq!(snapshot.in_flight, 0);
}
