//! Worker execution loop.
//!
//! Each worker process runs this loop, one job at a time, holding no state
//! between iterations. Correctness under redelivery races rests entirely on
//! the job store's version-guarded transitions: whichever worker claims
//! `queued -> running` first owns the attempt, and every loser discards its
//! message cleanly.
//!
//! Cancellation is cooperative. Two stages are interruptible: after the
//! claim and before the engine call, and after the engine call before the
//! artifact is published. A cancel that lands mid-render is honored at the
//! publish checkpoint.

pub mod reaper;

use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::time::sleep;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::job::{ErrorKind, Job, JobError, JobStatus};
use crate::queue::{QueueError, QueueMessage, RenderQueue};
use crate::services::renderer::{Renderer, Retryability};
use crate::services::storage::OutputStore;
use crate::store::{JobStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("job store error: {0}")]
    Store(#[from] StoreError),
}

/// Run the worker loop forever, polling at the configured idle interval.
pub async fn run_loop(state: AppState) {
    let poll_interval = Duration::from_millis(state.config.poll_interval_ms);

    loop {
        metrics::gauge!("worker_last_poll_seconds").set(Utc::now().timestamp() as f64);

        match process_next_job(&state).await {
            Ok(true) => {
                tracing::debug!("Job processed, checking for next job");
            }
            Ok(false) => {
                tracing::trace!("No jobs available, sleeping");
                sleep(poll_interval).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Error processing job, will retry");
                sleep(poll_interval).await;
            }
        }
    }
}

/// Process the next job from the queue.
/// Returns Ok(true) if a message was consumed, Ok(false) if the queue was idle.
pub async fn process_next_job(state: &AppState) -> Result<bool, WorkerError> {
    let Some(msg) = state.queue.dequeue().await? else {
        return Ok(false);
    };

    let Some(job) = state.store.get(msg.job_id).await? else {
        tracing::warn!(job_id = %msg.job_id, "Dequeued message for unknown job, dropping");
        state.queue.ack(&msg).await?;
        return Ok(true);
    };

    let job = match job.status {
        JobStatus::Queued => job,
        JobStatus::Running => {
            // A redelivered message for a job still marked running means its
            // previous worker blew past the lease. Reconcile it back to
            // queued once it has been running suspiciously long; otherwise
            // keep our lease unacked and let the reaper retry later.
            let stale_after = chrono::Duration::seconds(state.config.stale_running_secs);
            let is_stale = job
                .started_at
                .map_or(true, |started| Utc::now() - started >= stale_after);
            if !is_stale {
                tracing::warn!(
                    job_id = %job.id,
                    delivery_count = msg.delivery_count,
                    "Redelivered job is still running, leaving message leased"
                );
                return Ok(true);
            }
            match state.store.requeue(job.id, job.version).await {
                Ok(reconciled) => {
                    tracing::warn!(job_id = %job.id, "Reconciled stale running job back to queued");
                    reconciled
                }
                Err(StoreError::Conflict) | Err(StoreError::NotFound) => {
                    state.queue.ack(&msg).await?;
                    return Ok(true);
                }
                Err(e) => return Err(e.into()),
            }
        }
        // Already settled by another worker or by cancellation.
        JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled => {
            state.queue.ack(&msg).await?;
            return Ok(true);
        }
    };

    // Cancelled while sitting in the queue: settle without ever running.
    if job.cancel_requested {
        match state.store.mark_cancelled(job.id, job.version).await {
            Ok(_) => {
                metrics::counter!("render_jobs_cancelled_total").increment(1);
                tracing::info!(job_id = %job.id, "Cancelled queued job");
            }
            Err(StoreError::Conflict) | Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        state.queue.ack(&msg).await?;
        return Ok(true);
    }

    // A reconciled job that already spent its execution budget (crashed on
    // its final attempt) must not be claimed again: attempt_count never
    // exceeds the configured maximum.
    if job.attempt_count >= state.config.max_attempts {
        let error = JobError::new(
            ErrorKind::MaxRetriesExceeded,
            format!("execution budget exhausted after {} attempts", job.attempt_count),
        );
        match state.store.mark_failed(job.id, job.version, &error).await {
            Ok(_) => {
                metrics::counter!("render_jobs_failed_total").increment(1);
                tracing::error!(job_id = %job.id, "Job failed, no attempts remaining");
            }
            Err(StoreError::Conflict) | Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        state.queue.ack(&msg).await?;
        return Ok(true);
    }

    // Claim. Exactly one worker wins this transition per version; losers of
    // a redelivery race land here with a stale version and discard.
    let claimed = match state.store.mark_running(job.id, job.version).await {
        Ok(claimed) => claimed,
        Err(StoreError::Conflict) | Err(StoreError::NotFound) => {
            tracing::debug!(job_id = %job.id, "Lost claim race, discarding message");
            state.queue.ack(&msg).await?;
            return Ok(true);
        }
        Err(e) => return Err(e.into()),
    };

    tracing::info!(
        job_id = %claimed.id,
        tier = %claimed.tier,
        attempt = claimed.attempt_count,
        "Processing render job"
    );

    if settle_if_cancelled(state, &msg, claimed.id).await? {
        return Ok(true);
    }

    let start = Instant::now();
    match state.renderer.render(&claimed).await {
        Ok(bytes) => {
            metrics::histogram!("render_duration_seconds").record(start.elapsed().as_secs_f64());

            // Last interruptible stage: a cancel that arrived mid-render
            // wins over publishing the artifact.
            if settle_if_cancelled(state, &msg, claimed.id).await? {
                return Ok(true);
            }

            publish(state, &msg, &claimed, &bytes).await?;
        }
        Err(e) => {
            let retryable = e.retryability() == Retryability::Retryable;
            tracing::warn!(
                job_id = %claimed.id,
                attempt = claimed.attempt_count,
                retryable,
                error = %e,
                "Render attempt failed"
            );
            settle_failure(
                state,
                &msg,
                &claimed,
                retryable,
                ErrorKind::RenderFailed,
                e.to_string(),
            )
            .await?;
        }
    }

    Ok(true)
}

/// Cooperative cancellation checkpoint. Consults the flag and, when set,
/// settles the job and the message. Returns true if the caller should stop.
async fn settle_if_cancelled(
    state: &AppState,
    msg: &QueueMessage,
    job_id: Uuid,
) -> Result<bool, WorkerError> {
    let Some(fresh) = state.store.get(job_id).await? else {
        state.queue.ack(msg).await?;
        return Ok(true);
    };

    if !fresh.cancel_requested {
        return Ok(false);
    }

    match state.store.mark_cancelled(fresh.id, fresh.version).await {
        Ok(_) => {
            metrics::counter!("render_jobs_cancelled_total").increment(1);
            tracing::info!(job_id = %fresh.id, "Job cancelled at checkpoint");
        }
        Err(StoreError::Conflict) | Err(StoreError::NotFound) => {}
        Err(e) => return Err(e.into()),
    }
    state.queue.ack(msg).await?;
    Ok(true)
}

async fn publish(
    state: &AppState,
    msg: &QueueMessage,
    claimed: &Job,
    bytes: &[u8],
) -> Result<(), WorkerError> {
    let key = format!(
        "outputs/{}/{}.{}",
        claimed.owner_id,
        claimed.id,
        claimed.output_format.extension()
    );

    if let Err(e) = state
        .output
        .put(&key, bytes, claimed.output_format.content_type())
        .await
    {
        tracing::error!(job_id = %claimed.id, error = %e, "Failed to write artifact");
        return settle_failure(state, msg, claimed, true, ErrorKind::Storage, e.to_string()).await;
    }

    match state.store.mark_succeeded(claimed.id, claimed.version, &key).await {
        Ok(done) => {
            metrics::counter!("render_jobs_succeeded_total").increment(1);
            tracing::info!(
                job_id = %done.id,
                result_ref = %key,
                duration_seconds = done.duration_seconds(),
                "Render job succeeded"
            );
        }
        // Settled elsewhere (e.g. dead-lettered by the reaper between our
        // checkpoint and here); the guarded transition kept result_ref out.
        Err(StoreError::Conflict) | Err(StoreError::NotFound) => {
            tracing::warn!(job_id = %claimed.id, "Lost publish race, discarding result");
        }
        Err(e) => return Err(e.into()),
    }

    state.queue.ack(msg).await?;
    Ok(())
}

/// Settle a failed attempt: requeue while retryable attempts remain,
/// otherwise record the failure on the job.
async fn settle_failure(
    state: &AppState,
    msg: &QueueMessage,
    claimed: &Job,
    retryable: bool,
    kind: ErrorKind,
    detail: String,
) -> Result<(), WorkerError> {
    if retryable && claimed.attempt_count < state.config.max_attempts {
        match state.store.requeue(claimed.id, claimed.version).await {
            Ok(_) => {
                state.queue.ack(msg).await?;
                state
                    .queue
                    .enqueue(QueueMessage::new(claimed.id, claimed.tier))
                    .await?;
                metrics::counter!("render_jobs_retried_total").increment(1);
                tracing::info!(
                    job_id = %claimed.id,
                    attempt = claimed.attempt_count,
                    "Job requeued for retry"
                );
            }
            Err(StoreError::Conflict) | Err(StoreError::NotFound) => {
                state.queue.ack(msg).await?;
            }
            Err(e) => return Err(e.into()),
        }
        return Ok(());
    }

    let error = if retryable {
        JobError::new(
            ErrorKind::MaxRetriesExceeded,
            format!("{detail} (after {} attempts)", claimed.attempt_count),
        )
    } else {
        JobError::new(kind, detail)
    };

    match state.store.mark_failed(claimed.id, claimed.version, &error).await {
        Ok(_) => {
            metrics::counter!("render_jobs_failed_total").increment(1);
            tracing::error!(
                job_id = %claimed.id,
                kind = %error.kind,
                attempt = claimed.attempt_count,
                "Render job failed"
            );
        }
        Err(StoreError::Conflict) | Err(StoreError::NotFound) => {}
        Err(e) => return Err(e.into()),
    }
    state.queue.ack(msg).await?;
    Ok(())
}
