//! Admission layer: submission, status, cancellation, queue stats.
//!
//! The only side effects here are job-store writes and queue enqueues; the
//! output store is worker territory.

use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::{ApiError, ApiResult};
use crate::models::job::{ErrorKind, Job, JobError, NewJob};
use crate::models::render::SubmitRequest;
use crate::queue::{QueueMessage, RenderQueue};
use crate::store::{JobStore, StoreError};

/// Bound on re-read-and-retry recovery from version conflicts.
const MAX_TRANSITION_RETRIES: usize = 3;

/// Validate a submission, reserve a quota slot, persist the job, enqueue it.
pub async fn submit(state: &AppState, req: SubmitRequest) -> ApiResult<Job> {
    req.validate()
        .map_err(|report| ApiError::Validation(report.to_string()))?;

    let new_job = NewJob {
        id: Uuid::new_v4(),
        owner_id: req.owner_id,
        tier: req.tier,
        payload_ref: req.payload_ref,
        output_format: req.output_format,
    };
    let ceiling = state.config.quota_ceiling(req.tier);

    let job = state.store.create(new_job, ceiling).await?;
    metrics::counter!("render_jobs_submitted_total").increment(1);

    tracing::info!(
        job_id = %job.id,
        owner_id = %job.owner_id,
        tier = %job.tier,
        "Render job submitted"
    );

    if let Err(e) = state
        .queue
        .enqueue(QueueMessage::new(job.id, job.tier))
        .await
    {
        // The record exists but can never be delivered; fail it rather than
        // leave the caller polling a job no worker will see.
        tracing::error!(job_id = %job.id, error = %e, "Enqueue failed after job creation");
        let _ = state
            .store
            .mark_failed(
                job.id,
                job.version,
                &JobError::new(ErrorKind::Internal, "job could not be enqueued"),
            )
            .await;
        return Err(e.into());
    }

    Ok(job)
}

/// Read-only job snapshot.
pub async fn get_status(state: &AppState, job_id: Uuid) -> ApiResult<Job> {
    state
        .store
        .get(job_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job {job_id}")))
}

/// Request cancellation. A queued job is cancelled outright; a running job
/// gets the cooperative flag and the worker settles it at the next
/// checkpoint.
pub async fn cancel(state: &AppState, job_id: Uuid) -> ApiResult<Job> {
    for _ in 0..MAX_TRANSITION_RETRIES {
        let job = get_status(state, job_id).await?;

        if job.status.is_terminal() {
            return Err(ApiError::invalid_state(format!(
                "job {job_id} is already {}",
                job.status
            )));
        }

        if job.status == crate::models::job::JobStatus::Queued {
            match state.store.mark_cancelled(job.id, job.version).await {
                Ok(cancelled) => {
                    metrics::counter!("render_jobs_cancelled_total").increment(1);
                    tracing::info!(job_id = %job_id, "Queued job cancelled");
                    return Ok(cancelled);
                }
                // Lost a race with a claim or another cancel; re-read.
                Err(StoreError::Conflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        match state.store.request_cancel(job_id).await? {
            Some(flagged) => {
                tracing::info!(job_id = %job_id, "Cancellation requested for running job");
                return Ok(flagged);
            }
            // Became terminal between the read and the flag write; re-read
            // so the caller gets the precise state error.
            None => continue,
        }
    }

    Err(ApiError::Internal(format!(
        "cancellation of job {job_id} kept conflicting; retry"
    )))
}

/// Admin queue statistics.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueueStatsResponse {
    pub depth: u64,
    pub oldest_enqueue_age_secs: Option<i64>,
    /// Messages currently leased to workers.
    pub in_flight: u64,
    /// Jobs currently in `running` state.
    pub running_jobs: u64,
    pub per_tier: std::collections::HashMap<String, u64>,
}

pub async fn queue_stats(state: &AppState) -> ApiResult<QueueStatsResponse> {
    let snapshot = state.queue.snapshot().await?;
    let running_jobs = state.store.running_count().await?;

    metrics::gauge!("render_queue_depth").set(snapshot.depth as f64);
    metrics::gauge!("render_jobs_running").set(running_jobs as f64);

    Ok(QueueStatsResponse {
        depth: snapshot.depth,
        oldest_enqueue_age_secs: snapshot.oldest_enqueue_age_secs,
        in_flight: snapshot.in_flight,
        running_jobs,
        per_tier: snapshot.per_tier,
    })
}
