use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::{ApiError, ApiResult};
use crate::models::job::JobStatus;
use crate::models::render::{CancelResponse, JobStatusResponse, SubmitRequest, SubmitResponse};
use crate::services::admission;
use crate::services::storage::OutputStore;

/// POST /api/v1/render — submit a render job.
pub async fn submit_render(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let job = admission::submit(&state, req).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id: job.id,
            status: job.status.to_string(),
        }),
    ))
}

/// GET /api/v1/render/{job_id} — poll job status.
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobStatusResponse>> {
    let job = admission::get_status(&state, job_id).await?;
    Ok(Json(JobStatusResponse::from(job)))
}

/// POST /api/v1/render/{job_id}/cancel — request cooperative cancellation.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<CancelResponse>)> {
    let job = admission::cancel(&state, job_id).await?;

    let status = match job.status {
        JobStatus::Cancelled => "cancelled",
        _ => "cancel_requested",
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(CancelResponse {
            job_id: job.id,
            status: status.to_string(),
        }),
    ))
}

/// GET /api/v1/render/{job_id}/output — fetch the rendered artifact.
pub async fn get_job_output(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let job = admission::get_status(&state, job_id).await?;

    if job.status != JobStatus::Succeeded {
        return Err(ApiError::invalid_state(format!(
            "job {job_id} is {}, output is only available once succeeded",
            job.status
        )));
    }

    let result_ref = job
        .result_ref
        .as_deref()
        .ok_or_else(|| ApiError::Internal(format!("succeeded job {job_id} has no result ref")))?;

    let bytes = state.output.get(result_ref).await?;

    Ok((
        [(header::CONTENT_TYPE, job.output_format.content_type())],
        bytes,
    ))
}
