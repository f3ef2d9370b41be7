use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::Json;

use crate::app_state::AppState;
use crate::error::{ApiError, ApiResult};
use crate::services::admission::{self, QueueStatsResponse};

/// GET /api/v1/admin/queue-stats — queue depth, oldest-message age,
/// in-flight and per-tier counts. Requires the admin bearer token.
pub async fn queue_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<QueueStatsResponse>> {
    require_admin(&state, &headers)?;
    let stats = admission::queue_stats(&state).await?;
    Ok(Json(stats))
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(token) if token == state.config.admin_token => Ok(()),
        _ => Err(ApiError::Unauthorized(
            "admin token required".to_string(),
        )),
    }
}
