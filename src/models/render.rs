use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::{Job, JobError, OutputFormat, Tier};

/// Request to submit a render job.
#[derive(Debug, Deserialize, Validate)]
pub struct SubmitRequest {
    /// URI reference to the input document (e.g. `store://cvs/abc123`).
    /// The payload itself is never embedded in the request.
    #[garde(length(min = 1, max = 512), custom(looks_like_uri))]
    pub payload_ref: String,

    /// Opaque identity of the submitting principal.
    #[garde(length(min = 1, max = 128))]
    pub owner_id: String,

    #[garde(skip)]
    pub tier: Tier,

    #[garde(skip)]
    #[serde(default = "default_output_format")]
    pub output_format: OutputFormat,
}

fn default_output_format() -> OutputFormat {
    OutputFormat::Pdf
}

fn looks_like_uri(value: &str, _ctx: &()) -> garde::Result {
    match value.split_once("://") {
        Some((scheme, rest)) if !scheme.is_empty() && !rest.is_empty() => Ok(()),
        _ => Err(garde::Error::new("payload_ref must be a scheme-qualified URI")),
    }
}

/// Response after submitting a render job.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status: String,
}

/// Response for querying job status.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: String,
    pub tier: Tier,
    pub output_format: OutputFormat,
    pub attempt_count: i32,
    pub result_ref: Option<String>,
    pub error: Option<JobError>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        let duration_seconds = job.duration_seconds();
        Self {
            job_id: job.id,
            status: job.status.to_string(),
            tier: job.tier,
            output_format: job.output_format,
            attempt_count: job.attempt_count,
            result_ref: job.result_ref,
            error: job.error,
            cancel_requested: job.cancel_requested,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            duration_seconds,
        }
    }
}

/// Response after requesting cancellation.
#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub job_id: Uuid,
    pub status: String,
}
