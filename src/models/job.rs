use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Status of a render job in the async pipeline.
///
/// Transitions: `Queued -> Running -> {Succeeded | Failed}`,
/// `Queued -> Cancelled`, `Running -> Cancelled` (cooperative), and
/// `Running -> Queued` (retry requeue / stale-lease reconciliation).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Priority/quota class of the submitting owner.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    /// All tiers, highest priority first. Queue partitioning iterates this.
    pub const ALL: [Tier; 3] = [Tier::Enterprise, Tier::Pro, Tier::Free];
}

/// Output format requested at submission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutputFormat {
    Pdf,
    Png,
    Html,
    Markdown,
}

impl OutputFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Pdf => "application/pdf",
            Self::Png => "image/png",
            Self::Html => "text/html",
            Self::Markdown => "text/markdown",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Png => "png",
            Self::Html => "html",
            Self::Markdown => "md",
        }
    }
}

/// Classification of a recorded job failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Deterministic render failure (malformed input content, engine rejection).
    RenderFailed,
    /// Retry budget or delivery budget exhausted.
    MaxRetriesExceeded,
    /// Artifact could not be written to the output store.
    Storage,
    /// Anything the pipeline could not classify.
    Internal,
}

/// Structured failure detail recorded on a failed job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A render job as persisted in the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub owner_id: String,
    pub tier: Tier,
    pub status: JobStatus,
    pub attempt_count: i32,
    pub payload_ref: String,
    pub output_format: OutputFormat,
    pub result_ref: Option<String>,
    pub error: Option<JobError>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency counter; bumped by every transition.
    pub version: i64,
}

impl Job {
    /// Wall-clock duration of the render, once started.
    pub fn duration_seconds(&self) -> Option<f64> {
        let started = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some((end - started).num_milliseconds() as f64 / 1000.0)
    }
}

/// Fields needed to create a new job record.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Uuid,
    pub owner_id: String,
    pub tier: Tier,
    pub payload_ref: String,
    pub output_format: OutputFormat,
}
