//! Render engine client.
//!
//! The engine is an opaque downstream HTTP service: it takes a payload
//! reference and an output format and returns the rendered bytes. Failures
//! are classified here, at the point of failure: transport errors, timeouts
//! and 5xx responses are transient and worth a retry; a 4xx means the input
//! itself cannot render and never will.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::models::job::Job;

/// Whether a failed render is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    Retryable,
    NonRetryable,
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("render engine request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("render engine rejected the document: {0}")]
    Rejected(String),

    #[error("render engine unavailable: {0}")]
    Unavailable(String),
}

impl RenderError {
    pub fn retryability(&self) -> Retryability {
        match self {
            // Connection refused, DNS, timeouts, broken transfers.
            RenderError::Http(_) => Retryability::Retryable,
            RenderError::Unavailable(_) => Retryability::Retryable,
            // The engine looked at the document and said no.
            RenderError::Rejected(_) => Retryability::NonRetryable,
        }
    }
}

/// Executes one render attempt for a job.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, job: &Job) -> Result<Vec<u8>, RenderError>;
}

#[derive(Serialize)]
struct EngineRequest<'a> {
    payload_ref: &'a str,
    output_format: String,
}

/// HTTP client for the render engine service.
pub struct RenderEngineClient {
    http: Client,
    base_url: String,
}

impl RenderEngineClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, RenderError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Renderer for RenderEngineClient {
    async fn render(&self, job: &Job) -> Result<Vec<u8>, RenderError> {
        let url = format!("{}/render", self.base_url);

        let response = self
            .http
            .post(&url)
            .json(&EngineRequest {
                payload_ref: &job.payload_ref,
                output_format: job.output_format.to_string(),
            })
            .send()
            .await
            .map_err(RenderError::Http)?;

        let status = response.status();
        if status.is_client_error() {
            let detail = response.text().await.unwrap_or_default();
            return Err(RenderError::Rejected(format!("{status}: {detail}")));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(RenderError::Unavailable(format!("{status}: {detail}")));
        }

        let bytes = response.bytes().await.map_err(RenderError::Http)?;
        Ok(bytes.to_vec())
    }
}
