//! Test harness: the full pipeline wired against the in-memory backends,
//! with a scriptable render engine.
//!
//! The fake engine keys its behavior off the payload reference scheme:
//! - `mock://ok/...`            renders successfully
//! - `mock://reject/...`        deterministic rejection (non-retryable)
//! - `mock://down/...`          engine unavailable (retryable, never recovers)
//! - `mock://flaky/<n>/...`     unavailable for the first `n` attempts
//! - `mock://cancel-during/...` requests cancellation of its own job
//!   mid-render, exercising the pre-publish checkpoint

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use render_pipeline::app_state::AppState;
use render_pipeline::config::AppConfig;
use render_pipeline::models::job::{Job, OutputFormat, Tier};
use render_pipeline::models::render::SubmitRequest;
use render_pipeline::queue::MemoryQueue;
use render_pipeline::services::renderer::{RenderError, Renderer};
use render_pipeline::services::storage::MemoryOutputStore;
use render_pipeline::store::{JobStore, MemoryJobStore};
use render_pipeline::worker;

pub struct FakeRenderer {
    store: Arc<MemoryJobStore>,
    calls: Mutex<HashMap<Uuid, u32>>,
}

impl FakeRenderer {
    fn new(store: Arc<MemoryJobStore>) -> Self {
        Self {
            store,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Render attempts observed for one job.
    pub async fn calls_for(&self, job_id: Uuid) -> u32 {
        self.calls.lock().await.get(&job_id).copied().unwrap_or(0)
    }

    pub async fn total_calls(&self) -> u32 {
        self.calls.lock().await.values().sum()
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn render(&self, job: &Job) -> Result<Vec<u8>, RenderError> {
        let attempt = {
            let mut calls = self.calls.lock().await;
            let n = calls.entry(job.id).or_insert(0);
            *n += 1;
            *n
        };

        let path = job.payload_ref.strip_prefix("mock://").unwrap_or("");

        if path.starts_with("reject") {
            return Err(RenderError::Rejected("engine rejected the document".to_string()));
        }
        if path.starts_with("down") {
            return Err(RenderError::Unavailable("engine offline".to_string()));
        }
        if let Some(rest) = path.strip_prefix("flaky/") {
            let failures: u32 = rest
                .split('/')
                .next()
                .and_then(|n| n.parse().ok())
                .unwrap_or(0);
            if attempt <= failures {
                return Err(RenderError::Unavailable(format!(
                    "engine hiccup on attempt {attempt}"
                )));
            }
        }
        if path.starts_with("cancel-during") {
            // Cancellation arriving while the render is in flight; the
            // worker must honor it at the publish checkpoint.
            let _ = self.store.request_cancel(job.id).await;
        }

        Ok(format!("rendered:{}", job.payload_ref).into_bytes())
    }
}

pub struct HarnessOptions {
    pub max_attempts: i32,
    pub max_deliveries: u32,
    pub visibility_timeout_secs: u64,
    pub stale_running_secs: i64,
    pub tier_weight_free: u32,
    pub tier_weight_pro: u32,
    pub tier_weight_enterprise: u32,
    pub quota_free: i32,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_deliveries: 5,
            visibility_timeout_secs: 60,
            stale_running_secs: 300,
            tier_weight_free: 1,
            tier_weight_pro: 2,
            tier_weight_enterprise: 4,
            quota_free: 2,
        }
    }
}

pub struct Harness {
    pub state: AppState,
    pub store: Arc<MemoryJobStore>,
    pub queue: Arc<MemoryQueue>,
    pub output: Arc<MemoryOutputStore>,
    pub renderer: Arc<FakeRenderer>,
}

pub fn harness() -> Harness {
    harness_with(HarnessOptions::default())
}

pub fn harness_with(opts: HarnessOptions) -> Harness {
    let config = AppConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        database_url: "postgres://unused".to_string(),
        redis_url: "redis://unused".to_string(),
        render_engine_url: "http://unused".to_string(),
        output_bucket: "unused".to_string(),
        output_endpoint: "http://unused".to_string(),
        output_access_key: "unused".to_string(),
        output_secret_key: "unused".to_string(),
        admin_token: "test-admin-token".to_string(),
        max_attempts: opts.max_attempts,
        max_deliveries: opts.max_deliveries,
        visibility_timeout_secs: opts.visibility_timeout_secs,
        poll_interval_ms: 10,
        reap_interval_secs: 1,
        stale_running_secs: opts.stale_running_secs,
        tier_weight_free: opts.tier_weight_free,
        tier_weight_pro: opts.tier_weight_pro,
        tier_weight_enterprise: opts.tier_weight_enterprise,
        quota_free: opts.quota_free,
        quota_pro: 10,
        quota_enterprise: 50,
    };

    let store = Arc::new(MemoryJobStore::new());
    let queue = Arc::new(MemoryQueue::new(
        &config.tier_weights(),
        config.visibility_timeout_secs,
        config.max_deliveries,
    ));
    let output = Arc::new(MemoryOutputStore::new());
    let renderer = Arc::new(FakeRenderer::new(store.clone()));

    let state = AppState::new(
        store.clone(),
        queue.clone(),
        output.clone(),
        renderer.clone(),
        config,
    );

    Harness {
        state,
        store,
        queue,
        output,
        renderer,
    }
}

pub fn submit_req(payload_ref: &str, owner_id: &str, tier: Tier) -> SubmitRequest {
    SubmitRequest {
        payload_ref: payload_ref.to_string(),
        owner_id: owner_id.to_string(),
        tier,
        output_format: OutputFormat::Pdf,
    }
}

/// Run the worker until the queue yields nothing.
pub async fn drain(state: &AppState) {
    while worker::process_next_job(state).await.expect("worker step failed") {}
}
