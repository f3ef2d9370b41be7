use std::sync::Arc;

use crate::config::AppConfig;
use crate::queue::RenderQueue;
use crate::services::renderer::Renderer;
use crate::services::storage::OutputStore;
use crate::store::JobStore;

/// Shared application state passed to route handlers and worker loops.
///
/// Everything behind the seams is trait-object so the same pipeline runs
/// against Postgres/Redis/S3 in production and the in-memory backends in
/// tests and single-process deployments.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn RenderQueue>,
    pub output: Arc<dyn OutputStore>,
    pub renderer: Arc<dyn Renderer>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn RenderQueue>,
        output: Arc<dyn OutputStore>,
        renderer: Arc<dyn Renderer>,
        config: AppConfig,
    ) -> Self {
        Self {
            store,
            queue,
            output,
            renderer,
            config: Arc::new(config),
        }
    }
}
