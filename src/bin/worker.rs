use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use render_pipeline::app_state::AppState;
use render_pipeline::config::AppConfig;
use render_pipeline::db;
use render_pipeline::queue::RedisQueue;
use render_pipeline::services::renderer::RenderEngineClient;
use render_pipeline::services::storage::S3OutputStore;
use render_pipeline::store::PgJobStore;
use render_pipeline::worker;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting render worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Initialize database
    tracing::info!("Connecting to PostgreSQL job store");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    let store = Arc::new(PgJobStore::new(db_pool));

    // Initialize services
    tracing::info!("Initializing services");
    let queue = Arc::new(
        RedisQueue::new(
            &config.redis_url,
            &config.tier_weights(),
            config.visibility_timeout_secs,
            config.max_deliveries,
        )
        .expect("Failed to initialize job queue"),
    );

    let output = Arc::new(
        S3OutputStore::new(
            &config.output_bucket,
            &config.output_endpoint,
            &config.output_access_key,
            &config.output_secret_key,
        )
        .expect("Failed to initialize output store"),
    );

    // An attempt that outlives its lease will be redelivered anyway, so the
    // engine call is capped at the visibility window.
    let renderer = Arc::new(
        RenderEngineClient::new(
            &config.render_engine_url,
            Duration::from_secs(config.visibility_timeout_secs),
        )
        .expect("Failed to initialize render engine client"),
    );

    let state = AppState::new(store, queue, output, renderer, config);

    // Lease reaper runs alongside the job loop: redeliveries and
    // dead-lettering keep flowing even while a render is in progress.
    tokio::spawn(worker::reaper::run_loop(state.clone()));

    tracing::info!("Worker ready, starting job processing loop");
    worker::run_loop(state).await;
}
