use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use render_pipeline::app_state::AppState;
use render_pipeline::config::AppConfig;
use render_pipeline::db;
use render_pipeline::queue::RedisQueue;
use render_pipeline::routes;
use render_pipeline::services::renderer::RenderEngineClient;
use render_pipeline::services::storage::S3OutputStore;
use render_pipeline::store::PgJobStore;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing render-pipeline API server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!("render_jobs_submitted_total", "Total render jobs submitted");
    metrics::describe_counter!("render_jobs_succeeded_total", "Total render jobs completed");
    metrics::describe_counter!("render_jobs_failed_total", "Total render jobs that failed");
    metrics::describe_counter!(
        "render_jobs_cancelled_total",
        "Total render jobs cancelled before or during execution"
    );
    metrics::describe_counter!(
        "render_jobs_retried_total",
        "Total render attempts requeued after a retryable failure"
    );
    metrics::describe_counter!(
        "render_jobs_redelivered_total",
        "Total queue messages redelivered after lease expiry"
    );
    metrics::describe_counter!(
        "render_jobs_dead_lettered_total",
        "Total queue messages routed to the dead-letter list"
    );
    metrics::describe_histogram!(
        "render_duration_seconds",
        "Time spent in the render engine per attempt"
    );
    metrics::describe_gauge!("render_queue_depth", "Current number of pending queue messages");
    metrics::describe_gauge!("render_jobs_running", "Jobs currently in running state");

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL job store");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    let store = Arc::new(PgJobStore::new(db_pool));

    // Initialize Redis job queue
    tracing::info!("Connecting to Redis job queue");
    let queue = Arc::new(
        RedisQueue::new(
            &config.redis_url,
            &config.tier_weights(),
            config.visibility_timeout_secs,
            config.max_deliveries,
        )
        .expect("Failed to initialize job queue"),
    );

    // Initialize output store client
    tracing::info!("Initializing output store client");
    let output = Arc::new(
        S3OutputStore::new(
            &config.output_bucket,
            &config.output_endpoint,
            &config.output_access_key,
            &config.output_secret_key,
        )
        .expect("Failed to initialize output store"),
    );

    // Initialize render engine client. The API process never renders, but
    // sharing AppState with the worker keeps the wiring in one shape.
    let renderer = Arc::new(
        RenderEngineClient::new(
            &config.render_engine_url,
            Duration::from_secs(config.visibility_timeout_secs),
        )
        .expect("Failed to initialize render engine client"),
    );

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(store, queue, output, renderer, config);

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/health/ready", get(routes::health::readiness_check))
        .route("/health/live", get(routes::health::liveness_check))
        .route("/api/v1/render", post(routes::render::submit_render))
        .route("/api/v1/render/{job_id}", get(routes::render::get_job_status))
        .route(
            "/api/v1/render/{job_id}/cancel",
            post(routes::render::cancel_job),
        )
        .route(
            "/api/v1/render/{job_id}/output",
            get(routes::render::get_job_output),
        )
        .route("/api/v1/admin/queue-stats", get(routes::admin::queue_stats))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(256 * 1024)); // submissions carry references, not payloads

    tracing::info!("Starting render-pipeline on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
