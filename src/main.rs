use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use text_jobs::app_state::AppState;
use text_jobs::clock::{Clock, SystemClock};
use text_jobs::config::AppConfig;
use text_jobs::services::jobs::JobService;
use text_jobs::services::queue::JobQueue;
use text_jobs::services::supervisor::Supervisor;
use text_jobs::services::worker::{WorkerContext, WorkerSettings};
use text_jobs::{db, routes};

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

    tracing::info!("Initializing text-jobs server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!("jobs_submitted_total", "Total jobs submitted");
    metrics::describe_counter!("jobs_completed_total", "Total jobs completed");
    metrics::describe_counter!("jobs_retried_total", "Total job retries recorded");
    metrics::describe_counter!("jobs_failed_total", "Total jobs that failed permanently");
    metrics::describe_counter!(
        "jobs_reaped_total",
        "Total lease-expired jobs returned to pending by the reaper"
    );
    metrics::describe_gauge!("job_queue_depth", "Current number of queued job ids");
    metrics::describe_histogram!("job_processing_seconds", "Time from claim to completion");

    // Initialize SQLite pool and schema
    tracing::info!(database_url = %config.database_url, "Opening job store");
    let db_pool = db::init_pool(&config.database_url, config.db_pool_size)
        .await
        .expect("Failed to open database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    let clock = Arc::new(SystemClock);
    let queue = Arc::new(JobQueue::new(config.queue_capacity));

    // Startup recovery: jobs abandoned by a previous process go back to
    // pending, and the queue hint is rebuilt from the store.
    let now = clock.now();
    let recovered = db::store::recover_startup(&db_pool, now)
        .await
        .expect("Failed to recover abandoned jobs");
    let pending = db::store::list_pending_ids(&db_pool, config.queue_capacity as i64)
        .await
        .expect("Failed to list pending jobs");
    let enqueued = pending.iter().filter(|id| queue.offer(**id)).count();
    tracing::info!(recovered, enqueued, "startup recovery complete");

    // Launch the worker pool and reaper under the supervisor
    let ctx = Arc::new(WorkerContext {
        db: db_pool.clone(),
        queue: queue.clone(),
        clock: clock.clone(),
        settings: WorkerSettings {
            lease_seconds: config.lease_seconds,
            max_retries: config.max_retries,
            fault_rate: config.fault_rate,
            work_delay_ms: config.work_delay_ms,
        },
    });
    let supervisor = Supervisor::start(
        ctx,
        config.worker_count,
        Duration::from_secs(config.reaper_interval),
        config.batch,
        Duration::from_millis(config.restart_backoff_ms),
    );

    // Build API routes
    let jobs = Arc::new(JobService::new(
        db_pool.clone(),
        queue.clone(),
        clock,
        config.max_text_bytes,
    ));
    let state = AppState::new(db_pool, queue, jobs, config.max_text_bytes);

    // Allow multipart framing overhead past the upload limit; the handler
    // enforces the precise per-file cap.
    let body_limit = config.max_text_bytes.saturating_mul(4) + 64 * 1024;
    let app = routes::create_router(state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(RequestBodyLimitLayer::new(body_limit));

    tracing::info!("Starting text-jobs on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // Drain in-flight work; stragglers are recovered by the reaper on next boot.
    supervisor
        .shutdown(Duration::from_secs(config.shutdown_grace))
        .await;
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
