use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use pic_analyzer::{
    app_state::AppState,
    auth::JwtVerifier,
    config::AppConfig,
    db::{self, queries::PgJobRepository},
    routes::{
        self,
        metrics::{describe_metrics, MetricsState},
    },
    services::{dispatcher::DispatcherSettings, queue::RedisQueue, storage::S3Storage},
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing pic-analyzer API server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    describe_metrics();

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    tracing::info!(bucket = %config.s3_bucket, "Initializing object storage client");
    let storage = S3Storage::new(
        &config.s3_bucket,
        &config.s3_endpoint,
        &config.s3_region,
        &config.s3_access_key,
        &config.s3_secret_key,
    )
    .expect("Failed to initialize object storage client");

    tracing::info!("Connecting to Redis task queues");
    let queue = Arc::new(RedisQueue::new(&config.redis_url).expect("Failed to initialize task queue"));

    let state = AppState::new(
        Arc::new(PgJobRepository::new(db_pool)),
        Arc::new(storage),
        queue.clone(),
        JwtVerifier::new(&config.jwt_secret),
        DispatcherSettings::from(&config),
    );

    let app = routes::router(
        state,
        MetricsState {
            handle: prometheus_handle,
            queue,
        },
    );

    tracing::info!("Starting pic-analyzer on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server error");
}
