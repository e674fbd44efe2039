use metrics_exporter_prometheus::PrometheusBuilder;
use pic_analyzer::{
    config::AppConfig,
    db::{self, queries::PgJobRepository},
    routes::metrics::describe_metrics,
    services::{
        analysis::AnalysisWorker,
        artifacts::ArtifactStore,
        categories::CategoryTable,
        dispatcher::{Dispatcher, DispatcherSettings},
        fetch::HttpImageSource,
        inference::{InferenceEngine, OnnxBackend},
        queue::{QueueName, RedisQueue, TaskQueue},
        registry::{self, LabelCatalog},
        storage::S3Storage,
        worker::Consumer,
    },
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing_subscriber::EnvFilter;

const ERROR_BACKOFF_MS: u64 = 1000;
const DEPTH_SAMPLE_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting pic-analyzer worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let queues = config.queues().expect("Invalid WORKER_QUEUES");

    let metrics_addr: SocketAddr = config
        .worker_metrics_addr
        .parse()
        .expect("Invalid WORKER_METRICS_ADDR");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus exporter");

    describe_metrics();

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");
    let jobs = Arc::new(PgJobRepository::new(db_pool));

    let storage = Arc::new(
        S3Storage::new(
            &config.s3_bucket,
            &config.s3_endpoint,
            &config.s3_region,
            &config.s3_access_key,
            &config.s3_secret_key,
        )
        .expect("Failed to initialize object storage client"),
    );

    let queue: Arc<dyn TaskQueue> =
        Arc::new(RedisQueue::new(&config.redis_url).expect("Failed to initialize task queue"));

    // Model artifacts and label indexes must be on disk before the first job
    let artifacts = Arc::new(ArtifactStore::new(storage.clone(), &config.model_dir));
    artifacts
        .fetch_all(registry::all_artifacts())
        .await
        .expect("Failed to fetch model artifacts");

    let labels = LabelCatalog::load(artifacts.root()).expect("Failed to load label indexes");
    let categories = CategoryTable::builtin().expect("Invalid category table");
    let backend = Arc::new(OnnxBackend::new(&config.model_dir, config.ort_intra_threads));
    let engine = Arc::new(InferenceEngine::new(Arc::new(labels), categories, backend));

    let images = Arc::new(
        HttpImageSource::new(Duration::from_secs(config.image_fetch_timeout_secs))
            .expect("Failed to build HTTP client"),
    );

    let dispatcher = Arc::new(Dispatcher::new(
        jobs.clone(),
        storage,
        queue.clone(),
        DispatcherSettings::from(&config),
    ));
    let analysis = Arc::new(AnalysisWorker::new(
        jobs,
        images,
        artifacts,
        engine,
        config.top_k,
    ));
    let consumer = Arc::new(Consumer::new(queue.clone(), dispatcher, analysis));

    for &name in &queues {
        match queue.requeue_in_flight(name).await {
            Ok(0) => {}
            Ok(moved) => tracing::warn!(queue = %name, moved, "Requeued unacknowledged messages"),
            Err(e) => tracing::error!(queue = %name, error = %e, "Failed to requeue in-flight messages"),
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poll_timeout = Duration::from_secs(config.queue_poll_timeout_secs);

    let handles: Vec<_> = queues
        .iter()
        .map(|&name| {
            tokio::spawn(consume(
                consumer.clone(),
                name,
                queues.clone(),
                poll_timeout,
                shutdown_rx.clone(),
            ))
        })
        .collect();

    tracing::info!(queues = ?queues, "Worker ready, consuming queues");

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Shutdown signal received, finishing in-flight messages");
    shutdown_tx.send(true).ok();

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Consumer task panicked");
        }
    }

    tracing::info!("Worker stopped");
}

async fn consume(
    consumer: Arc<Consumer>,
    queue: QueueName,
    all_queues: Vec<QueueName>,
    poll_timeout: Duration,
    shutdown: watch::Receiver<bool>,
) {
    let mut last_sample: Option<Instant> = None;

    while !*shutdown.borrow() {
        if last_sample.is_none_or(|at| at.elapsed() >= DEPTH_SAMPLE_INTERVAL) {
            consumer.record_depths(&all_queues).await;
            last_sample = Some(Instant::now());
        }

        match consumer.process_next(queue, poll_timeout).await {
            Ok(true) => {
                tracing::debug!(queue = %queue, "Message processed, checking for next");
            }
            Ok(false) => {
                tracing::trace!(queue = %queue, "No messages available");
            }
            Err(e) => {
                tracing::error!(queue = %queue, error = %e, "Queue error, will retry");
                sleep(Duration::from_millis(ERROR_BACKOFF_MS)).await;
            }
        }
    }
}
