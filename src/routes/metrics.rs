use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use strum::IntoEnumIterator;

use crate::services::queue::{QueueName, TaskQueue};

/// Register metric descriptions shared by the server and the workers.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "analysis_jobs_submitted_total",
        "Analysis jobs queued, including resubmissions"
    );
    metrics::describe_counter!(
        "analysis_jobs_succeeded_total",
        "Analysis jobs that finished with a label"
    );
    metrics::describe_counter!(
        "analysis_jobs_failed_total",
        "Analysis jobs that failed, by error kind"
    );
    metrics::describe_histogram!(
        "analysis_inference_seconds",
        "Time from image fetch to classification result, by model"
    );
    metrics::describe_gauge!(
        "analysis_queue_depth",
        "Messages waiting in each task queue"
    );
}

/// State of the scrape endpoint: the recorder handle plus the queue whose
/// depth is sampled on every scrape.
#[derive(Clone)]
pub struct MetricsState {
    pub handle: Arc<PrometheusHandle>,
    pub queue: Arc<dyn TaskQueue>,
}

/// Prometheus metrics scrape endpoint.
/// Returns metrics in Prometheus text exposition format.
pub async fn prometheus_metrics(State(state): State<MetricsState>) -> impl IntoResponse {
    for queue in QueueName::iter() {
        match state.queue.depth(queue).await {
            Ok(depth) => {
                metrics::gauge!("analysis_queue_depth", "queue" => queue.to_string()).set(depth as f64)
            }
            Err(e) => tracing::warn!(queue = %queue, error = %e, "Failed to sample queue depth"),
        }
    }
    state.handle.render()
}
