//! Queue consumer shared by the worker binary and the pipeline tests.

use std::sync::Arc;
use std::time::Duration;

use crate::services::analysis::{error_chain, AnalysisWorker};
use crate::services::dispatcher::Dispatcher;
use crate::services::queue::{Delivery, QueueError, QueueName, TaskMessage, TaskQueue};

/// Pulls messages off one queue at a time and routes them to the ingest or
/// analysis handler.
pub struct Consumer {
    queue: Arc<dyn TaskQueue>,
    dispatcher: Arc<Dispatcher>,
    analysis: Arc<AnalysisWorker>,
}

impl Consumer {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        dispatcher: Arc<Dispatcher>,
        analysis: Arc<AnalysisWorker>,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            analysis,
        }
    }

    /// Process the next message from `queue`.
    /// Returns Ok(true) if a message was handled, Ok(false) if none arrived
    /// before `timeout`. Handler failures are logged, never returned.
    pub async fn process_next(&self, queue: QueueName, timeout: Duration) -> Result<bool, QueueError> {
        let delivery = match self.queue.receive(queue, timeout).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => return Ok(false),
            Err(QueueError::Malformed { queue, reason }) => {
                tracing::error!(queue = %queue, reason = %reason, "Dropped malformed message");
                return Ok(true);
            }
            Err(e) => return Err(e),
        };

        self.dispatch(&delivery).await;

        // at-least-once: ack only after the handler returned
        self.queue.ack(&delivery).await?;
        Ok(true)
    }

    async fn dispatch(&self, delivery: &Delivery) {
        match &delivery.message {
            TaskMessage::IngestImage(task) => {
                tracing::info!(
                    temp_path = %task.temp_path,
                    user_id = task.user_id,
                    "Ingesting upload"
                );
                if let Err(e) = self.dispatcher.ingest(task).await {
                    tracing::error!(
                        temp_path = %task.temp_path,
                        user_id = task.user_id,
                        error = %error_chain(&e),
                        "Ingest failed"
                    );
                }
            }
            TaskMessage::AnalyzeImage(task) => {
                tracing::info!(job_id = %task.job_id, model = %task.model_name, "Processing analysis job");
                match self.analysis.handle(task).await {
                    Ok(handled) => {
                        tracing::debug!(job_id = %task.job_id, outcome = ?handled, "Analysis message handled");
                    }
                    Err(e) => {
                        tracing::error!(
                            job_id = %task.job_id,
                            error = %error_chain(&e),
                            "Analysis job could not be processed"
                        );
                    }
                }
            }
        }
    }

    /// Refresh the queue depth gauges.
    pub async fn record_depths(&self, queues: &[QueueName]) {
        for &queue in queues {
            match self.queue.depth(queue).await {
                Ok(depth) => {
                    metrics::gauge!("analysis_queue_depth", "queue" => queue.to_string()).set(depth as f64);
                }
                Err(e) => tracing::warn!(queue = %queue, error = %e, "Failed to read queue depth"),
            }
        }
    }
}
