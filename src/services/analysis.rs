//! Analysis worker.
//!
//! Drives one job through Running to Succeeded or Failed: fetch the image,
//! make sure the model artifacts are local, classify on a blocking thread,
//! persist the result.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use uuid::Uuid;

use crate::db::repository::{JobRepository, RepoError};
use crate::models::job::{AnalysisJob, FailureDetail, JobStatus, TransitionError};
use crate::models::prediction::AnalysisOutcome;
use crate::services::artifacts::{ArtifactError, ArtifactStore};
use crate::services::fetch::{FetchError, ImageSource};
use crate::services::inference::{InferenceEngine, InferenceError};
use crate::services::queue::AnalyzeTask;
use crate::services::registry::ModelKind;

/// Error kind recorded when the worker itself failed.
pub const INTERNAL_ERROR_KIND: &str = "Internal";

/// Why one analysis run failed. Recorded into the job, never propagated.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Failed to fetch image")]
    ImageFetch(#[source] FetchError),

    #[error("Failed to decode image")]
    ImageDecode(#[source] image::ImageError),

    #[error("Failed to fetch model artifact")]
    Artifact(#[source] ArtifactError),

    #[error("Classification failed")]
    Inference(#[source] InferenceError),

    #[error("Inference task aborted: {0}")]
    Aborted(String),
}

impl JobError {
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::ImageFetch(_) => "ImageFetch",
            JobError::ImageDecode(_) => "ImageDecode",
            JobError::Artifact(_) => "ArtifactFetch",
            JobError::Inference(e) => e.kind(),
            JobError::Aborted(_) => INTERNAL_ERROR_KIND,
        }
    }

    pub fn failure(&self) -> FailureDetail {
        FailureDetail {
            kind: self.kind().to_string(),
            detail: error_chain(self),
        }
    }
}

/// An error and its sources, one per line.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut chain = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push_str("\ncaused by: ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}

/// Problems handling a message that could not be recorded into the job.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Analysis job {0} not found")]
    JobNotFound(Uuid),

    #[error("Failed to load analysis job {job_id}: {source}")]
    Load {
        job_id: Uuid,
        #[source]
        source: RepoError,
    },

    #[error("Failed to persist analysis job {job_id}: {source}")]
    Persist {
        job_id: Uuid,
        #[source]
        source: RepoError,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// What happened to a delivered analysis message.
#[derive(Debug, Clone, PartialEq)]
pub enum Handled {
    Finished(JobStatus),
    /// The job was already terminal or was written by someone else first.
    Skipped,
}

pub struct AnalysisWorker {
    jobs: Arc<dyn JobRepository>,
    images: Arc<dyn ImageSource>,
    artifacts: Arc<ArtifactStore>,
    engine: Arc<InferenceEngine>,
    top_k: usize,
}

impl AnalysisWorker {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        images: Arc<dyn ImageSource>,
        artifacts: Arc<ArtifactStore>,
        engine: Arc<InferenceEngine>,
        top_k: usize,
    ) -> Self {
        Self {
            jobs,
            images,
            artifacts,
            engine,
            top_k,
        }
    }

    pub async fn handle(&self, task: &AnalyzeTask) -> Result<Handled, WorkerError> {
        let mut job = match self.jobs.get(task.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return Err(WorkerError::JobNotFound(task.job_id)),
            Err(source) => {
                return Err(WorkerError::Load {
                    job_id: task.job_id,
                    source,
                })
            }
        };

        if task.run_id != job.run_id {
            tracing::info!(job_id = %job.id, run_id = %task.run_id, "Message belongs to an earlier run, skipping delivery");
            return Ok(Handled::Skipped);
        }

        if job.status.is_terminal() {
            tracing::info!(job_id = %job.id, status = %job.status, "Job already finished, skipping delivery");
            return Ok(Handled::Skipped);
        }

        job.start(Utc::now())?;
        match self.jobs.save(&mut job).await {
            Ok(()) => {}
            Err(RepoError::Conflict(_)) => {
                tracing::warn!(job_id = %job.id, "Job changed before start was recorded, dropping delivery");
                return Ok(Handled::Skipped);
            }
            Err(source) => {
                return Err(WorkerError::Persist {
                    job_id: job.id,
                    source,
                })
            }
        }

        tracing::info!(
            job_id = %job.id,
            model = %job.model_name,
            use_category = job.use_category,
            "Analysis started"
        );

        let kind = ModelKind::resolve(&job.model_name);
        let started = Instant::now();
        let result = self.run(&task.image_url, kind, job.use_category).await;
        let elapsed = started.elapsed();
        metrics::histogram!("analysis_inference_seconds", "model" => kind.to_string())
            .record(elapsed.as_secs_f64());

        let outcome = result.map_err(|e| {
            tracing::error!(
                job_id = %job.id,
                error_kind = e.kind(),
                error = %error_chain(&e),
                "Analysis failed"
            );
            e.failure()
        });

        job.complete(outcome, Utc::now())?;
        self.finish(job, elapsed.as_millis()).await
    }

    /// Persist a completed job, falling back to stamping it failed when the
    /// full record cannot be written.
    async fn finish(&self, mut job: AnalysisJob, elapsed_ms: u128) -> Result<Handled, WorkerError> {
        let expected_version = job.version;
        match self.jobs.save(&mut job).await {
            Ok(()) => {
                match job.status {
                    JobStatus::Succeeded => {
                        metrics::counter!("analysis_jobs_succeeded_total").increment(1);
                        tracing::info!(
                            job_id = %job.id,
                            label = job.label.as_deref().unwrap_or_default(),
                            reliability = job.reliability.unwrap_or_default(),
                            elapsed_ms = elapsed_ms as u64,
                            "Analysis succeeded"
                        );
                    }
                    _ => {
                        let kind = job.error_kind.clone().unwrap_or_default();
                        metrics::counter!("analysis_jobs_failed_total", "error_kind" => kind).increment(1);
                    }
                }
                Ok(Handled::Finished(job.status))
            }
            Err(RepoError::Conflict(_)) => {
                tracing::warn!(job_id = %job.id, "Job changed while running, result dropped");
                Ok(Handled::Skipped)
            }
            Err(source) => {
                tracing::error!(job_id = %job.id, error = %source, "Failed to save result, marking job failed");
                let failure = FailureDetail {
                    kind: INTERNAL_ERROR_KIND.to_string(),
                    detail: format!("Failed to persist result\ncaused by: {}", source),
                };
                metrics::counter!("analysis_jobs_failed_total", "error_kind" => INTERNAL_ERROR_KIND)
                    .increment(1);
                self.jobs
                    .mark_ended(job.id, expected_version, &failure, Utc::now())
                    .await
                    .map_err(|source| WorkerError::Persist {
                        job_id: job.id,
                        source,
                    })?;
                Ok(Handled::Finished(JobStatus::Failed))
            }
        }
    }

    async fn run(
        &self,
        image_url: &str,
        kind: ModelKind,
        use_category: bool,
    ) -> Result<AnalysisOutcome, JobError> {
        let bytes = self
            .images
            .fetch(image_url)
            .await
            .map_err(JobError::ImageFetch)?;
        let image = image::load_from_memory(&bytes).map_err(JobError::ImageDecode)?;

        self.artifacts
            .fetch(kind.spec().artifact)
            .await
            .map_err(JobError::Artifact)?;
        if use_category {
            self.artifacts
                .fetch(ModelKind::HUMAN.spec().artifact)
                .await
                .map_err(JobError::Artifact)?;
        }

        let engine = Arc::clone(&self.engine);
        let top_k = self.top_k;

        tokio::task::spawn_blocking(move || engine.analyze(kind, &image, use_category, top_k))
            .await
            .map_err(|e| JobError::Aborted(e.to_string()))?
            .map_err(JobError::Inference)
    }
}
