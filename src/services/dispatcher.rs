//! Task dispatcher.
//!
//! Accepts uploads, stages them for the ingest workers, turns ingested
//! uploads into stored images with Pending jobs, and queues jobs for
//! analysis.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::repository::{JobRepository, NewAnalysis, RepoError};
use crate::models::job::{AnalysisJob, FailureDetail, JobStatus, TransitionError};
use crate::services::analysis::INTERNAL_ERROR_KIND;
use crate::services::queue::{AnalyzeTask, IngestTask, QueueError, TaskMessage, TaskQueue};
use crate::services::storage::{ObjectStorage, StorageError};

/// Prefix of stored upload keys.
pub const UPLOAD_PREFIX: &str = "uploads";

const MAX_SLUG_LEN: usize = 40;

/// One file from a submission form.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Please select at least one image.")]
    NoImages,

    #[error("You can upload up to {max} images at a time (got {got}).")]
    TooManyImages { max: usize, got: usize },

    #[error("No valid image files were found.")]
    NoValidImages,

    #[error("{0}")]
    InvalidField(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Analysis job {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue failure: {0}")]
    Queue(#[from] QueueError),

    #[error("Repository failure: {0}")]
    Repo(#[from] RepoError),

    #[error("Failed to stage upload: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a submission: how many images were queued, how many skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub accepted: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub max_images: usize,
    pub signed_url_ttl_secs: u64,
    pub upload_tmp_dir: PathBuf,
}

impl From<&AppConfig> for DispatcherSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_images: config.max_images_per_request,
            signed_url_ttl_secs: config.signed_url_ttl_secs,
            upload_tmp_dir: PathBuf::from(&config.upload_tmp_dir),
        }
    }
}

pub struct Dispatcher {
    jobs: Arc<dyn JobRepository>,
    storage: Arc<dyn ObjectStorage>,
    queue: Arc<dyn TaskQueue>,
    settings: DispatcherSettings,
}

impl Dispatcher {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        storage: Arc<dyn ObjectStorage>,
        queue: Arc<dyn TaskQueue>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            jobs,
            storage,
            queue,
            settings,
        }
    }

    /// Validate a submission and queue one ingest task per decodable image.
    pub async fn submit(
        &self,
        user_id: i64,
        images: Vec<UploadedImage>,
        model_name: &str,
        use_category: bool,
    ) -> Result<SubmissionReceipt, DispatchError> {
        if images.is_empty() {
            return Err(ValidationError::NoImages.into());
        }
        if images.len() > self.settings.max_images {
            return Err(ValidationError::TooManyImages {
                max: self.settings.max_images,
                got: images.len(),
            }
            .into());
        }

        let total = images.len();
        let valid: Vec<UploadedImage> = images
            .into_iter()
            .filter(|image| {
                let ok = is_decodable(&image.bytes);
                if !ok {
                    tracing::info!(
                        user_id,
                        file_name = %image.file_name,
                        "Skipping undecodable upload"
                    );
                }
                ok
            })
            .collect();

        if valid.is_empty() {
            return Err(ValidationError::NoValidImages.into());
        }

        let accepted = valid.len();
        for image in valid {
            let temp_path = self.stage(&image).await?;
            let task = IngestTask {
                temp_path: temp_path.display().to_string(),
                image_key: stable_key(&image.file_name),
                original_name: image.file_name,
                user_id,
                model_name: model_name.to_string(),
                use_category,
            };

            if let Err(e) = self.queue.enqueue(&TaskMessage::IngestImage(task)).await {
                if let Err(cleanup) = tokio::fs::remove_file(&temp_path).await {
                    tracing::warn!(path = %temp_path.display(), error = %cleanup, "Failed to remove staged upload");
                }
                return Err(e.into());
            }
        }

        tracing::info!(user_id, accepted, skipped = total - accepted, model = %model_name, "Submission queued");

        Ok(SubmissionReceipt {
            accepted,
            skipped: total - accepted,
        })
    }

    /// Write an upload to the shared staging directory.
    async fn stage(&self, image: &UploadedImage) -> Result<PathBuf, DispatchError> {
        let dir = self.settings.upload_tmp_dir.clone();
        let suffix = extension(&image.file_name);
        let bytes = image.bytes.clone();

        let path = tokio::task::spawn_blocking(move || -> std::io::Result<PathBuf> {
            std::fs::create_dir_all(&dir)?;
            let mut file = tempfile::Builder::new()
                .prefix("upload-")
                .suffix(&suffix)
                .tempfile_in(&dir)?;
            file.write_all(&bytes)?;
            let (_, path) = file.keep()?;
            Ok(path)
        })
        .await
        .map_err(std::io::Error::other)??;

        Ok(path)
    }

    /// Ingest worker step: store the staged upload, create its job and queue
    /// it for analysis. A redelivered task finds the job created under the
    /// same key and only queues it again if it is still Pending.
    pub async fn ingest(&self, task: &IngestTask) -> Result<AnalysisJob, DispatchError> {
        let bytes = tokio::fs::read(&task.temp_path).await?;

        let content_type = image::guess_format(&bytes)
            .map(|format| format.to_mime_type())
            .unwrap_or("application/octet-stream");
        self.storage.put(&task.image_key, &bytes, content_type).await?;

        // the staged file is only expendable once the object is stored
        if let Err(e) = tokio::fs::remove_file(&task.temp_path).await {
            tracing::warn!(path = %task.temp_path, error = %e, "Failed to remove staged upload");
        }

        let created = self
            .jobs
            .create(NewAnalysis {
                user_id: task.user_id,
                image_key: task.image_key.clone(),
                model_name: task.model_name.clone(),
                use_category: task.use_category,
            })
            .await?;
        let job = created.job;

        if !created.inserted {
            tracing::info!(job_id = %job.id, image_key = %job.image.key, status = %job.status, "Upload already ingested");
            if job.status != JobStatus::Pending {
                return Ok(job);
            }
        }

        self.queue_or_fail(&job).await?;

        if created.inserted {
            metrics::counter!("analysis_jobs_submitted_total").increment(1);
            tracing::info!(
                job_id = %job.id,
                image_key = %job.image.key,
                user_id = job.user_id,
                "Image ingested"
            );
        }
        Ok(job)
    }

    /// Reset a finished job to Pending with a new model configuration and
    /// queue it again.
    pub async fn resubmit(
        &self,
        job_id: Uuid,
        model_name: &str,
        use_category: bool,
    ) -> Result<AnalysisJob, DispatchError> {
        let mut job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or(DispatchError::NotFound(job_id))?;

        job.resubmit(model_name, use_category)?;
        self.jobs.save(&mut job).await?;
        self.queue_or_fail(&job).await?;
        metrics::counter!("analysis_jobs_submitted_total").increment(1);

        tracing::info!(job_id = %job.id, model = %model_name, use_category, "Job resubmitted");
        Ok(job)
    }

    /// Queue a Pending job for analysis. When that fails the job is marked
    /// Failed, so it does not wait forever and can be resubmitted.
    async fn queue_or_fail(&self, job: &AnalysisJob) -> Result<(), DispatchError> {
        let Err(err) = self.enqueue_analysis(job).await else {
            return Ok(());
        };

        tracing::error!(job_id = %job.id, error = %err, "Failed to queue job for analysis, marking it failed");
        let failure = FailureDetail {
            kind: INTERNAL_ERROR_KIND.to_string(),
            detail: format!("Failed to queue analysis\ncaused by: {}", err),
        };
        match self
            .jobs
            .mark_ended(job.id, job.version, &failure, Utc::now())
            .await
        {
            Ok(()) => {
                metrics::counter!("analysis_jobs_failed_total", "error_kind" => INTERNAL_ERROR_KIND)
                    .increment(1);
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to mark unqueued job failed");
            }
        }
        Err(err)
    }

    async fn enqueue_analysis(&self, job: &AnalysisJob) -> Result<(), DispatchError> {
        let image_url = self
            .storage
            .signed_url(&job.image.key, self.settings.signed_url_ttl_secs)
            .await?;

        self.queue
            .enqueue(&TaskMessage::AnalyzeImage(AnalyzeTask {
                job_id: job.id,
                run_id: job.run_id,
                image_url,
                model_name: job.model_name.clone(),
                use_category: job.use_category,
            }))
            .await?;
        Ok(())
    }

    /// 1-based queue position of every Pending job.
    pub async fn waiting_positions(&self) -> Result<HashMap<Uuid, usize>, DispatchError> {
        let pending = self.jobs.pending_order().await?;
        Ok(waiting_positions(&pending))
    }

    /// Delete an image with its job, then the stored object.
    /// Returns false when the image does not exist.
    pub async fn delete_image(&self, image_id: Uuid) -> Result<bool, DispatchError> {
        let Some(image) = self.jobs.delete_image(image_id).await? else {
            return Ok(false);
        };

        match self.storage.delete(&image.key).await {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        tracing::info!(image_id = %image_id, image_key = %image.key, "Image deleted");
        Ok(true)
    }
}

/// Positions for ids already ordered oldest first.
pub fn waiting_positions(pending: &[Uuid]) -> HashMap<Uuid, usize> {
    pending
        .iter()
        .enumerate()
        .map(|(index, id)| (*id, index + 1))
        .collect()
}

pub fn is_decodable(bytes: &[u8]) -> bool {
    image::load_from_memory(bytes).is_ok()
}

/// Storage key for an upload: `uploads/{slug}-{6 hex}{ext}`.
pub fn stable_key(original_name: &str) -> String {
    let stem = Path::new(original_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();

    let mut slug = slugify(stem);
    if slug.is_empty() {
        slug.push_str("image");
    }

    let unique = Uuid::new_v4().simple().to_string();
    format!(
        "{}/{}-{}{}",
        UPLOAD_PREFIX,
        slug,
        &unique[..6],
        extension(original_name)
    )
}

/// NFKD-folded to ASCII, lowercased, keeping alphanumerics, `_` and `-`;
/// runs of whitespace and dashes collapse into one dash.
fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    for c in value.nfkd().filter(char::is_ascii) {
        if c.is_ascii_alphanumeric() || c == '_' {
            slug.push(c.to_ascii_lowercase());
        } else if (c.is_whitespace() || c == '-') && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches(|c: char| c == '-' || c == '_')
        .chars()
        .take(MAX_SLUG_LEN)
        .collect()
}

/// Lowercased extension with its dot, or empty.
fn extension(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default()
}
