//! Job repository seam.
//!
//! Handlers and workers talk to persistence through [`JobRepository`] so the
//! pipeline can run against Postgres in production and an in-memory store in
//! tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::job::{AnalysisJob, FailureDetail, ImageRef, JobStatus};

/// A stored upload that needs an image row and its Pending job.
#[derive(Debug, Clone)]
pub struct NewAnalysis {
    pub user_id: i64,
    pub image_key: String,
    pub model_name: String,
    pub use_category: bool,
}

/// Outcome of [`JobRepository::create`].
#[derive(Debug, Clone)]
pub struct CreatedJob {
    pub job: AnalysisJob,
    /// False when the image key was already ingested and `job` is the
    /// existing record.
    pub inserted: bool,
}

/// Order of listings by image submission time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub user_id: Option<i64>,
    pub status: Option<JobStatus>,
    pub label: Option<String>,
    pub model_name: Option<String>,
    pub error_kind: Option<String>,
    pub sort: SortOrder,
}

impl JobFilter {
    pub fn for_user(user_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::default()
        }
    }

    pub fn matches(&self, job: &AnalysisJob) -> bool {
        self.user_id.is_none_or(|id| job.user_id == id)
            && self.status.is_none_or(|s| job.status == s)
            && self
                .label
                .as_deref()
                .is_none_or(|l| job.label.as_deref() == Some(l))
            && self
                .model_name
                .as_deref()
                .is_none_or(|m| job.model_name == m)
            && self
                .error_kind
                .as_deref()
                .is_none_or(|k| job.error_kind.as_deref() == Some(k))
    }
}

/// Distinct values available for filtering a listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobFacets {
    pub labels: Vec<String>,
    pub models: Vec<String>,
    pub error_kinds: Vec<String>,
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert the image and its Pending job in one transaction. Image keys
    /// are unique; a key that already exists yields its job unchanged.
    async fn create(&self, new: NewAnalysis) -> Result<CreatedJob, RepoError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<AnalysisJob>, RepoError>;

    /// Write the job if nobody else wrote it since it was read. Bumps
    /// `job.version` on success, returns [`RepoError::Conflict`] otherwise.
    async fn save(&self, job: &mut AnalysisJob) -> Result<(), RepoError>;

    /// Last-resort finalizer for a run whose result could not be saved or a
    /// job that could not be queued: marks the job Failed with an end time and
    /// clears its results, guarded by `expected_version`.
    async fn mark_ended(
        &self,
        job_id: Uuid,
        expected_version: i64,
        failure: &FailureDetail,
        at: DateTime<Utc>,
    ) -> Result<(), RepoError>;

    async fn list(&self, filter: &JobFilter) -> Result<Vec<AnalysisJob>, RepoError>;

    /// Ids of all Pending jobs, oldest submission first.
    async fn pending_order(&self) -> Result<Vec<Uuid>, RepoError>;

    async fn facets(&self, user_id: Option<i64>) -> Result<JobFacets, RepoError>;

    /// Delete an image and, by cascade, its job.
    async fn delete_image(&self, image_id: Uuid) -> Result<Option<ImageRef>, RepoError>;

    async fn health_check(&self) -> Result<(), RepoError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job {0} was modified concurrently")]
    Conflict(Uuid),

    #[error("Corrupt job record {id}: {reason}")]
    Corrupt { id: Uuid, reason: String },
}
