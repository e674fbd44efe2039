use std::collections::HashMap;

use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::repository::{JobFacets, JobFilter, SortOrder};
use crate::models::job::{AnalysisJob, JobStatus};

/// Model used when a submission names none.
pub const DEFAULT_UPLOAD_MODEL: &str = "mobilenet_v2";

/// Body of `POST /api/v1/analyses/{id}/reanalyze`.
#[derive(Debug, Deserialize, Validate)]
pub struct ReanalyzeRequest {
    #[garde(length(min = 1, max = 64))]
    pub model_name: String,

    #[garde(skip)]
    #[serde(default)]
    pub use_category: bool,
}

/// Query of `GET /api/v1/analyses`.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct ListQuery {
    #[garde(skip)]
    pub status: Option<JobStatus>,

    #[garde(length(min = 1, max = 200))]
    pub label: Option<String>,

    #[garde(skip)]
    #[serde(default)]
    pub sort: SortOrder,
}

impl ListQuery {
    pub fn into_filter(self, user_id: i64) -> JobFilter {
        JobFilter {
            status: self.status,
            label: self.label,
            sort: self.sort,
            ..JobFilter::for_user(user_id)
        }
    }
}

/// Query of `GET /api/v1/admin/analyses`.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct AdminListQuery {
    #[garde(skip)]
    pub user_id: Option<i64>,

    #[garde(skip)]
    pub status: Option<JobStatus>,

    #[garde(length(min = 1, max = 64))]
    pub error_kind: Option<String>,

    #[garde(length(min = 1, max = 64))]
    pub model: Option<String>,

    #[garde(skip)]
    #[serde(default)]
    pub sort: SortOrder,
}

impl From<AdminListQuery> for JobFilter {
    fn from(query: AdminListQuery) -> Self {
        JobFilter {
            user_id: query.user_id,
            status: query.status,
            label: None,
            model_name: query.model,
            error_kind: query.error_kind,
            sort: query.sort,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub accepted: usize,
    pub skipped: usize,
    pub status: JobStatus,
    pub message: String,
}

/// A job as returned by the API, with its live queue position.
#[derive(Debug, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: AnalysisJob,
    pub waiting_position: Option<usize>,
}

impl JobView {
    pub fn new(job: AnalysisJob, positions: &HashMap<Uuid, usize>) -> Self {
        let waiting_position = match job.status {
            JobStatus::Pending => positions.get(&job.id).copied(),
            _ => None,
        };
        Self {
            job,
            waiting_position,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobListResponse {
    pub analyses: Vec<JobView>,
    pub facets: JobFacets,
}
