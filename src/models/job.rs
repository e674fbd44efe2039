use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use super::prediction::{finite_or_zero, AnalysisOutcome, Prediction};

/// Status of an analysis job in the async pipeline.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Stored source image a job analyses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub image_id: Uuid,
    pub key: String,
}

/// Why a run failed, as written into the job record.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureDetail {
    pub kind: String,
    pub detail: String,
}

/// One image's classification request and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: Uuid,
    pub image: ImageRef,
    pub user_id: i64,
    pub uploaded_at: DateTime<Utc>,
    pub model_name: String,
    pub use_category: bool,
    pub status: JobStatus,
    pub label: Option<String>,
    pub top_predictions: Option<Vec<Prediction>>,
    pub reliability: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_kind: Option<String>,
    pub error_detail: Option<String>,
    /// Identifies the current queued run. Analyze messages carry it, and a
    /// message from an earlier run is ignored.
    pub run_id: Uuid,
    /// Write counter for optimistic concurrency; bumped by every save.
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("cannot {action} job in status {from}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub action: &'static str,
}

impl AnalysisJob {
    /// A freshly ingested job, waiting for a worker.
    pub fn new(
        id: Uuid,
        image: ImageRef,
        user_id: i64,
        uploaded_at: DateTime<Utc>,
        model_name: impl Into<String>,
        use_category: bool,
    ) -> Self {
        Self {
            id,
            image,
            user_id,
            uploaded_at,
            model_name: model_name.into(),
            use_category,
            status: JobStatus::Pending,
            label: None,
            top_predictions: None,
            reliability: None,
            started_at: None,
            ended_at: None,
            error_kind: None,
            error_detail: None,
            run_id: Uuid::new_v4(),
            version: 0,
        }
    }

    /// Pending -> Running with the model configuration recorded on the job.
    /// Re-entry from Running is allowed so a duplicate delivery simply redoes
    /// the same run.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError {
                from: self.status,
                action: "start",
            });
        }

        self.status = JobStatus::Running;
        self.started_at = Some(now);
        self.ended_at = None;
        self.label = None;
        self.reliability = None;
        self.error_kind = None;
        self.error_detail = None;
        Ok(())
    }

    /// Running -> Succeeded | Failed. The end time is stamped on both branches.
    pub fn complete(
        &mut self,
        outcome: Result<AnalysisOutcome, FailureDetail>,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        if self.status != JobStatus::Running {
            return Err(TransitionError {
                from: self.status,
                action: "complete",
            });
        }

        match outcome {
            Ok(outcome) => {
                self.status = JobStatus::Succeeded;
                self.label = Some(outcome.label);
                self.reliability = Some(finite_or_zero(outcome.best_score) * 100.0);
                self.top_predictions = Some(outcome.top_predictions);
                self.error_kind = None;
                self.error_detail = None;
            }
            Err(failure) => {
                self.status = JobStatus::Failed;
                self.error_kind = Some(failure.kind);
                self.error_detail = Some(failure.detail);
            }
        }

        self.ended_at = Some(now);
        Ok(())
    }

    /// Succeeded | Failed -> Pending with a (possibly new) model configuration
    /// and a fresh run id. The image and the last prediction list are kept.
    pub fn resubmit(
        &mut self,
        model_name: impl Into<String>,
        use_category: bool,
    ) -> Result<(), TransitionError> {
        if !self.status.is_terminal() {
            return Err(TransitionError {
                from: self.status,
                action: "resubmit",
            });
        }

        self.model_name = model_name.into();
        self.use_category = use_category;
        self.run_id = Uuid::new_v4();
        self.status = JobStatus::Pending;
        self.label = None;
        self.reliability = None;
        self.started_at = None;
        self.ended_at = None;
        self.error_kind = None;
        self.error_detail = None;
        Ok(())
    }

    /// First violated record invariant, if any.
    pub fn invariant_violation(&self) -> Option<&'static str> {
        match self.status {
            JobStatus::Pending => {
                if self.started_at.is_some()
                    || self.ended_at.is_some()
                    || self.label.is_some()
                    || self.reliability.is_some()
                {
                    return Some("pending job carries run results");
                }
            }
            JobStatus::Running => {
                if self.started_at.is_none() {
                    return Some("running job has no start time");
                }
            }
            JobStatus::Succeeded => {
                if self.label.is_none()
                    || self.reliability.is_none()
                    || self.top_predictions.is_none()
                    || self.started_at.is_none()
                    || self.ended_at.is_none()
                {
                    return Some("succeeded job is missing results");
                }
                if self.error_kind.is_some() || self.error_detail.is_some() {
                    return Some("succeeded job carries error fields");
                }
            }
            JobStatus::Failed => {
                if self.error_kind.is_none() || self.error_detail.is_none() || self.ended_at.is_none()
                {
                    return Some("failed job is missing diagnostics");
                }
            }
        }
        None
    }
}
