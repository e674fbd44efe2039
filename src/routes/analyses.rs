use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::models::analysis::{
    JobListResponse, JobView, ListQuery, ReanalyzeRequest, SubmitResponse, DEFAULT_UPLOAD_MODEL,
};
use crate::models::job::JobStatus;
use crate::routes::error::{ApiError, ApiResult};
use crate::services::dispatcher::{UploadedImage, ValidationError};

const MAX_MODEL_NAME_LEN: usize = 64;

/// Checkbox-style form value: present and not an explicit "off".
fn truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "off" | "no"
    )
}

/// POST /api/v1/analyses: upload 1-3 images for classification.
pub async fn submit_analyses(
    State(state): State<AppState>,
    user: AuthUser,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let mut images = Vec::new();
    let mut model_name: Option<String> = None;
    let mut use_category = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("images") => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                images.push(UploadedImage {
                    file_name,
                    bytes: bytes.to_vec(),
                });
            }
            Some("model") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                let value = value.trim().to_string();
                if value.len() > MAX_MODEL_NAME_LEN {
                    return Err(ValidationError::InvalidField(format!(
                        "model name is longer than {} characters",
                        MAX_MODEL_NAME_LEN
                    ))
                    .into());
                }
                if !value.is_empty() {
                    model_name = Some(value);
                }
            }
            Some("use_category") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
                use_category = truthy(&value);
            }
            _ => {}
        }
    }

    let model_name = model_name.unwrap_or_else(|| DEFAULT_UPLOAD_MODEL.to_string());
    let receipt = state
        .dispatcher
        .submit(user.user_id, images, &model_name, use_category)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            accepted: receipt.accepted,
            skipped: receipt.skipped,
            status: JobStatus::Pending,
            message: format!("{} image(s) queued for analysis", receipt.accepted),
        }),
    ))
}

/// GET /api/v1/analyses: the caller's jobs, newest first by default.
pub async fn list_analyses(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<JobListResponse>> {
    query.validate()?;

    let filter = query.into_filter(user.user_id);
    let jobs = state.jobs.list(&filter).await?;
    let positions = state.dispatcher.waiting_positions().await?;
    let facets = state.jobs.facets(Some(user.user_id)).await?;

    Ok(Json(JobListResponse {
        analyses: jobs
            .into_iter()
            .map(|job| JobView::new(job, &positions))
            .collect(),
        facets,
    }))
}

/// GET /api/v1/analyses/{id}
pub async fn get_analysis(
    State(state): State<AppState>,
    user: AuthUser,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobView>> {
    let job = state
        .jobs
        .get(job_id)
        .await?
        .filter(|job| user.can_access(job.user_id))
        .ok_or_else(|| ApiError::NotFound(format!("Analysis job {} not found", job_id)))?;

    let positions = state.dispatcher.waiting_positions().await?;
    Ok(Json(JobView::new(job, &positions)))
}

/// POST /api/v1/analyses/{id}/reanalyze: run a finished job again,
/// possibly with another model.
pub async fn reanalyze(
    State(state): State<AppState>,
    user: AuthUser,
    Path(job_id): Path<Uuid>,
    Json(request): Json<ReanalyzeRequest>,
) -> ApiResult<(StatusCode, Json<JobView>)> {
    request.validate()?;

    let owner = state
        .jobs
        .get(job_id)
        .await?
        .map(|job| job.user_id)
        .filter(|owner| user.can_access(*owner));
    if owner.is_none() {
        return Err(ApiError::NotFound(format!("Analysis job {} not found", job_id)));
    }

    let job = state
        .dispatcher
        .resubmit(job_id, &request.model_name, request.use_category)
        .await?;
    let positions = state.dispatcher.waiting_positions().await?;

    Ok((StatusCode::ACCEPTED, Json(JobView::new(job, &positions))))
}
