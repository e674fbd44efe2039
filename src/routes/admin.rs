use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::db::repository::JobFilter;
use crate::models::analysis::{AdminListQuery, JobListResponse, JobView};
use crate::routes::error::{ApiError, ApiResult};

/// GET /api/v1/admin/analyses: every user's jobs, filterable by owner,
/// status, error kind and model.
pub async fn list_all_analyses(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<AdminListQuery>,
) -> ApiResult<Json<JobListResponse>> {
    user.require_staff()?;
    query.validate()?;

    let user_filter = query.user_id;
    let filter = JobFilter::from(query);
    let jobs = state.jobs.list(&filter).await?;
    let positions = state.dispatcher.waiting_positions().await?;
    let facets = state.jobs.facets(user_filter).await?;

    Ok(Json(JobListResponse {
        analyses: jobs
            .into_iter()
            .map(|job| JobView::new(job, &positions))
            .collect(),
        facets,
    }))
}

/// DELETE /api/v1/admin/images/{image_id}: remove an image and its job.
pub async fn delete_image(
    State(state): State<AppState>,
    user: AuthUser,
    Path(image_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    user.require_staff()?;

    if state.dispatcher.delete_image(image_id).await? {
        tracing::info!(image_id = %image_id, staff_id = user.user_id, "Image deleted by staff");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Image {} not found", image_id)))
    }
}
