pub mod admin;
pub mod analyses;
pub mod error;
pub mod health;
pub mod metrics;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use crate::config::MAX_IMAGES_PER_REQUEST;
use self::metrics::MetricsState;

/// Largest single image accepted in a submission.
pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;

/// Full HTTP surface of the API server.
pub fn router(state: AppState, metrics_state: MetricsState) -> Router {
    let api = Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/api/v1/analyses",
            post(analyses::submit_analyses).get(analyses::list_analyses),
        )
        .route("/api/v1/analyses/{id}", get(analyses::get_analysis))
        .route("/api/v1/analyses/{id}/reanalyze", post(analyses::reanalyze))
        .route("/api/v1/admin/analyses", get(admin::list_all_analyses))
        .route("/api/v1/admin/images/{image_id}", delete(admin::delete_image))
        .with_state(state);

    let scrape = Router::new()
        .route("/metrics", get(self::metrics::prometheus_metrics))
        .with_state(metrics_state);

    api.merge(scrape)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(
            MAX_IMAGES_PER_REQUEST * MAX_IMAGE_BYTES + 64 * 1024,
        ))
}
