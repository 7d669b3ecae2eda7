use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::api_state::ApiState;

/// Service health as reported to clients polling before they submit.
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "workers": state.config.generation_concurrency,
            "pending_jobs": state.coordinator.pending_jobs(),
        })),
    )
}
