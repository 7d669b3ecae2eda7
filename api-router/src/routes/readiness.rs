use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::api_state::ApiState;

/// Readiness probe: 200 when the store answers and workers are taking jobs, else 503.
pub async fn ready(State(state): State<ApiState>) -> impl IntoResponse {
    let workers_ok = state.coordinator.accepting_jobs();

    match state.db.client.query("RETURN true").await {
        Ok(_) if workers_ok => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "checks": { "db": "ok", "workers": "ok" }
            })),
        ),
        Ok(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "error",
                "checks": { "db": "ok", "workers": "fail" },
                "reason": "generation workers have stopped"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "error",
                "checks": { "db": "fail", "workers": if workers_ok { "ok" } else { "fail" } },
                "reason": e.to_string()
            })),
        ),
    }
}
