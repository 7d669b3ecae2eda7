use axum::{extract::State, Json};
use generation_pipeline::{GenerationRequest, SubmittedJob};
use tracing::info;

use crate::{api_state::ApiState, error::ApiError};

pub async fn generate_image(
    State(state): State<ApiState>,
    Json(request): Json<GenerationRequest>,
) -> Result<Json<SubmittedJob>, ApiError> {
    info!(
        prompt_chars = request.prompt.chars().count(),
        height = request.height,
        width = request.width,
        num_inference_steps = request.num_inference_steps,
        "Received generation request"
    );

    let submitted = state.coordinator.submit(request).await?;

    Ok(Json(submitted))
}
