use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use generation_pipeline::{Artifact, ArtifactKey};

use crate::{api_state::ApiState, error::ApiError};

pub async fn image_by_job_id(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let artifact = state
        .coordinator
        .get_artifact(ArtifactKey::JobId(job_id))
        .await?;
    Ok(artifact_response(artifact))
}

pub async fn image_by_name(
    State(state): State<ApiState>,
    Path(image_name): Path<String>,
) -> Result<Response, ApiError> {
    let artifact = state
        .coordinator
        .get_artifact(ArtifactKey::ImageName(image_name))
        .await?;
    Ok(artifact_response(artifact))
}

fn artifact_response(artifact: Artifact) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(artifact.location.content_type()),
    );
    if let Ok(disposition) = HeaderValue::from_str(&format!(
        "inline; filename=\"{}\"",
        artifact.location.file_name()
    )) {
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    }
    // A completed artifact never changes
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=31536000, immutable"),
    );

    (StatusCode::OK, headers, Body::from_stream(artifact.stream)).into_response()
}
