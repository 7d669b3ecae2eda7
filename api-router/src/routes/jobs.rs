use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use common::storage::types::generation_job::{GenerationJob, JobStatus};
use serde::{Deserialize, Serialize};

use crate::{api_state::ApiState, error::ApiError};

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 200;

/// Job as exposed to clients; `id` is published as `job_id`.
#[derive(Debug, Serialize)]
pub struct JobView {
    pub job_id: String,
    pub image_name: String,
    pub status: JobStatus,
    pub prompt: String,
    pub height: u32,
    pub width: u32,
    pub num_inference_steps: u32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl From<GenerationJob> for JobView {
    fn from(job: GenerationJob) -> Self {
        Self {
            job_id: job.id,
            image_name: job.image_name,
            status: job.status,
            prompt: job.prompt,
            height: job.height,
            width: job.width,
            num_inference_steps: job.num_inference_steps,
            created_at: job.created_at,
            completed_at: job.completed_at,
            error_message: job.error_message,
        }
    }
}

pub async fn get_status(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let job = state.coordinator.get_status(&job_id).await?;
    Ok(Json(job.into()))
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

pub async fn list_jobs(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<JobView>>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let jobs = state.coordinator.list_recent(limit).await?;

    Ok(Json(jobs.into_iter().map(JobView::from).collect()))
}
