use axum::{
    extract::{DefaultBodyLimit, FromRef},
    routing::{get, post},
    Router,
};
use routes::{
    generation::generate_image,
    health::health,
    images::{image_by_job_id, image_by_name},
    jobs::{get_status, list_jobs},
    liveness::live,
    readiness::ready,
};

pub mod api_state;
pub mod error;
mod routes;

pub use api_state::ApiState;

/// Generation requests are a prompt and a few integers.
const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Router for the image generation API
pub fn api_routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    ApiState: FromRef<S>,
{
    // Probes for k8s/systemd
    let probes = Router::new()
        .route("/ready", get(ready))
        .route("/live", get(live))
        .route("/health", get(health));

    let jobs = Router::new()
        .route(
            "/generate-image",
            post(generate_image).layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES)),
        )
        .route("/status/{job_id}", get(get_status))
        .route("/jobs", get(list_jobs))
        .route("/image/{job_id}", get(image_by_job_id))
        .route("/image/by-name/{image_name}", get(image_by_name));

    probes.merge(jobs)
}
