use std::{sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use common::{error::AppError, storage::types::generation_job::GenerationParams};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Deterministic sampling settings used for every request.
const GUIDANCE_SCALE: f32 = 0.0;
const SEED: u64 = 42;
const WARMUP_TIMEOUT: Duration = Duration::from_secs(30);

/// The external compute routine: turns parameters into encoded PNG bytes.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, params: &GenerationParams) -> Result<Bytes, AppError>;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    height: u32,
    width: u32,
    num_inference_steps: u32,
    guidance_scale: f32,
    seed: u64,
}

/// Generator backed by an inference server reachable over HTTP.
pub struct RemoteImageGenerator {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteImageGenerator {
    /// Builds the client and probes the server once, so a dead endpoint fails
    /// the first job instead of every job after a long wait.
    pub async fn connect(base_url: &str) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .build()
            .context("building inference http client")?;
        let base_url = base_url.trim_end_matches('/').to_string();

        let health_url = format!("{base_url}/health");
        client
            .get(&health_url)
            .timeout(WARMUP_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;

        info!(%base_url, "inference server reachable");
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl ImageGenerator for RemoteImageGenerator {
    async fn generate(&self, params: &GenerationParams) -> Result<Bytes, AppError> {
        let request = GenerateRequest {
            prompt: &params.prompt,
            height: params.height,
            width: params.width,
            num_inference_steps: params.num_inference_steps,
            guidance_scale: GUIDANCE_SCALE,
            seed: SEED,
        };

        let response = self
            .client
            .post(format!("{}/generate", self.base_url))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::GenerationFailed(format!(
                "inference server returned {status}: {body}"
            )));
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(AppError::GenerationFailed(
                "inference server returned an empty image".into(),
            ));
        }

        debug!(size = bytes.len(), "received generated image");
        Ok(bytes)
    }
}

type GeneratorInit =
    Box<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn ImageGenerator>, AppError>> + Send + Sync>;

/// Shared handle to the one generator instance.
///
/// The generator is built on first use. Concurrent first callers wait on the
/// same initialisation; a failed initialisation leaves the handle empty so the
/// next caller tries again.
pub struct GeneratorHandle {
    cell: OnceCell<Arc<dyn ImageGenerator>>,
    init: GeneratorInit,
}

impl GeneratorHandle {
    pub fn lazy<F>(init: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<Arc<dyn ImageGenerator>, AppError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            cell: OnceCell::new(),
            init: Box::new(init),
        }
    }

    pub fn remote(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self::lazy(move || {
            let base_url = base_url.clone();
            Box::pin(async move {
                let generator = RemoteImageGenerator::connect(&base_url).await?;
                Ok(Arc::new(generator) as Arc<dyn ImageGenerator>)
            })
        })
    }

    /// Handle around an already built generator.
    pub fn ready(generator: Arc<dyn ImageGenerator>) -> Self {
        Self {
            cell: OnceCell::new_with(Some(generator)),
            init: Box::new(|| {
                Box::pin(async {
                    Err(AppError::InternalError(
                        "ready generator handle was re-initialised".into(),
                    ))
                })
            }),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }

    pub async fn get(&self) -> Result<Arc<dyn ImageGenerator>, AppError> {
        self.cell
            .get_or_try_init(|| async {
                info!("initialising image generator");
                (self.init)().await.map_err(|err| {
                    warn!(error = %err, "image generator initialisation failed");
                    err
                })
            })
            .await
            .map(Arc::clone)
    }
}
