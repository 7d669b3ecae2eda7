use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{
        artifact::{write_artifact, ArtifactLocation},
        db::SurrealDbClient,
        store::StorageManager,
        types::generation_job::{GenerationJob, GenerationParams, TerminalStatus},
    },
};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tracing::{error, info, warn};

use crate::generator::GeneratorHandle;

/// Backoff base for terminal writes: roughly 10ms, 100ms, 1s.
const TERMINAL_WRITE_BACKOFF_MS: u64 = 10;
const TERMINAL_WRITE_RETRIES: usize = 3;

/// Everything a worker needs to run one job, fixed at submission.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub job_id: String,
    pub image_name: String,
    pub params: GenerationParams,
    pub location: ArtifactLocation,
}

/// Where workers record how a job ended.
#[async_trait]
pub trait TerminalStatusStore: Send + Sync {
    async fn record_terminal(
        &self,
        job_id: &str,
        terminal: TerminalStatus,
    ) -> Result<GenerationJob, AppError>;
}

#[async_trait]
impl TerminalStatusStore for SurrealDbClient {
    async fn record_terminal(
        &self,
        job_id: &str,
        terminal: TerminalStatus,
    ) -> Result<GenerationJob, AppError> {
        GenerationJob::update_status(job_id, terminal, self).await
    }
}

pub struct GenerationWorker {
    store: Arc<dyn TerminalStatusStore>,
    storage: StorageManager,
    generator: Arc<GeneratorHandle>,
    timeout: Duration,
}

impl GenerationWorker {
    pub fn new(
        store: Arc<dyn TerminalStatusStore>,
        storage: StorageManager,
        generator: Arc<GeneratorHandle>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            storage,
            generator,
            timeout,
        }
    }

    /// Runs one job to its terminal state.
    ///
    /// Generation errors end up on the job record. The returned error only
    /// reports a failed terminal write.
    #[tracing::instrument(
        skip_all,
        fields(job_id = %dispatch.job_id, image_name = %dispatch.image_name)
    )]
    pub async fn run(&self, dispatch: Dispatch) -> Result<GenerationJob, AppError> {
        let started = Instant::now();

        let terminal = match self.produce(&dispatch).await {
            Ok(()) => TerminalStatus::Completed,
            Err(err) => {
                warn!(error = %err, "generation failed");
                if matches!(err, AppError::Storage(_) | AppError::Io(_)) {
                    if let Err(cleanup) = self.storage.delete(dispatch.location.as_str()).await {
                        warn!(error = %cleanup, "failed to remove partial artifact");
                    }
                }
                TerminalStatus::failed(err.to_string())
            }
        };

        let job = self.record(&dispatch.job_id, terminal).await?;

        info!(
            status = job.status.as_str(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "generation job finished"
        );
        Ok(job)
    }

    /// Fails a job whose run ended without reaching a terminal write.
    pub async fn abandon(&self, job_id: &str, reason: &str) -> Result<GenerationJob, AppError> {
        self.record(job_id, TerminalStatus::failed(reason)).await
    }

    /// Writes the terminal status, retrying store errors with backoff.
    /// A conflict or an unknown id is final.
    async fn record(
        &self,
        job_id: &str,
        terminal: TerminalStatus,
    ) -> Result<GenerationJob, AppError> {
        let strategy = ExponentialBackoff::from_millis(TERMINAL_WRITE_BACKOFF_MS)
            .map(jitter)
            .take(TERMINAL_WRITE_RETRIES);

        RetryIf::spawn(
            strategy,
            || self.store.record_terminal(job_id, terminal.clone()),
            |err: &AppError| {
                let retry =
                    !matches!(err, AppError::StoreWriteConflict(_) | AppError::NotFound(_));
                if retry {
                    warn!(error = %err, "terminal write failed, retrying");
                }
                retry
            },
        )
        .await
        .map_err(|err| {
            error!(error = %err, "failed to record terminal status");
            err
        })
    }

    async fn produce(&self, dispatch: &Dispatch) -> Result<(), AppError> {
        let handle = Arc::clone(&self.generator);
        let params = dispatch.params.clone();

        // Initialisation and generation share one task so a panic in either
        // stays inside it
        let mut task = tokio::spawn(async move {
            let generator = handle.get().await?;
            generator.generate(&params).await
        });

        let bytes = match tokio::time::timeout(self.timeout, &mut task).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_err)) if join_err.is_panic() => {
                return Err(AppError::GenerationFailed(
                    "image generator panicked".into(),
                ));
            }
            Ok(Err(join_err)) => return Err(AppError::Join(join_err)),
            Err(_) => {
                task.abort();
                return Err(AppError::GenerationFailed(format!(
                    "generation timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        write_artifact(&self.storage, &dispatch.location, bytes).await
    }
}
