use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{
    error::AppError,
    storage::{
        artifact::{locate, open_artifact, ArtifactLocation, ArtifactStream},
        db::SurrealDbClient,
        store::StorageManager,
        types::generation_job::{
            GenerationJob, GenerationParams, JobStatus, DEFAULT_HEIGHT, DEFAULT_INFERENCE_STEPS,
            DEFAULT_WIDTH,
        },
    },
    utils::config::AppConfig,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{queue::GenerationQueue, worker::Dispatch};

const IMAGE_NAME_PREFIX: &str = "ImgGen";
/// Upper bound on name candidates tried for one submission.
const MAX_NAME_ATTEMPTS: u32 = 64;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Submission as received from a client; missing fields take the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub height: Option<u32>,
    pub width: Option<u32>,
    pub num_inference_steps: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
pub struct GenerationLimits {
    pub max_dimension: u32,
    pub max_inference_steps: u32,
}

impl From<&AppConfig> for GenerationLimits {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_dimension: config.max_image_dimension,
            max_inference_steps: config.max_inference_steps,
        }
    }
}

impl Default for GenerationLimits {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl GenerationLimits {
    pub fn validate(&self, request: GenerationRequest) -> Result<GenerationParams, AppError> {
        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Err(AppError::Validation("prompt must not be empty".into()));
        }

        let height = request.height.unwrap_or(DEFAULT_HEIGHT);
        let width = request.width.unwrap_or(DEFAULT_WIDTH);
        for (field, value) in [("height", height), ("width", width)] {
            if value == 0 || value > self.max_dimension {
                return Err(AppError::Validation(format!(
                    "{field} must be between 1 and {}, got {value}",
                    self.max_dimension
                )));
            }
        }

        let num_inference_steps = request
            .num_inference_steps
            .unwrap_or(DEFAULT_INFERENCE_STEPS);
        if num_inference_steps == 0 || num_inference_steps > self.max_inference_steps {
            return Err(AppError::Validation(format!(
                "num_inference_steps must be between 1 and {}, got {num_inference_steps}",
                self.max_inference_steps
            )));
        }

        Ok(GenerationParams {
            prompt: prompt.to_string(),
            height,
            width,
            num_inference_steps,
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SubmittedJob {
    pub job_id: String,
    pub image_name: String,
    pub status: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactKey {
    JobId(String),
    ImageName(String),
}

pub struct Artifact {
    pub job_id: String,
    pub image_name: String,
    pub location: ArtifactLocation,
    pub stream: ArtifactStream,
}

/// `ImgGen_YYYYMMDD_HHMMSS` in UTC, with `_N` appended from the second attempt on.
///
/// The date matches the artifact's day bucket, so suffixes only compete with
/// submissions from the same second.
pub fn image_name_for(now: DateTime<Utc>, attempt: u32) -> String {
    let base = format!("{IMAGE_NAME_PREFIX}_{}", now.format("%Y%m%d_%H%M%S"));
    if attempt <= 1 {
        base
    } else {
        format!("{base}_{attempt}")
    }
}

/// Admits jobs, hands them to the worker pool and answers status and
/// artifact queries straight from the store.
pub struct JobCoordinator {
    db: Arc<SurrealDbClient>,
    storage: StorageManager,
    queue: GenerationQueue,
    limits: GenerationLimits,
    clock: Arc<dyn Clock>,
}

impl JobCoordinator {
    pub fn new(
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        queue: GenerationQueue,
        limits: GenerationLimits,
    ) -> Self {
        Self {
            db,
            storage,
            queue,
            limits,
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Records a new job and queues it. Returns as soon as the record exists;
    /// generation outcomes only show up through `get_status`.
    pub async fn submit(&self, request: GenerationRequest) -> Result<SubmittedJob, AppError> {
        let params = self.limits.validate(request)?;

        // Reserve first so a full queue never leaves a job nobody will run
        let slot = self.queue.reserve()?;

        let job = self.create_with_unique_name(params).await?;
        let location = locate(&job.image_name, job.created_at);

        slot.dispatch(Dispatch {
            job_id: job.id.clone(),
            image_name: job.image_name.clone(),
            params: job.params(),
            location,
        });

        info!(
            job_id = %job.id,
            image_name = %job.image_name,
            pending = self.pending_jobs(),
            "generation job submitted"
        );

        Ok(SubmittedJob {
            job_id: job.id,
            image_name: job.image_name,
            status: job.status,
        })
    }

    async fn create_with_unique_name(
        &self,
        params: GenerationParams,
    ) -> Result<GenerationJob, AppError> {
        let now = self.clock.now();
        let mut suffix = 1;

        for _ in 0..MAX_NAME_ATTEMPTS {
            let image_name = image_name_for(now, suffix);
            match GenerationJob::create_and_add_to_db(params.clone(), image_name, &self.db).await
            {
                Ok(job) => return Ok(job),
                Err(AppError::DuplicateImageName(name)) => {
                    debug!(%name, "image name taken, trying next suffix");
                    suffix += 1;
                }
                Err(AppError::StoreWriteConflict(reason)) => {
                    debug!(%reason, "concurrent create collided, retrying");
                }
                Err(err) => return Err(err),
            }
        }

        Err(AppError::DuplicateImageName(format!(
            "no free name for {} after {MAX_NAME_ATTEMPTS} attempts",
            image_name_for(now, 1)
        )))
    }

    /// False once the worker pool has shut down.
    pub fn accepting_jobs(&self) -> bool {
        !self.queue.is_closed()
    }

    pub fn pending_jobs(&self) -> usize {
        self.queue.pending()
    }

    pub async fn get_status(&self, job_id: &str) -> Result<GenerationJob, AppError> {
        GenerationJob::get_by_id(job_id, &self.db).await
    }

    pub async fn list_recent(&self, limit: usize) -> Result<Vec<GenerationJob>, AppError> {
        GenerationJob::list_recent(limit, &self.db).await
    }

    /// Opens a finished job's image. Jobs that are not `completed` are
    /// `NotReady` and storage is never touched for them.
    pub async fn get_artifact(&self, key: ArtifactKey) -> Result<Artifact, AppError> {
        let job = match &key {
            ArtifactKey::JobId(job_id) => GenerationJob::get_by_id(job_id, &self.db).await?,
            ArtifactKey::ImageName(name) => {
                GenerationJob::get_by_image_name(name, &self.db).await?
            }
        };

        if job.status != JobStatus::Completed {
            return Err(AppError::NotReady(format!(
                "job {} is {}",
                job.id,
                job.status.as_str()
            )));
        }

        let location = locate(&job.image_name, job.created_at);
        let stream = open_artifact(&self.storage, &location).await?;

        Ok(Artifact {
            job_id: job.id,
            image_name: job.image_name,
            location,
            stream,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        generator::GeneratorHandle,
        queue::spawn_worker_pool,
        test_support::{
            memory_db, stub_handle, FailingGenerator, GatedGenerator, StubGenerator, PNG_BYTES,
        },
        worker::GenerationWorker,
    };
    use bytes::Bytes;
    use chrono::TimeZone;
    use common::storage::{
        store::testing::TestStorageManager, types::generation_job::TerminalStatus,
    };
    use futures::TryStreamExt;
    use std::{collections::HashSet, time::Duration};

    struct FixedClock(DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn fixed_clock() -> Arc<dyn Clock> {
        Arc::new(FixedClock(
            Utc.with_ymd_and_hms(2024, 5, 17, 14, 30, 5).unwrap(),
        ))
    }

    struct Harness {
        db: Arc<SurrealDbClient>,
        storage: TestStorageManager,
        coordinator: Arc<JobCoordinator>,
    }

    async fn harness(handle: GeneratorHandle, capacity: usize) -> Harness {
        let db = Arc::new(memory_db().await);
        let storage = TestStorageManager::new_local().await.expect("storage");
        let worker = Arc::new(GenerationWorker::new(
            Arc::<SurrealDbClient>::clone(&db),
            storage.clone_storage(),
            Arc::new(handle),
            Duration::from_secs(5),
        ));
        let (queue, _handles) = spawn_worker_pool(worker, capacity, 1);
        let coordinator = Arc::new(JobCoordinator::new(
            Arc::clone(&db),
            storage.clone_storage(),
            queue,
            GenerationLimits::default(),
        ));

        Harness {
            db,
            storage,
            coordinator,
        }
    }

    /// Coordinator without workers: submitted jobs stay `generating`.
    struct Idle {
        db: Arc<SurrealDbClient>,
        storage: TestStorageManager,
        coordinator: JobCoordinator,
        _receiver: tokio::sync::mpsc::Receiver<Dispatch>,
    }

    async fn idle(capacity: usize) -> Idle {
        let db = Arc::new(memory_db().await);
        let storage = TestStorageManager::new_memory().await.expect("storage");
        let (queue, receiver) = GenerationQueue::new(capacity);
        let coordinator = JobCoordinator::new(
            Arc::clone(&db),
            storage.clone_storage(),
            queue,
            GenerationLimits::default(),
        );

        Idle {
            db,
            storage,
            coordinator,
            _receiver: receiver,
        }
    }

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    async fn wait_for_terminal(coordinator: &JobCoordinator, job_id: &str) -> GenerationJob {
        for _ in 0..300 {
            let job = coordinator.get_status(job_id).await.expect("status");
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never finished");
    }

    async fn read_all(artifact: Artifact) -> Vec<u8> {
        let chunks: Vec<Bytes> = artifact.stream.try_collect().await.expect("read artifact");
        chunks.concat()
    }

    #[test]
    fn test_image_name_format() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(image_name_for(now, 1), "ImgGen_20240102_030405");
        assert_eq!(image_name_for(now, 3), "ImgGen_20240102_030405_3");
    }

    #[test]
    fn test_validation_applies_defaults_and_limits() {
        let limits = GenerationLimits {
            max_dimension: 2048,
            max_inference_steps: 50,
        };

        let params = limits.validate(request("  a castle  ")).expect("valid");
        assert_eq!(params.prompt, "a castle");
        assert_eq!(params.height, DEFAULT_HEIGHT);
        assert_eq!(params.width, DEFAULT_WIDTH);
        assert_eq!(params.num_inference_steps, DEFAULT_INFERENCE_STEPS);

        assert!(matches!(
            limits.validate(request("   ")),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            limits.validate(GenerationRequest {
                width: Some(4096),
                ..request("wide")
            }),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            limits.validate(GenerationRequest {
                height: Some(0),
                ..request("flat")
            }),
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            limits.validate(GenerationRequest {
                num_inference_steps: Some(51),
                ..request("slow")
            }),
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_returns_generating_job_immediately() {
        let Idle {
            db,
            coordinator,
            _receiver,
            ..
        } = idle(4).await;
        let coordinator = coordinator.with_clock(fixed_clock());

        let submitted = coordinator.submit(request("a harbour")).await.expect("submit");
        assert_eq!(submitted.status, JobStatus::Generating);
        assert_eq!(submitted.image_name, "ImgGen_20240517_143005");

        let job = coordinator.get_status(&submitted.job_id).await.expect("status");
        assert_eq!(job.status, JobStatus::Generating);
        assert_eq!(job.prompt, "a harbour");

        let stored = GenerationJob::get_by_image_name("ImgGen_20240517_143005", &db)
            .await
            .expect("by name");
        assert_eq!(stored.id, submitted.job_id);
    }

    #[tokio::test]
    async fn test_invalid_request_creates_nothing() {
        let idle = idle(4).await;

        let result = idle.coordinator.submit(request("")).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
        assert!(GenerationJob::list_recent(10, &idle.db)
            .await
            .expect("list")
            .is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_rejects_before_creating_a_record() {
        let idle = idle(1).await;

        idle.coordinator
            .submit(request("first"))
            .await
            .expect("first");
        let second = idle.coordinator.submit(request("second")).await;
        assert!(matches!(second, Err(AppError::QueueFull(_))));

        let jobs = GenerationJob::list_recent(10, &idle.db).await.expect("list");
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_submits_get_distinct_ids_and_names() {
        let Idle {
            coordinator,
            _receiver,
            ..
        } = idle(32).await;
        let coordinator = Arc::new(coordinator.with_clock(fixed_clock()));

        let mut tasks = Vec::new();
        for i in 0..10 {
            let coordinator = Arc::clone(&coordinator);
            tasks.push(tokio::spawn(async move {
                coordinator.submit(request(&format!("prompt {i}"))).await
            }));
        }

        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for task in tasks {
            let submitted = task.await.expect("join").expect("submit");
            assert!(submitted.image_name.starts_with("ImgGen_20240517_143005"));
            ids.insert(submitted.job_id);
            names.insert(submitted.image_name);
        }
        assert_eq!(ids.len(), 10);
        assert_eq!(names.len(), 10);
    }

    #[tokio::test]
    async fn test_same_time_on_later_days_needs_no_suffix() {
        let Idle {
            db,
            storage,
            _receiver,
            ..
        } = idle(4).await;
        let first_day = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();

        for day in 0..(i64::from(MAX_NAME_ATTEMPTS) + 6) {
            let (queue, receiver) = GenerationQueue::new(1);
            let now = first_day + chrono::Duration::days(day);
            let coordinator = JobCoordinator::new(
                Arc::clone(&db),
                storage.clone_storage(),
                queue,
                GenerationLimits::default(),
            )
            .with_clock(Arc::new(FixedClock(now)));

            let submitted = coordinator
                .submit(request("the daily sunrise"))
                .await
                .expect("daily submit admitted");
            assert_eq!(
                submitted.image_name,
                format!("ImgGen_{}_090000", now.format("%Y%m%d"))
            );
            drop(receiver);
        }

        let jobs = GenerationJob::list_recent(100, &db).await.expect("list");
        assert_eq!(jobs.len(), MAX_NAME_ATTEMPTS as usize + 6);
    }

    #[tokio::test]
    async fn test_get_status_unknown_is_not_found() {
        let Idle { coordinator, .. } = idle(1).await;
        assert!(matches!(
            coordinator.get_status("nope").await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            coordinator
                .get_artifact(ArtifactKey::ImageName("ImgGen_000000".into()))
                .await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_artifact_of_generating_job_is_not_ready_without_storage_read() {
        let Idle {
            coordinator,
            storage,
            _receiver,
            ..
        } = idle(4).await;
        let coordinator = coordinator.with_clock(fixed_clock());
        let submitted = coordinator.submit(request("a meadow")).await.expect("submit");

        // Plant a file where the artifact would live; it must not be served
        let job = coordinator.get_status(&submitted.job_id).await.expect("status");
        let location = locate(&job.image_name, job.created_at);
        storage
            .storage()
            .put(location.as_str(), Bytes::from_static(PNG_BYTES))
            .await
            .expect("plant");

        let result = coordinator
            .get_artifact(ArtifactKey::JobId(submitted.job_id))
            .await;
        assert!(matches!(result, Err(AppError::NotReady(_))));
    }

    #[tokio::test]
    async fn test_completed_job_with_missing_file_is_artifact_not_found() {
        let Idle {
            db,
            coordinator,
            _receiver,
            ..
        } = idle(4).await;
        let submitted = coordinator.submit(request("a desert")).await.expect("submit");
        GenerationJob::update_status(&submitted.job_id, TerminalStatus::Completed, &db)
            .await
            .expect("complete");

        let result = coordinator
            .get_artifact(ArtifactKey::JobId(submitted.job_id))
            .await;
        assert!(matches!(result, Err(AppError::ArtifactNotFound(_))));
    }

    #[tokio::test]
    async fn test_end_to_end_success() {
        let h = harness(stub_handle(StubGenerator), 8).await;

        let submitted = h
            .coordinator
            .submit(GenerationRequest {
                prompt: "cat".into(),
                height: Some(512),
                width: Some(512),
                num_inference_steps: Some(4),
            })
            .await
            .expect("submit");
        let job = wait_for_terminal(&h.coordinator, &submitted.job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!((job.height, job.width, job.num_inference_steps), (512, 512, 4));
        assert!(job.completed_at.is_some());
        assert!(job.error_message.is_none());

        let by_id = h
            .coordinator
            .get_artifact(ArtifactKey::JobId(submitted.job_id.clone()))
            .await
            .expect("artifact by id");
        assert_eq!(by_id.location.content_type(), "image/png");
        assert_eq!(read_all(by_id).await, PNG_BYTES);

        let by_name = h
            .coordinator
            .get_artifact(ArtifactKey::ImageName(submitted.image_name.clone()))
            .await
            .expect("artifact by name");
        assert_eq!(by_name.job_id, submitted.job_id);
        assert_eq!(read_all(by_name).await, PNG_BYTES);

        // Deleting the file afterwards surfaces as a missing artifact
        let location = locate(&job.image_name, job.created_at);
        h.storage
            .storage()
            .delete(location.as_str())
            .await
            .expect("delete");
        assert!(matches!(
            h.coordinator
                .get_artifact(ArtifactKey::JobId(submitted.job_id))
                .await,
            Err(AppError::ArtifactNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_end_to_end_failure_stays_not_ready() {
        let h = harness(stub_handle(FailingGenerator), 8).await;

        let submitted = h
            .coordinator
            .submit(request("a storm"))
            .await
            .expect("submit");
        let job = wait_for_terminal(&h.coordinator, &submitted.job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job
            .error_message
            .as_deref()
            .is_some_and(|msg| !msg.is_empty()));

        for _ in 0..3 {
            assert!(matches!(
                h.coordinator
                    .get_artifact(ArtifactKey::JobId(submitted.job_id.clone()))
                    .await,
                Err(AppError::NotReady(_))
            ));
        }
        let later = h
            .coordinator
            .get_status(&submitted.job_id)
            .await
            .expect("status");
        assert_eq!(later.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_status_polls_do_not_wait_on_busy_worker() {
        let generator = GatedGenerator::new();
        let gate = Arc::clone(&generator.gate);
        let h = harness(GeneratorHandle::ready(Arc::new(generator)), 8).await;

        let submitted = h
            .coordinator
            .submit(request("a clock tower"))
            .await
            .expect("submit");

        let status = tokio::time::timeout(
            Duration::from_secs(1),
            h.coordinator.get_status(&submitted.job_id),
        )
        .await
        .expect("status answered while generator blocked")
        .expect("status");
        assert_eq!(status.status, JobStatus::Generating);

        gate.add_permits(1);
        let job = wait_for_terminal(&h.coordinator, &submitted.job_id).await;
        assert_eq!(job.status, JobStatus::Completed);

        let recent = h.coordinator.list_recent(5).await.expect("list");
        assert_eq!(recent.len(), 1);
        assert!(GenerationJob::get_by_id(&submitted.job_id, &h.db).await.is_ok());
    }
}
