use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::generation_job::{GenerationJob, GenerationParams, TerminalStatus},
    },
};
use uuid::Uuid;

use crate::{
    generator::{GeneratorHandle, ImageGenerator},
    worker::TerminalStatusStore,
};

pub const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nstub";

pub async fn memory_db() -> SurrealDbClient {
    let database = Uuid::new_v4().to_string();
    let db = SurrealDbClient::memory("test_ns", &database)
        .await
        .expect("in-memory surrealdb");
    db.ensure_initialized().await.expect("schema");
    db
}

pub fn stub_handle(generator: impl ImageGenerator + 'static) -> GeneratorHandle {
    GeneratorHandle::ready(Arc::new(generator))
}

pub struct StubGenerator;

#[async_trait]
impl ImageGenerator for StubGenerator {
    async fn generate(&self, _params: &GenerationParams) -> Result<Bytes, AppError> {
        Ok(Bytes::from_static(PNG_BYTES))
    }
}

pub struct FailingGenerator;

#[async_trait]
impl ImageGenerator for FailingGenerator {
    async fn generate(&self, _params: &GenerationParams) -> Result<Bytes, AppError> {
        Err(AppError::GenerationFailed("CUDA out of memory".into()))
    }
}

pub struct PanickingGenerator;

#[async_trait]
impl ImageGenerator for PanickingGenerator {
    async fn generate(&self, _params: &GenerationParams) -> Result<Bytes, AppError> {
        panic!("generator exploded");
    }
}

pub struct SlowGenerator(pub Duration);

#[async_trait]
impl ImageGenerator for SlowGenerator {
    async fn generate(&self, _params: &GenerationParams) -> Result<Bytes, AppError> {
        tokio::time::sleep(self.0).await;
        Ok(Bytes::from_static(PNG_BYTES))
    }
}

/// Holds every call until released, counting how many are running at once.
pub struct GatedGenerator {
    pub gate: Arc<tokio::sync::Semaphore>,
    pub running: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

impl GatedGenerator {
    pub fn new() -> Self {
        Self {
            gate: Arc::new(tokio::sync::Semaphore::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl ImageGenerator for GatedGenerator {
    async fn generate(&self, _params: &GenerationParams) -> Result<Bytes, AppError> {
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_running, Ordering::SeqCst);

        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|err| AppError::InternalError(err.to_string()))?;
        permit.forget();

        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(Bytes::from_static(PNG_BYTES))
    }
}

/// Initialiser that panics, as a broken model load would.
pub async fn panicking_init() -> Result<Arc<dyn ImageGenerator>, AppError> {
    panic!("model weights are corrupt");
}

pub fn panicking_init_handle() -> GeneratorHandle {
    GeneratorHandle::lazy(|| Box::pin(panicking_init()))
}

/// Store that fails its first `failures` writes before reaching the database.
pub struct FlakyStore {
    pub db: Arc<SurrealDbClient>,
    pub failures: AtomicUsize,
    pub calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new(db: Arc<SurrealDbClient>, failures: usize) -> Self {
        Self {
            db,
            failures: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TerminalStatusStore for FlakyStore {
    async fn record_terminal(
        &self,
        job_id: &str,
        terminal: TerminalStatus,
    ) -> Result<GenerationJob, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(AppError::InternalError("store unavailable".into()));
        }
        GenerationJob::update_status(job_id, terminal, &self.db).await
    }
}

/// Store whose first write panics; later writes go through.
pub struct PanickingOnceStore {
    pub db: Arc<SurrealDbClient>,
    pub panicked: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl TerminalStatusStore for PanickingOnceStore {
    async fn record_terminal(
        &self,
        job_id: &str,
        terminal: TerminalStatus,
    ) -> Result<GenerationJob, AppError> {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("store client poisoned");
        }
        GenerationJob::update_status(job_id, terminal, &self.db).await
    }
}
