use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] object_store::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Not ready: {0}")]
    NotReady(String),
    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),
    #[error("Generation failed: {0}")]
    GenerationFailed(String),
    #[error("Conflicting status write: {0}")]
    StoreWriteConflict(String),
    #[error("Image name already taken: {0}")]
    DuplicateImageName(String),
    #[error("Generation queue is full: {0}")]
    QueueFull(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

