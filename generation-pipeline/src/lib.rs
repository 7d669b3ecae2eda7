#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod coordinator;
pub mod generator;
pub mod queue;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use coordinator::{
    Artifact, ArtifactKey, GenerationLimits, GenerationRequest, JobCoordinator, SubmittedJob,
};
pub use generator::{GeneratorHandle, ImageGenerator, RemoteImageGenerator};
pub use queue::{spawn_worker_pool, GenerationQueue};
pub use worker::{Dispatch, GenerationWorker, TerminalStatusStore};
