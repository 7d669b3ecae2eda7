use state_machines::state_machine;
use surrealdb::sql::Datetime as SurrealDatetime;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

pub const DEFAULT_HEIGHT: u32 = 1024;
pub const DEFAULT_WIDTH: u32 = 1024;
pub const DEFAULT_INFERENCE_STEPS: u32 = 9;
pub const INTERRUPTED_MESSAGE: &str = "generation was interrupted before it finished";

#[derive(Debug, Default, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Generating,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Generating => "generating",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// The only writes a job accepts after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalStatus {
    Completed,
    Failed { error_message: String },
}

impl TerminalStatus {
    pub fn failed(error_message: impl Into<String>) -> Self {
        TerminalStatus::Failed {
            error_message: error_message.into(),
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            TerminalStatus::Completed => JobStatus::Completed,
            TerminalStatus::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            TerminalStatus::Completed => None,
            TerminalStatus::Failed { error_message } => Some(error_message),
        }
    }

    fn transition(&self) -> JobTransition {
        match self {
            TerminalStatus::Completed => JobTransition::Complete,
            TerminalStatus::Failed { .. } => JobTransition::Fail,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum JobTransition {
    Complete,
    Fail,
}

impl JobTransition {
    fn as_str(self) -> &'static str {
        match self {
            JobTransition::Complete => "complete",
            JobTransition::Fail => "fail",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: GenerationLifecycleMachine,
        initial: Generating,
        states: [Generating, Completed, Failed],
        events {
            complete {
                transition: { from: Generating, to: Completed }
            }
            fail {
                transition: { from: Generating, to: Failed }
            }
        }
    }

    pub(super) fn generating() -> GenerationLifecycleMachine<(), Generating> {
        GenerationLifecycleMachine::new(())
    }
}

fn invalid_transition(state: JobStatus, event: JobTransition) -> AppError {
    AppError::StoreWriteConflict(format!(
        "Invalid job transition: {} -> {}",
        state.as_str(),
        event.as_str()
    ))
}

fn compute_next_state(state: JobStatus, event: JobTransition) -> Result<JobStatus, AppError> {
    use lifecycle::generating;
    match (state, event) {
        (JobStatus::Generating, JobTransition::Complete) => generating()
            .complete()
            .map(|_| JobStatus::Completed)
            .map_err(|_| invalid_transition(state, event)),
        (JobStatus::Generating, JobTransition::Fail) => generating()
            .fail()
            .map(|_| JobStatus::Failed)
            .map_err(|_| invalid_transition(state, event)),
        _ => Err(invalid_transition(state, event)),
    }
}

/// SurrealDB reports unique index violations as "Database index `..` already contains ..".
fn is_unique_violation(err: &surrealdb::Error) -> bool {
    err.to_string().contains("already contains")
}

/// SurrealDB's retryable commit failure when two transactions touch the same keys.
fn is_transaction_conflict(err: &surrealdb::Error) -> bool {
    err.to_string().contains("read or write conflict")
}

/// Parameters handed to the image generator, fixed at submission.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct GenerationParams {
    pub prompt: String,
    pub height: u32,
    pub width: u32,
    pub num_inference_steps: u32,
}

impl GenerationParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            height: DEFAULT_HEIGHT,
            width: DEFAULT_WIDTH,
            num_inference_steps: DEFAULT_INFERENCE_STEPS,
        }
    }
}

stored_object!(GenerationJob, "generation_job", {
    image_name: String,
    status: JobStatus,
    prompt: String,
    height: u32,
    width: u32,
    num_inference_steps: u32,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    error_message: Option<String>
});

impl GenerationJob {
    pub fn new(params: GenerationParams, image_name: String) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4().to_string(),
            image_name,
            status: JobStatus::Generating,
            prompt: params.prompt,
            height: params.height,
            width: params.width,
            num_inference_steps: params.num_inference_steps,
            completed_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn params(&self) -> GenerationParams {
        GenerationParams {
            prompt: self.prompt.clone(),
            height: self.height,
            width: self.width,
            num_inference_steps: self.num_inference_steps,
        }
    }

    /// Stores a fresh job in `generating` state. A taken `image_name` is rejected,
    /// never merged into the existing record.
    pub async fn create_and_add_to_db(
        params: GenerationParams,
        image_name: String,
        db: &SurrealDbClient,
    ) -> Result<GenerationJob, AppError> {
        let job = Self::new(params, image_name);

        match db.store_item(job.clone()).await {
            Ok(Some(stored)) => Ok(stored),
            Ok(None) => Err(AppError::InternalError(format!(
                "generation job {} was not stored",
                job.id
            ))),
            Err(err) if is_unique_violation(&err) => {
                Err(AppError::DuplicateImageName(job.image_name))
            }
            Err(err) if is_transaction_conflict(&err) => Err(AppError::StoreWriteConflict(
                format!("creating job with image name {}", job.image_name),
            )),
            Err(err) => Err(AppError::Database(err)),
        }
    }

    /// Moves a `generating` job into a terminal state, stamping `completed_at`
    /// (and `error_message` on failure) in the same statement.
    ///
    /// Returns `NotFound` for an unknown id and `StoreWriteConflict` if the job
    /// already reached a terminal state or a racing writer holds the record.
    pub async fn update_status(
        job_id: &str,
        terminal: TerminalStatus,
        db: &SurrealDbClient,
    ) -> Result<GenerationJob, AppError> {
        let next = terminal.status();

        const TERMINAL_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET status = $next,
                completed_at = $now,
                error_message = $error_message,
                updated_at = $now
            WHERE status = $generating
            RETURN AFTER;
        "#;

        let now = Utc::now();
        let applied = db
            .client
            .query(TERMINAL_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", job_id.to_string()))
            .bind(("next", next.as_str()))
            .bind(("generating", JobStatus::Generating.as_str()))
            .bind(("error_message", terminal.error_message().map(str::to_string)))
            .bind(("now", SurrealDatetime::from(now)))
            .await
            .and_then(|mut result| result.take::<Option<GenerationJob>>(0));

        let write_error = match applied {
            Ok(Some(job)) => {
                tracing::debug!(job_id, status = job.status.as_str(), "recorded terminal status");
                return Ok(job);
            }
            Ok(None) => None,
            Err(err) => Some(err),
        };

        // The write did not land: judge it against the state actually stored
        let existing = Self::get_by_id(job_id, db).await?;
        compute_next_state(existing.status, terminal.transition())?;

        match write_error {
            Some(err) if !is_transaction_conflict(&err) => Err(AppError::Database(err)),
            _ => Err(AppError::StoreWriteConflict(format!(
                "terminal write to job {job_id} lost to a concurrent writer"
            ))),
        }
    }

    pub async fn get_by_id(job_id: &str, db: &SurrealDbClient) -> Result<GenerationJob, AppError> {
        db.get_item::<Self>(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("generation job {job_id}")))
    }

    pub async fn get_by_image_name(
        image_name: &str,
        db: &SurrealDbClient,
    ) -> Result<GenerationJob, AppError> {
        let jobs: Vec<GenerationJob> = db
            .query("SELECT * FROM type::table($table) WHERE image_name = $image_name LIMIT 1")
            .bind(("table", Self::table_name()))
            .bind(("image_name", image_name.to_string()))
            .await?
            .take(0)?;

        jobs.into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("image {image_name}")))
    }

    /// Most recently created jobs first.
    pub async fn list_recent(
        limit: usize,
        db: &SurrealDbClient,
    ) -> Result<Vec<GenerationJob>, AppError> {
        let jobs: Vec<GenerationJob> = db
            .query("SELECT * FROM type::table($table) ORDER BY created_at DESC LIMIT $limit")
            .bind(("table", Self::table_name()))
            .bind(("limit", limit))
            .await?
            .take(0)?;

        Ok(jobs)
    }

    /// Fails every job still marked `generating`. Only valid at startup, before
    /// any worker runs: those jobs lost their worker with the previous process.
    pub async fn fail_interrupted(db: &SurrealDbClient) -> Result<Vec<GenerationJob>, AppError> {
        const INTERRUPTED_QUERY: &str = r#"
            UPDATE (
                SELECT * FROM type::table($table)
                WHERE status = $generating
            )
            SET status = $failed,
                completed_at = $now,
                error_message = $message,
                updated_at = $now
            RETURN AFTER;
        "#;

        let now = Utc::now();
        let mut result = db
            .client
            .query(INTERRUPTED_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("generating", JobStatus::Generating.as_str()))
            .bind(("failed", JobStatus::Failed.as_str()))
            .bind(("message", INTERRUPTED_MESSAGE))
            .bind(("now", SurrealDatetime::from(now)))
            .await?;

        let failed: Vec<GenerationJob> = result.take(0)?;
        Ok(failed)
    }
}
