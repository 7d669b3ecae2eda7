use std::sync::Arc;

use common::error::AppError;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{error, info};
use uuid::Uuid;

use crate::worker::{Dispatch, GenerationWorker};

const WORKER_PANIC_MESSAGE: &str = "generation worker panicked";

/// Sending half of the bounded work queue.
#[derive(Clone)]
pub struct GenerationQueue {
    sender: mpsc::Sender<Dispatch>,
}

/// A reserved place in the queue. Dropping it unused gives the place back.
pub struct QueueSlot<'a> {
    permit: mpsc::Permit<'a, Dispatch>,
}

impl QueueSlot<'_> {
    pub fn dispatch(self, dispatch: Dispatch) {
        self.permit.send(dispatch);
    }
}

impl GenerationQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Dispatch>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Reserves a slot without waiting; a saturated queue is `QueueFull`.
    pub fn reserve(&self) -> Result<QueueSlot<'_>, AppError> {
        match self.sender.try_reserve() {
            Ok(permit) => Ok(QueueSlot { permit }),
            Err(mpsc::error::TrySendError::Full(())) => Err(AppError::QueueFull(format!(
                "{} jobs already waiting",
                self.sender.max_capacity()
            ))),
            Err(mpsc::error::TrySendError::Closed(())) => Err(AppError::InternalError(
                "generation workers have stopped".into(),
            )),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub fn pending(&self) -> usize {
        self.sender
            .max_capacity()
            .saturating_sub(self.sender.capacity())
    }
}

/// Starts `concurrency` workers draining a fresh queue of the given capacity.
pub fn spawn_worker_pool(
    worker: Arc<GenerationWorker>,
    capacity: usize,
    concurrency: usize,
) -> (GenerationQueue, Vec<JoinHandle<()>>) {
    let (queue, receiver) = GenerationQueue::new(capacity);
    let receiver = Arc::new(Mutex::new(receiver));

    let handles = (0..concurrency.max(1))
        .map(|_| {
            let worker = Arc::clone(&worker);
            let receiver = Arc::clone(&receiver);
            tokio::spawn(run_worker_loop(worker, receiver))
        })
        .collect();

    (queue, handles)
}

/// Takes dispatches one at a time until every sender is gone.
pub async fn run_worker_loop(
    worker: Arc<GenerationWorker>,
    receiver: Arc<Mutex<mpsc::Receiver<Dispatch>>>,
) {
    let worker_id = format!("generation-worker-{}", Uuid::new_v4());
    info!(%worker_id, "generation worker started");

    loop {
        let next = receiver.lock().await.recv().await;
        let Some(dispatch) = next else {
            info!(%worker_id, "generation queue closed, worker exiting");
            break;
        };

        let job_id = dispatch.job_id.clone();
        info!(%worker_id, %job_id, "picked up generation job");

        // Each run gets its own task so a panic ends the job, not the loop
        let runner = Arc::clone(&worker);
        match tokio::spawn(async move { runner.run(dispatch).await }).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                error!(%worker_id, %job_id, error = %err, "generation job could not be finalised");
            }
            Err(join_err) => {
                error!(%worker_id, %job_id, error = %join_err, "generation run aborted");
                if let Err(err) = worker.abandon(&job_id, WORKER_PANIC_MESSAGE).await {
                    error!(%worker_id, %job_id, error = %err, "aborted job could not be failed");
                }
            }
        }
    }
}
