//! Asynchronous hand-off of ingestion jobs to a pool of tokio workers.

use crate::error::QueueError;
use crate::orchestrator::{IngestionOrchestrator, IngestionOutcome};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestionJob {
    pub document_id: String,
    pub user_id: String,
}

impl IngestionJob {
    pub fn new(document_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            user_id: user_id.into(),
        }
    }
}

/// Delivery is at-least-once; consumers must tolerate re-delivery.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, job: IngestionJob) -> Result<(), QueueError>;
}

type SharedSender = Arc<Mutex<Option<mpsc::Sender<IngestionJob>>>>;

/// Producer side of a [`WorkerPool`].
#[derive(Clone)]
pub struct LocalTaskQueue {
    sender: SharedSender,
}

#[async_trait]
impl TaskQueue for LocalTaskQueue {
    async fn enqueue(&self, job: IngestionJob) -> Result<(), QueueError> {
        let sender = self.sender.lock().await.clone().ok_or(QueueError::Closed)?;
        sender.send(job).await.map_err(|_| QueueError::Closed)
    }
}

pub struct WorkerPool {
    sender: SharedSender,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `workers` consumers on the current runtime. Must be called from
    /// inside a tokio runtime.
    pub fn start(
        orchestrator: Arc<IngestionOrchestrator>,
        workers: usize,
        capacity: usize,
    ) -> (LocalTaskQueue, WorkerPool) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let sender: SharedSender = Arc::new(Mutex::new(Some(sender)));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let orchestrator = Arc::clone(&orchestrator);
                tokio::spawn(run_worker(worker, receiver, orchestrator))
            })
            .collect();

        (
            LocalTaskQueue {
                sender: Arc::clone(&sender),
            },
            WorkerPool {
                sender,
                workers: handles,
            },
        )
    }

    /// Stops accepting jobs, lets the workers drain what is queued and waits
    /// for them.
    pub async fn shutdown(self) {
        self.sender.lock().await.take();
        for handle in self.workers {
            if let Err(error) = handle.await {
                warn!(error = %error, "ingestion worker panicked");
            }
        }
        info!("worker pool stopped");
    }
}

async fn run_worker(
    worker: usize,
    receiver: Arc<Mutex<mpsc::Receiver<IngestionJob>>>,
    orchestrator: Arc<IngestionOrchestrator>,
) {
    loop {
        let next = receiver.lock().await.recv().await;
        let Some(job) = next else {
            break;
        };
        debug!(worker, document_id = %job.document_id, "worker picked up job");
        let outcome = orchestrator.process(&job.document_id, &job.user_id).await;
        debug!(worker, document_id = %job.document_id, ?outcome, "worker finished job");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Queued,
    Inline(IngestionOutcome),
}

/// Enqueues the job, or runs it to completion on the caller's task when no
/// queue is available or enqueueing fails.
pub async fn dispatch(
    queue: Option<&dyn TaskQueue>,
    orchestrator: &IngestionOrchestrator,
    job: IngestionJob,
) -> Dispatch {
    if let Some(queue) = queue {
        match queue.enqueue(job.clone()).await {
            Ok(()) => return Dispatch::Queued,
            Err(error) => {
                warn!(document_id = %job.document_id, error = %error, "enqueue failed, processing inline");
            }
        }
    }
    Dispatch::Inline(orchestrator.process(&job.document_id, &job.user_id).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProcessingStatus;
    use crate::orchestrator::tests::{harness, uploaded};

    #[tokio::test]
    async fn workers_drain_queued_jobs_before_shutdown() {
        let harness = harness(false);
        let first = uploaded(&harness).await;
        let second = uploaded(&harness).await;

        let (queue, pool) = WorkerPool::start(harness.orchestrator.clone(), 2, 8);
        for document in [&first, &second] {
            queue
                .enqueue(IngestionJob::new(&document.id, "user-1"))
                .await
                .expect("enqueue");
        }
        pool.shutdown().await;

        for document in [&first, &second] {
            let stored = harness.documents.get(&document.id).await.expect("get").expect("exists");
            assert_eq!(stored.processing_status, ProcessingStatus::Completed);
        }
        assert!(matches!(
            queue.enqueue(IngestionJob::new(&first.id, "user-1")).await,
            Err(QueueError::Closed)
        ));
    }

    #[tokio::test]
    async fn dispatch_runs_inline_without_a_queue() {
        let harness = harness(false);
        let document = uploaded(&harness).await;

        let result = dispatch(
            None,
            &harness.orchestrator,
            IngestionJob::new(&document.id, "user-1"),
        )
        .await;
        assert_eq!(result, Dispatch::Inline(IngestionOutcome::Completed));
    }

    #[tokio::test]
    async fn dispatch_falls_back_when_the_queue_is_closed() {
        let harness = harness(false);
        let document = uploaded(&harness).await;
        let (queue, pool) = WorkerPool::start(harness.orchestrator.clone(), 1, 1);
        pool.shutdown().await;

        let result = dispatch(
            Some(&queue),
            &harness.orchestrator,
            IngestionJob::new(&document.id, "user-1"),
        )
        .await;
        assert_eq!(result, Dispatch::Inline(IngestionOutcome::Completed));
    }
}
