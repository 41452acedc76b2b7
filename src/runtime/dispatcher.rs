//! Priority dispatch of created batches.

use parking_lot::Mutex;
use tokio::task::JoinSet;

use crate::core::error::BatchError;
use crate::core::model::{BatchId, BatchJob, BatchResults};
use crate::core::service::BatchService;
use crate::infra::queue::{BatchQueue, QueuedBatch};

/// Result of one dispatched batch.
#[derive(Debug)]
pub struct DispatchOutcome {
    /// Executed batch.
    pub batch_id: BatchId,
    /// Execution result.
    pub result: Result<BatchResults, BatchError>,
}

/// Queues batches by priority and runs a bounded number at once.
pub struct BatchDispatcher {
    service: BatchService,
    queue: Mutex<BatchQueue>,
    max_parallel_batches: usize,
}

impl BatchDispatcher {
    /// Dispatcher running at most `max_parallel_batches` batches concurrently.
    pub fn new(service: BatchService, max_parallel_batches: usize, max_queue_depth: usize) -> Self {
        Self {
            service,
            queue: Mutex::new(BatchQueue::new(max_queue_depth)),
            max_parallel_batches: max_parallel_batches.max(1),
        }
    }

    /// Dispatcher sized from the service configuration.
    pub fn from_service(service: BatchService) -> Self {
        let max_parallel = service.context().config.max_parallel_batches;
        let depth = service.context().config.max_projects_per_batch.max(1) * max_parallel;
        Self::new(service, max_parallel, depth)
    }

    /// Queue a created batch.
    pub fn enqueue(&self, job: &BatchJob) -> Result<(), BatchError> {
        self.queue.lock().enqueue(QueuedBatch::from_job(job))?;
        tracing::debug!(batch_id = %job.batch_id, priority = ?job.priority, "batch queued for dispatch");
        Ok(())
    }

    /// Drop a queued batch. Returns whether it was queued.
    pub fn cancel(&self, batch_id: &BatchId) -> bool {
        self.queue.lock().remove(batch_id)
    }

    /// Batches waiting for dispatch.
    pub fn queued(&self) -> usize {
        self.queue.lock().len()
    }

    fn next(&self) -> Option<QueuedBatch> {
        self.queue.lock().dequeue()
    }

    /// Run every queued batch, highest priority first.
    ///
    /// Outcomes are returned in completion order.
    pub async fn drain(&self) -> Vec<DispatchOutcome> {
        let mut running: JoinSet<DispatchOutcome> = JoinSet::new();
        let mut outcomes = Vec::new();

        loop {
            while running.len() < self.max_parallel_batches {
                let Some(next) = self.next() else { break };
                let service = self.service.clone();
                tracing::info!(batch_id = %next.batch_id, priority = ?next.priority, "dispatching batch");
                running.spawn(async move {
                    let result = service.execute_batch(&next.batch_id).await;
                    DispatchOutcome {
                        batch_id: next.batch_id,
                        result,
                    }
                });
            }

            match running.join_next().await {
                Some(Ok(outcome)) => outcomes.push(outcome),
                Some(Err(e)) => tracing::error!(error = %e, "dispatched batch task aborted"),
                None => break,
            }
        }
        outcomes
    }
}
