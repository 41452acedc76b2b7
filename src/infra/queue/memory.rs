//! In-memory batch queue with priority ordering.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};

use crate::core::error::BatchError;
use crate::core::model::{BatchId, BatchJob, BatchPriority};

/// Queued reference to a pending batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedBatch {
    /// Batch to execute.
    pub batch_id: BatchId,
    /// Priority at enqueue time.
    pub priority: BatchPriority,
    /// Batch creation time.
    pub created_at: DateTime<Utc>,
    seq: u64,
}

impl QueuedBatch {
    /// Queue entry for a batch record.
    pub fn from_job(job: &BatchJob) -> Self {
        Self {
            batch_id: job.batch_id.clone(),
            priority: job.priority,
            created_at: job.created_at,
            seq: 0,
        }
    }
}

impl PartialOrd for QueuedBatch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedBatch {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then earlier creation, then earlier enqueue (reversed for max-heap).
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority heap of batches waiting for dispatch.
pub struct BatchQueue {
    max_depth: usize,
    next_seq: u64,
    batches: BinaryHeap<QueuedBatch>,
}

impl BatchQueue {
    /// Create a queue holding at most `max_depth` batches.
    pub fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            next_seq: 0,
            batches: BinaryHeap::with_capacity(max_depth.min(1024)),
        }
    }

    /// Add a batch.
    pub fn enqueue(&mut self, mut batch: QueuedBatch) -> Result<(), BatchError> {
        if self.len() >= self.max_depth {
            return Err(BatchError::QueueFull(self.max_depth));
        }
        batch.seq = self.next_seq;
        self.next_seq += 1;
        self.batches.push(batch);
        Ok(())
    }

    /// Remove the highest priority batch.
    pub fn dequeue(&mut self) -> Option<QueuedBatch> {
        self.batches.pop()
    }

    /// Drop a batch before dispatch. Returns whether it was queued.
    pub fn remove(&mut self, batch_id: &BatchId) -> bool {
        let before = self.batches.len();
        self.batches.retain(|b| &b.batch_id != batch_id);
        self.batches.len() < before
    }

    /// Capacity.
    pub const fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Queued batches.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }
}
