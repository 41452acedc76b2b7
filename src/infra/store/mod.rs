//! Batch record stores.

use async_trait::async_trait;

use crate::core::error::StoreError;
use crate::core::model::{BatchId, BatchJob, ProjectId, UserId};
use crate::core::progress::ProgressEntry;

pub mod file;
pub mod memory;

pub use file::FileBatchStore;
pub use memory::InMemoryBatchStore;

/// Durable home of batch records and their progress entries.
///
/// Records expire after a TTL that every write refreshes. Progress entries
/// expire with their batch.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Store a new record and set its version to 1.
    async fn insert_batch(&self, job: &mut BatchJob) -> Result<(), StoreError>;

    /// Fetch a live record.
    async fn get_batch(&self, batch_id: &BatchId) -> Result<Option<BatchJob>, StoreError>;

    /// Replace a record if `job.version` matches the stored version, then bump it.
    async fn update_batch(&self, job: &mut BatchJob) -> Result<(), StoreError>;

    /// Live records of a user, newest first.
    async fn list_user_batches(&self, user_id: UserId) -> Result<Vec<BatchJob>, StoreError>;

    /// Upsert a project's progress entry.
    async fn put_progress(&self, batch_id: &BatchId, entry: &ProgressEntry) -> Result<(), StoreError>;

    /// Fetch a project's progress entry.
    async fn get_progress(
        &self,
        batch_id: &BatchId,
        project_id: ProjectId,
    ) -> Result<Option<ProgressEntry>, StoreError>;

    /// All progress entries of a batch, by project id.
    async fn list_progress(&self, batch_id: &BatchId) -> Result<Vec<ProgressEntry>, StoreError>;
}
