//! In-memory batch store with TTL expiry.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;

use super::BatchStore;
use crate::core::error::StoreError;
use crate::core::model::{BatchId, BatchJob, ProjectId, UserId};
use crate::core::progress::ProgressEntry;
use crate::util::clock::Clock;

pub(crate) fn ttl_to_chrono(ttl: Duration) -> ChronoDuration {
    ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(i64::from(u32::MAX)))
}

/// Minimum spacing between expiry sweeps triggered by inserts.
const SWEEP_INTERVAL_SECS: i64 = 60;

#[derive(Debug, Clone)]
struct StoredBatch {
    job: BatchJob,
    progress: BTreeMap<ProjectId, ProgressEntry>,
    expires_at: DateTime<Utc>,
}

/// Record maps shared by the in-memory and file-backed stores.
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    batches: HashMap<BatchId, StoredBatch>,
    by_user: HashMap<UserId, BTreeSet<BatchId>>,
    next_sweep_at: Option<DateTime<Utc>>,
}

impl StoreState {
    fn live(&self, batch_id: &BatchId, now: DateTime<Utc>) -> Option<&StoredBatch> {
        self.batches.get(batch_id).filter(|b| b.expires_at > now)
    }

    fn live_mut(&mut self, batch_id: &BatchId, now: DateTime<Utc>) -> Option<&mut StoredBatch> {
        self.batches.get_mut(batch_id).filter(|b| b.expires_at > now)
    }

    /// Fails if a live record already uses this id.
    pub(crate) fn ensure_absent(&self, batch_id: &BatchId, now: DateTime<Utc>) -> Result<(), StoreError> {
        match self.live(batch_id, now) {
            Some(_) => Err(StoreError::AlreadyExists(batch_id.clone())),
            None => Ok(()),
        }
    }

    /// Fails unless a live record uses this id.
    pub(crate) fn ensure_live(&self, batch_id: &BatchId, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.live(batch_id, now)
            .map(|_| ())
            .ok_or_else(|| StoreError::Missing(batch_id.clone()))
    }

    /// Add a new record. An expired record with the same id is replaced
    /// along with its progress.
    pub(crate) fn insert(
        &mut self,
        job: &BatchJob,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.ensure_absent(&job.batch_id, now)?;
        self.remove(&job.batch_id);
        self.restore_batch(job.clone(), expires_at);
        Ok(())
    }

    pub(crate) fn check_version(&self, job: &BatchJob, now: DateTime<Utc>) -> Result<(), StoreError> {
        let stored = self
            .live(&job.batch_id, now)
            .ok_or_else(|| StoreError::Missing(job.batch_id.clone()))?;
        if stored.job.version != job.version {
            return Err(StoreError::VersionConflict {
                batch_id: job.batch_id.clone(),
                expected: job.version,
                found: stored.job.version,
            });
        }
        Ok(())
    }

    /// Put a record without checks, keeping existing progress entries.
    pub(crate) fn restore_batch(&mut self, job: BatchJob, expires_at: DateTime<Utc>) {
        match self.batches.get_mut(&job.batch_id) {
            Some(stored) => {
                stored.job = job;
                stored.expires_at = expires_at;
            }
            None => {
                self.by_user
                    .entry(job.user_id)
                    .or_default()
                    .insert(job.batch_id.clone());
                self.batches.insert(
                    job.batch_id.clone(),
                    StoredBatch {
                        job,
                        progress: BTreeMap::new(),
                        expires_at,
                    },
                );
            }
        }
    }

    fn remove(&mut self, batch_id: &BatchId) {
        let Some(stored) = self.batches.remove(batch_id) else {
            return;
        };
        if let Some(ids) = self.by_user.get_mut(&stored.job.user_id) {
            ids.remove(batch_id);
            if ids.is_empty() {
                self.by_user.remove(&stored.job.user_id);
            }
        }
    }

    pub(crate) fn put_progress(
        &mut self,
        batch_id: &BatchId,
        entry: &ProgressEntry,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let stored = self
            .live_mut(batch_id, now)
            .ok_or_else(|| StoreError::Missing(batch_id.clone()))?;
        stored.progress.insert(entry.project_id, entry.clone());
        stored.expires_at = expires_at;
        Ok(())
    }

    /// Put a progress entry without checks. Entries for unknown batches are dropped.
    pub(crate) fn restore_progress(
        &mut self,
        batch_id: &BatchId,
        entry: ProgressEntry,
        expires_at: DateTime<Utc>,
    ) {
        if let Some(stored) = self.batches.get_mut(batch_id) {
            stored.progress.insert(entry.project_id, entry);
            stored.expires_at = expires_at;
        }
    }

    pub(crate) fn get(&self, batch_id: &BatchId, now: DateTime<Utc>) -> Option<BatchJob> {
        self.live(batch_id, now).map(|b| b.job.clone())
    }

    pub(crate) fn list_user(&self, user_id: UserId, now: DateTime<Utc>) -> Vec<BatchJob> {
        let Some(ids) = self.by_user.get(&user_id) else {
            return Vec::new();
        };
        let mut jobs: Vec<BatchJob> = ids
            .iter()
            .filter_map(|id| self.live(id, now))
            .map(|b| b.job.clone())
            .collect();
        jobs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.batch_id.cmp(&a.batch_id))
        });
        jobs
    }

    pub(crate) fn get_progress(
        &self,
        batch_id: &BatchId,
        project_id: ProjectId,
        now: DateTime<Utc>,
    ) -> Option<ProgressEntry> {
        self.live(batch_id, now)
            .and_then(|b| b.progress.get(&project_id).cloned())
    }

    pub(crate) fn list_progress(&self, batch_id: &BatchId, now: DateTime<Utc>) -> Vec<ProgressEntry> {
        self.live(batch_id, now)
            .map(|b| b.progress.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Live records with their progress and expiry, for journal compaction.
    pub(crate) fn snapshot(
        &self,
        now: DateTime<Utc>,
    ) -> Vec<(BatchJob, Vec<ProgressEntry>, DateTime<Utc>)> {
        self.batches
            .values()
            .filter(|b| b.expires_at > now)
            .map(|b| (b.job.clone(), b.progress.values().cloned().collect(), b.expires_at))
            .collect()
    }

    /// Journal lines needed to rewrite the live records.
    pub(crate) fn live_line_count(&self, now: DateTime<Utc>) -> usize {
        self.batches
            .values()
            .filter(|b| b.expires_at > now)
            .map(|b| 1 + b.progress.len())
            .sum()
    }

    /// Drop every expired record. Returns how many were removed.
    pub(crate) fn purge(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<BatchId> = self
            .batches
            .iter()
            .filter(|(_, b)| b.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for batch_id in &expired {
            self.remove(batch_id);
        }
        expired.len()
    }

    /// Purge unless a sweep ran within the last interval.
    pub(crate) fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        if self.next_sweep_at.is_some_and(|at| now < at) {
            return 0;
        }
        self.next_sweep_at = Some(now + ChronoDuration::seconds(SWEEP_INTERVAL_SECS));
        let removed = self.purge(now);
        if removed > 0 {
            tracing::debug!(removed, "purged expired batch records");
        }
        removed
    }

    #[cfg(test)]
    pub(crate) fn record_count(&self) -> usize {
        self.batches.len()
    }

    #[cfg(test)]
    pub(crate) fn indexed_users(&self) -> usize {
        self.by_user.len()
    }
}

/// Process-local batch store.
pub struct InMemoryBatchStore {
    state: Mutex<StoreState>,
    ttl: ChronoDuration,
    clock: Arc<dyn Clock>,
}

impl InMemoryBatchStore {
    /// Store whose records live for `ttl` after their last write.
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            ttl: ttl_to_chrono(ttl),
            clock,
        }
    }
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn insert_batch(&self, job: &mut BatchJob) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.sweep(now);
        let previous = job.version;
        job.version = 1;
        state.insert(job, now, now + self.ttl).inspect_err(|_| job.version = previous)
    }

    async fn get_batch(&self, batch_id: &BatchId) -> Result<Option<BatchJob>, StoreError> {
        Ok(self.state.lock().get(batch_id, self.clock.now()))
    }

    async fn update_batch(&self, job: &mut BatchJob) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.check_version(job, now)?;
        job.version += 1;
        state.restore_batch(job.clone(), now + self.ttl);
        Ok(())
    }

    async fn list_user_batches(&self, user_id: UserId) -> Result<Vec<BatchJob>, StoreError> {
        Ok(self.state.lock().list_user(user_id, self.clock.now()))
    }

    async fn put_progress(&self, batch_id: &BatchId, entry: &ProgressEntry) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.state
            .lock()
            .put_progress(batch_id, entry, now, now + self.ttl)
    }

    async fn get_progress(
        &self,
        batch_id: &BatchId,
        project_id: ProjectId,
    ) -> Result<Option<ProgressEntry>, StoreError> {
        Ok(self
            .state
            .lock()
            .get_progress(batch_id, project_id, self.clock.now()))
    }

    async fn list_progress(&self, batch_id: &BatchId) -> Result<Vec<ProgressEntry>, StoreError> {
        Ok(self.state.lock().list_progress(batch_id, self.clock.now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{BatchMetadata, BatchPriority, BatchStatus};
    use crate::core::settings::BatchSettings;
    use crate::util::clock::ManualClock;

    fn job(user_id: UserId, clock: &ManualClock) -> BatchJob {
        BatchJob::new(
            user_id,
            vec![1, 2, 3],
            BatchSettings::default(),
            BatchPriority::Normal,
            3,
            BatchMetadata::default(),
            clock.now(),
        )
    }

    fn store(clock: &ManualClock) -> InMemoryBatchStore {
        InMemoryBatchStore::new(Duration::from_secs(60), Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let clock = ManualClock::default();
        let store = store(&clock);
        let mut job = job(1, &clock);
        store.insert_batch(&mut job).await.unwrap();
        assert_eq!(job.version, 1);
        let loaded = store.get_batch(&job.batch_id).await.unwrap().unwrap();
        assert_eq!(loaded, job);
        assert!(matches!(
            store.insert_batch(&mut job.clone()).await,
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let clock = ManualClock::default();
        let store = store(&clock);
        let mut job = job(1, &clock);
        store.insert_batch(&mut job).await.unwrap();

        let mut first = job.clone();
        let mut second = job.clone();
        first.mark_processing(clock.now()).unwrap();
        store.update_batch(&mut first).await.unwrap();
        assert_eq!(first.version, 2);

        second.mark_processing(clock.now()).unwrap();
        let err = store.update_batch(&mut second).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 1,
                found: 2,
                ..
            }
        ));
        assert_eq!(second.version, 1);
    }

    #[tokio::test]
    async fn test_records_expire_and_writes_refresh() {
        let clock = ManualClock::default();
        let store = store(&clock);
        let mut job = job(1, &clock);
        store.insert_batch(&mut job).await.unwrap();
        store
            .put_progress(&job.batch_id, &ProgressEntry::pending(1))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(45));
        store
            .put_progress(&job.batch_id, &ProgressEntry::pending(2))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(45));
        assert!(store.get_batch(&job.batch_id).await.unwrap().is_some());
        assert_eq!(store.list_progress(&job.batch_id).await.unwrap().len(), 2);

        clock.advance(Duration::from_secs(61));
        assert!(store.get_batch(&job.batch_id).await.unwrap().is_none());
        assert!(store.list_progress(&job.batch_id).await.unwrap().is_empty());
        assert!(matches!(
            store.update_batch(&mut job).await,
            Err(StoreError::Missing(_))
        ));
    }

    #[tokio::test]
    async fn test_insert_sweeps_expired_records() {
        let clock = ManualClock::default();
        let store = store(&clock);
        let mut stale = job(1, &clock);
        store.insert_batch(&mut stale).await.unwrap();
        store
            .put_progress(&stale.batch_id, &ProgressEntry::pending(1))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(61));
        let mut fresh = job(2, &clock);
        store.insert_batch(&mut fresh).await.unwrap();

        let state = store.state.lock();
        assert_eq!(state.record_count(), 1);
        assert_eq!(state.indexed_users(), 1);
        assert!(state.list_user(1, clock.now()).is_empty());
        assert_eq!(state.list_user(2, clock.now()).len(), 1);
    }

    #[tokio::test]
    async fn test_sweeps_are_spaced_out() {
        let clock = ManualClock::default();
        let store = InMemoryBatchStore::new(Duration::from_secs(5), Arc::new(clock.clone()));
        let mut first = job(1, &clock);
        store.insert_batch(&mut first).await.unwrap();

        // Expired, but the previous sweep ran less than a minute ago.
        clock.advance(Duration::from_secs(10));
        store.insert_batch(&mut job(1, &clock)).await.unwrap();
        assert_eq!(store.state.lock().record_count(), 2);

        clock.advance(Duration::from_secs(60));
        store.insert_batch(&mut job(1, &clock)).await.unwrap();
        assert_eq!(store.state.lock().record_count(), 1);
    }

    #[tokio::test]
    async fn test_list_user_batches_newest_first() {
        let clock = ManualClock::default();
        let store = store(&clock);
        let mut older = job(7, &clock);
        store.insert_batch(&mut older).await.unwrap();
        clock.advance(Duration::from_secs(1));
        let mut newer = job(7, &clock);
        store.insert_batch(&mut newer).await.unwrap();
        let mut other = job(8, &clock);
        store.insert_batch(&mut other).await.unwrap();

        let listed = store.list_user_batches(7).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|j| j.batch_id.clone()).collect();
        assert_eq!(ids, vec![newer.batch_id.clone(), older.batch_id.clone()]);
        assert!(listed.iter().all(|j| j.status == BatchStatus::Pending));
        assert!(store.list_user_batches(9).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reinserted_expired_id_starts_clean() {
        let clock = ManualClock::default();
        let store = store(&clock);
        let mut original = job(4, &clock);
        store.insert_batch(&mut original).await.unwrap();
        store
            .put_progress(&original.batch_id, &ProgressEntry::pending(1))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(30));
        let mut reused = job(5, &clock);
        reused.batch_id = original.batch_id.clone();
        assert!(matches!(
            store.insert_batch(&mut reused.clone()).await,
            Err(StoreError::AlreadyExists(_))
        ));

        clock.advance(Duration::from_secs(31));
        store.insert_batch(&mut reused).await.unwrap();
        assert!(store.list_progress(&reused.batch_id).await.unwrap().is_empty());
        assert!(store.list_user_batches(4).await.unwrap().is_empty());
        assert_eq!(store.list_user_batches(5).await.unwrap().len(), 1);
    }
}
