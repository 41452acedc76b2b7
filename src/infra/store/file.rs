//! File-backed batch store.
//!
//! Every write is appended to a JSON lines journal and applied to an in-memory
//! view only after the append succeeds. Opening the store replays the journal.
//! Inserts sweep expired records and compact the journal once it is mostly
//! dead lines; [`FileBatchStore::compact`] forces a rewrite.

use std::fs::{self, create_dir_all, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::memory::{ttl_to_chrono, StoreState};
use super::BatchStore;
use crate::core::error::StoreError;
use crate::core::model::{BatchId, BatchJob, ProjectId, UserId};
use crate::core::progress::ProgressEntry;
use crate::util::clock::Clock;

/// Journals shorter than this are never compacted on insert.
const COMPACT_MIN_LINES: usize = 1024;
/// Compact once the journal holds this many lines per live line.
const COMPACT_RATIO: usize = 4;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalLine {
    Batch {
        job: BatchJob,
        expires_at: DateTime<Utc>,
    },
    Progress {
        batch_id: BatchId,
        entry: ProgressEntry,
        expires_at: DateTime<Utc>,
    },
}

/// Batch store persisted as a JSON lines journal.
pub struct FileBatchStore {
    path: PathBuf,
    state: Mutex<StoreState>,
    journal_lines: AtomicUsize,
    ttl: ChronoDuration,
    clock: Arc<dyn Clock>,
}

impl FileBatchStore {
    /// Open (or create) the journal at `path` and replay it.
    pub fn open(path: impl AsRef<Path>, ttl: Duration, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_dir_all(parent)?;
        }
        let store = Self {
            path,
            state: Mutex::new(StoreState::default()),
            journal_lines: AtomicUsize::new(0),
            ttl: ttl_to_chrono(ttl),
            clock,
        };
        let replayed = store.load_from_disk()?;
        store.journal_lines.store(replayed, Ordering::Relaxed);
        tracing::info!(path = %store.path.display(), replayed, "opened batch journal");
        Ok(store)
    }

    /// Journal location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay the journal. A final line that does not parse is a write torn by
    /// a crash: it is dropped and cut from the file. Bad lines anywhere else
    /// fail the load.
    fn load_from_disk(&self) -> Result<usize, StoreError> {
        if !self.path.exists() {
            return Ok(0);
        }
        let bytes = fs::read(&self.path)?;
        let mut state = self.state.lock();
        let mut count = 0;
        let mut offset = 0;
        let mut torn_at = None;
        for segment in bytes.split_inclusive(|b| *b == b'\n') {
            let start = offset;
            offset += segment.len();
            if segment.trim_ascii().is_empty() {
                continue;
            }
            let line = match serde_json::from_slice::<JournalLine>(segment) {
                Ok(line) => line,
                Err(e) if bytes[offset..].trim_ascii().is_empty() => {
                    tracing::warn!(
                        path = %self.path.display(),
                        offset = start,
                        error = %e,
                        "dropping torn journal tail"
                    );
                    torn_at = Some(start);
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            match line {
                JournalLine::Batch { job, expires_at } => state.restore_batch(job, expires_at),
                JournalLine::Progress {
                    batch_id,
                    entry,
                    expires_at,
                } => state.restore_progress(&batch_id, entry, expires_at),
            }
            count += 1;
        }

        let valid_len = torn_at.unwrap_or(bytes.len());
        let needs_newline = valid_len > 0 && bytes[valid_len - 1] != b'\n';
        if torn_at.is_some() || needs_newline {
            let mut file = OpenOptions::new().write(true).open(&self.path)?;
            file.set_len(valid_len as u64)?;
            if needs_newline {
                file.seek(SeekFrom::End(0))?;
                file.write_all(b"\n")?;
            }
        }
        Ok(count)
    }

    /// Append one line. A failed write is cut back off the file so later
    /// appends never follow a partial line.
    fn append_to_disk(&self, line: &JournalLine) -> Result<(), StoreError> {
        let mut buf = serde_json::to_vec(line)?;
        buf.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let start = file.metadata()?.len();
        if let Err(e) = file.write_all(&buf).and_then(|()| file.flush()) {
            if let Err(rollback) = file.set_len(start) {
                tracing::error!(path = %self.path.display(), error = %rollback, "failed to cut partial journal line");
            }
            return Err(e.into());
        }
        self.journal_lines.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Rewrite the journal with live records only. Returns the records kept.
    pub fn compact(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.compact_locked(&mut state, now)
    }

    /// Writes the live records to a sibling file, then renames it over the
    /// journal.
    fn compact_locked(&self, state: &mut StoreState, now: DateTime<Utc>) -> Result<usize, StoreError> {
        state.purge(now);
        let snapshot = state.snapshot(now);
        let mut buf = Vec::new();
        let mut lines = 0;
        for (job, entries, expires_at) in &snapshot {
            let batch_id = job.batch_id.clone();
            serde_json::to_writer(
                &mut buf,
                &JournalLine::Batch {
                    job: job.clone(),
                    expires_at: *expires_at,
                },
            )?;
            buf.push(b'\n');
            lines += 1;
            for entry in entries {
                serde_json::to_writer(
                    &mut buf,
                    &JournalLine::Progress {
                        batch_id: batch_id.clone(),
                        entry: entry.clone(),
                        expires_at: *expires_at,
                    },
                )?;
                buf.push(b'\n');
                lines += 1;
            }
        }

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".compact");
        let tmp_path = PathBuf::from(tmp_name);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;

        let before = self.journal_lines.swap(lines, Ordering::Relaxed);
        tracing::debug!(
            path = %self.path.display(),
            before,
            after = lines,
            records = snapshot.len(),
            "compacted batch journal"
        );
        Ok(snapshot.len())
    }

    /// Sweep expired records and compact when the journal is worth rewriting.
    fn maintain(&self, state: &mut StoreState, now: DateTime<Utc>) {
        let purged = state.sweep(now);
        let lines = self.journal_lines.load(Ordering::Relaxed);
        let bloated =
            lines >= COMPACT_MIN_LINES && lines > COMPACT_RATIO * state.live_line_count(now);
        if purged == 0 && !bloated {
            return;
        }
        if let Err(e) = self.compact_locked(state, now) {
            tracing::warn!(path = %self.path.display(), error = %e, "journal compaction failed");
        }
    }
}

#[async_trait]
impl BatchStore for FileBatchStore {
    async fn insert_batch(&self, job: &mut BatchJob) -> Result<(), StoreError> {
        let now = self.clock.now();
        let expires_at = now + self.ttl;
        let mut state = self.state.lock();
        state.ensure_absent(&job.batch_id, now)?;
        self.maintain(&mut state, now);

        let mut stored = job.clone();
        stored.version = 1;
        self.append_to_disk(&JournalLine::Batch {
            job: stored.clone(),
            expires_at,
        })?;
        state.insert(&stored, now, expires_at)?;
        job.version = stored.version;
        Ok(())
    }

    async fn get_batch(&self, batch_id: &BatchId) -> Result<Option<BatchJob>, StoreError> {
        Ok(self.state.lock().get(batch_id, self.clock.now()))
    }

    async fn update_batch(&self, job: &mut BatchJob) -> Result<(), StoreError> {
        let now = self.clock.now();
        let expires_at = now + self.ttl;
        let mut state = self.state.lock();
        state.check_version(job, now)?;

        let mut next = job.clone();
        next.version += 1;
        self.append_to_disk(&JournalLine::Batch {
            job: next.clone(),
            expires_at,
        })?;
        job.version = next.version;
        state.restore_batch(next, expires_at);
        Ok(())
    }

    async fn list_user_batches(&self, user_id: UserId) -> Result<Vec<BatchJob>, StoreError> {
        Ok(self.state.lock().list_user(user_id, self.clock.now()))
    }

    async fn put_progress(&self, batch_id: &BatchId, entry: &ProgressEntry) -> Result<(), StoreError> {
        let now = self.clock.now();
        let expires_at = now + self.ttl;
        let mut state = self.state.lock();
        state.ensure_live(batch_id, now)?;
        self.append_to_disk(&JournalLine::Progress {
            batch_id: batch_id.clone(),
            entry: entry.clone(),
            expires_at,
        })?;
        state.put_progress(batch_id, entry, now, expires_at)
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
    use crate::core::progress::ProgressStatus;
    use crate::core::settings::BatchSettings;
    use crate::util::clock::ManualClock;

    fn job(clock: &ManualClock) -> BatchJob {
        BatchJob::new(
            3,
            vec![10, 20],
            BatchSettings::default(),
            BatchPriority::High,
            2,
            BatchMetadata::default(),
            clock.now(),
        )
    }

    #[tokio::test]
    async fn test_journal_replay_restores_latest_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batches.jsonl");
        let clock = ManualClock::default();
        let ttl = Duration::from_secs(3600);

        let mut job = job(&clock);
        {
            let store = FileBatchStore::open(&path, ttl, Arc::new(clock.clone())).unwrap();
            store.insert_batch(&mut job).await.unwrap();
            job.mark_processing(clock.now()).unwrap();
            store.update_batch(&mut job).await.unwrap();
            let mut entry = ProgressEntry::pending(10);
            entry.status = ProgressStatus::Submitted;
            store.put_progress(&job.batch_id, &entry).await.unwrap();
        }

        let reopened = FileBatchStore::open(&path, ttl, Arc::new(clock.clone())).unwrap();
        let loaded = reopened.get_batch(&job.batch_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, BatchStatus::Processing);
        assert_eq!(loaded.version, 2);
        let entry = reopened.get_progress(&job.batch_id, 10).await.unwrap().unwrap();
        assert_eq!(entry.status, ProgressStatus::Submitted);
        assert_eq!(reopened.list_user_batches(3).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_compact_drops_expired_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("batches.jsonl");
        let clock = ManualClock::default();
        let store = FileBatchStore::open(&path, Duration::from_secs(10), Arc::new(clock.clone())).unwrap();

        let mut stale = job(&clock);
        store.insert_batch(&mut stale).await.unwrap();
        clock.advance(Duration::from_secs(8));
        let mut fresh = job(&clock);
        store.insert_batch(&mut fresh).await.unwrap();
        store.update_batch(&mut fresh).await.unwrap();
        clock.advance(Duration::from_secs(5));

        assert_eq!(store.compact().unwrap(), 1);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);

        let reopened = FileBatchStore::open(&path, Duration::from_secs(10), Arc::new(clock.clone())).unwrap();
        assert!(reopened.get_batch(&stale.batch_id).await.unwrap().is_none());
        assert_eq!(
            reopened.get_batch(&fresh.batch_id).await.unwrap().map(|j| j.version),
            Some(2)
        );
    }

    #[tokio::test]
    async fn test_failed_append_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batches.jsonl");
        let clock = ManualClock::default();
        let store = FileBatchStore::open(&path, Duration::from_secs(3600), Arc::new(clock.clone())).unwrap();

        let mut batch = job(&clock);
        store.insert_batch(&mut batch).await.unwrap();

        // A directory in place of the journal makes every append fail.
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        let mut processing = batch.clone();
        processing.mark_processing(clock.now()).unwrap();
        assert!(matches!(
            store.update_batch(&mut processing).await,
            Err(StoreError::Io(_))
        ));
        assert_eq!(processing.version, 1);
        let stored = store.get_batch(&batch.batch_id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.status, BatchStatus::Pending);

        assert!(store
            .put_progress(&batch.batch_id, &ProgressEntry::pending(10))
            .await
            .is_err());
        assert!(store.list_progress(&batch.batch_id).await.unwrap().is_empty());

        let mut other = job(&clock);
        assert!(store.insert_batch(&mut other).await.is_err());
        assert_eq!(other.version, 0);
        assert!(store.get_batch(&other.batch_id).await.unwrap().is_none());
        assert_eq!(store.list_user_batches(3).await.unwrap().len(), 1);

        // The same write goes through once the journal is writable again.
        fs::remove_dir(&path).unwrap();
        store.update_batch(&mut processing).await.unwrap();
        assert_eq!(processing.version, 2);
    }

    #[tokio::test]
    async fn test_torn_tail_is_dropped_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batches.jsonl");
        let clock = ManualClock::default();
        let ttl = Duration::from_secs(3600);

        let mut first = job(&clock);
        {
            let store = FileBatchStore::open(&path, ttl, Arc::new(clock.clone())).unwrap();
            store.insert_batch(&mut first).await.unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"op":"batch","job":{"batch_"#).unwrap();
        drop(file);

        let mut second = job(&clock);
        {
            let store = FileBatchStore::open(&path, ttl, Arc::new(clock.clone())).unwrap();
            assert!(store.get_batch(&first.batch_id).await.unwrap().is_some());
            store.insert_batch(&mut second).await.unwrap();
        }

        let reopened = FileBatchStore::open(&path, ttl, Arc::new(clock.clone())).unwrap();
        assert!(reopened.get_batch(&first.batch_id).await.unwrap().is_some());
        assert!(reopened.get_batch(&second.batch_id).await.unwrap().is_some());
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_line_before_the_tail_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batches.jsonl");
        let clock = ManualClock::default();
        let ttl = Duration::from_secs(3600);
        {
            let store = FileBatchStore::open(&path, ttl, Arc::new(clock.clone())).unwrap();
            store.insert_batch(&mut job(&clock)).await.unwrap();
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"not json\n").unwrap();
            store.insert_batch(&mut job(&clock)).await.unwrap();
        }

        assert!(matches!(
            FileBatchStore::open(&path, ttl, Arc::new(clock.clone())),
            Err(StoreError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_insert_compacts_after_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batches.jsonl");
        let clock = ManualClock::default();
        let ttl = Duration::from_secs(10);
        let store = FileBatchStore::open(&path, ttl, Arc::new(clock.clone())).unwrap();

        let mut stale = job(&clock);
        store.insert_batch(&mut stale).await.unwrap();
        for project in [10, 20] {
            store
                .put_progress(&stale.batch_id, &ProgressEntry::pending(project))
                .await
                .unwrap();
        }
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 3);

        clock.advance(Duration::from_secs(61));
        let mut fresh = job(&clock);
        store.insert_batch(&mut fresh).await.unwrap();

        assert_eq!(store.state.lock().record_count(), 1);
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 1);
        let reopened = FileBatchStore::open(&path, ttl, Arc::new(clock.clone())).unwrap();
        assert!(reopened.get_batch(&stale.batch_id).await.unwrap().is_none());
        assert!(reopened.get_batch(&fresh.batch_id).await.unwrap().is_some());
    }
}
