//! Progress event sinks.
//!
//! Provides a bounded in-memory buffer and a tokio broadcast fan-out. Emission
//! is best-effort: callers log sink errors and carry on.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::core::model::{BatchId, BatchStatus, ProjectId};
use crate::core::progress::{BatchProgress, ProgressStatus};
use crate::core::task::TaskType;

/// Notification published while a batch runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Batch claimed and progress initialised.
    BatchStarted {
        /// Batch id.
        batch_id: BatchId,
        /// Projects in the batch.
        total_projects: usize,
        /// Emission time.
        at: DateTime<Utc>,
    },
    /// A task changed state.
    TaskUpdated {
        /// Batch id.
        batch_id: BatchId,
        /// Owning project.
        project_id: ProjectId,
        /// Task entry key.
        task_id: String,
        /// Stage.
        task_type: TaskType,
        /// New task status.
        status: ProgressStatus,
        /// Free-form details.
        details: Value,
        /// Batch progress after the update.
        progress: BatchProgress,
        /// Emission time.
        at: DateTime<Utc>,
    },
    /// Batch reached a terminal status.
    BatchFinished {
        /// Batch id.
        batch_id: BatchId,
        /// Terminal status.
        status: BatchStatus,
        /// Successful projects.
        successful: usize,
        /// Failed projects.
        failed: usize,
        /// Skipped projects.
        skipped: usize,
        /// Emission time.
        at: DateTime<Utc>,
    },
}

impl ProgressEvent {
    /// Batch the event belongs to.
    pub const fn batch_id(&self) -> &BatchId {
        match self {
            Self::BatchStarted { batch_id, .. }
            | Self::TaskUpdated { batch_id, .. }
            | Self::BatchFinished { batch_id, .. } => batch_id,
        }
    }
}

/// Event sink failure.
#[derive(Debug, Clone, Error)]
#[error("event sink rejected event: {0}")]
pub struct EventSinkError(pub String);

/// Event sink abstraction.
pub trait EventSink: Send + Sync {
    /// Publish an event.
    fn publish(&self, event: ProgressEvent) -> Result<(), EventSinkError>;
}

/// In-memory event sink with a bounded buffer, for tests and dev.
pub struct InMemoryEventSink {
    events: Mutex<VecDeque<ProgressEvent>>,
    max_events: usize,
}

impl InMemoryEventSink {
    /// Create a new in-memory sink keeping at most `max_events`.
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events.min(1024))),
            max_events: max_events.max(1),
        }
    }

    /// Snapshot of stored events, oldest first.
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Stored events for one batch.
    pub fn events_for(&self, batch_id: &BatchId) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.batch_id() == batch_id)
            .cloned()
            .collect()
    }
}

impl EventSink for InMemoryEventSink {
    fn publish(&self, event: ProgressEvent) -> Result<(), EventSinkError> {
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
        Ok(())
    }
}

/// Fan-out sink over a tokio broadcast channel.
///
/// Publishing with no subscribers drops the event.
pub struct BroadcastEventSink {
    tx: broadcast::Sender<ProgressEvent>,
}

impl BroadcastEventSink {
    /// Channel holding up to `capacity` events per lagging subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New subscriber receiving events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(&self, event: ProgressEvent) -> Result<(), EventSinkError> {
        if self.tx.receiver_count() == 0 {
            return Ok(());
        }
        self.tx
            .send(event)
            .map(|_| ())
            .map_err(|e| EventSinkError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(id: &str) -> ProgressEvent {
        ProgressEvent::BatchStarted {
            batch_id: BatchId::from(id),
            total_projects: 1,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_in_memory_sink_is_bounded() {
        let sink = InMemoryEventSink::new(2);
        sink.publish(started("a")).unwrap();
        sink.publish(started("b")).unwrap();
        sink.publish(started("c")).unwrap();
        let ids: Vec<_> = sink.events().iter().map(|e| e.batch_id().to_string()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(sink.events_for(&BatchId::from("c")).len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_sink_fans_out() {
        let sink = BroadcastEventSink::new(8);
        sink.publish(started("dropped")).unwrap();
        let mut rx = sink.subscribe();
        sink.publish(started("seen")).unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.batch_id().as_str(), "seen");
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(started("x")).unwrap();
        assert_eq!(json["event"], "batch_started");
    }
}
