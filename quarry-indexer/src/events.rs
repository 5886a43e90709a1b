//! Lifecycle notifications for UI and CLI layers.
//!
//! Delivery is best effort. Nothing in the index depends on an event being
//! received, and a lagging subscriber simply misses events.

use crate::source::SourceType;
use serde::Serialize;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IndexEvent {
    IndexingStarted {
        project_id: String,
        source_type: SourceType,
    },
    IndexingInProgress {
        project_id: String,
        source_type: SourceType,
        processed: usize,
        total: usize,
    },
    IndexingCompleted {
        project_id: String,
        source_type: SourceType,
    },
    IndexingFailed {
        project_id: String,
        source_type: SourceType,
        reason: String,
    },
    WatchFailed {
        project_id: String,
        source_type: SourceType,
        reason: String,
    },
}

impl IndexEvent {
    pub fn project_id(&self) -> &str {
        match self {
            IndexEvent::IndexingStarted { project_id, .. }
            | IndexEvent::IndexingInProgress { project_id, .. }
            | IndexEvent::IndexingCompleted { project_id, .. }
            | IndexEvent::IndexingFailed { project_id, .. }
            | IndexEvent::WatchFailed { project_id, .. } => project_id,
        }
    }
}

/// Cloneable handle to a broadcast channel of [`IndexEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<IndexEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: IndexEvent) {
        tracing::trace!(?event, "Emitting index event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }
}

/// Emits events stamped with one coordinator's project and source type.
#[derive(Debug, Clone)]
pub(crate) struct EventEmitter {
    bus: EventBus,
    project_id: String,
    source_type: SourceType,
}

impl EventEmitter {
    pub(crate) fn new(bus: EventBus, project_id: &str, source_type: SourceType) -> Self {
        Self {
            bus,
            project_id: project_id.to_string(),
            source_type,
        }
    }

    pub(crate) fn started(&self) {
        self.bus.emit(IndexEvent::IndexingStarted {
            project_id: self.project_id.clone(),
            source_type: self.source_type,
        });
    }

    pub(crate) fn in_progress(&self, processed: usize, total: usize) {
        self.bus.emit(IndexEvent::IndexingInProgress {
            project_id: self.project_id.clone(),
            source_type: self.source_type,
            processed,
            total,
        });
    }

    pub(crate) fn completed(&self) {
        self.bus.emit(IndexEvent::IndexingCompleted {
            project_id: self.project_id.clone(),
            source_type: self.source_type,
        });
    }

    pub(crate) fn failed(&self, reason: impl Into<String>) {
        self.bus.emit(IndexEvent::IndexingFailed {
            project_id: self.project_id.clone(),
            source_type: self.source_type,
            reason: reason.into(),
        });
    }

    pub(crate) fn watch_failed(&self, reason: impl Into<String>) {
        self.bus.emit(IndexEvent::WatchFailed {
            project_id: self.project_id.clone(),
            source_type: self.source_type,
            reason: reason.into(),
        });
    }
}
