//! Coordinator status and pass progress.

use serde::Serialize;
use std::fmt;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexStatus {
    NotStarted,
    Indexing,
    /// The last pass completed; no watch is running
    Ready,
    /// The last pass completed and live updates are being applied
    Watching,
    /// The last pass or the watch loop failed; see `IndexProgress::error`
    Failed,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexStatus::NotStarted => "NOT_STARTED",
            IndexStatus::Indexing => "INDEXING",
            IndexStatus::Ready => "READY",
            IndexStatus::Watching => "WATCHING",
            IndexStatus::Failed => "FAILED",
        }
    }

    /// Whether a consistent baseline exists, which watching requires.
    pub fn has_baseline(&self) -> bool {
        matches!(self, IndexStatus::Ready | IndexStatus::Watching)
    }
}

impl fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexProgress {
    pub status: IndexStatus,
    pub total_files: usize,
    pub processed_files: usize,
    pub error: Option<String>,
}

impl Default for IndexProgress {
    fn default() -> Self {
        Self {
            status: IndexStatus::NotStarted,
            total_files: 0,
            processed_files: 0,
            error: None,
        }
    }
}

/// Counters for one pass. Reset when a pass starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessingStats {
    pub files_indexed: usize,
    pub files_unchanged: usize,
    pub files_skipped: usize,
    pub files_removed: usize,
    pub segments_embedded: usize,
    pub errors: usize,
}

/// Observable progress. Writers are the coordinator and its watch worker;
/// readers hold [`watch::Receiver`]s from [`ProgressTracker::subscribe`].
#[derive(Debug)]
pub struct ProgressTracker {
    sender: watch::Sender<IndexProgress>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(IndexProgress::default());
        Self { sender }
    }

    pub fn get(&self) -> IndexProgress {
        self.sender.borrow().clone()
    }

    pub fn status(&self) -> IndexStatus {
        self.sender.borrow().status
    }

    pub fn subscribe(&self) -> watch::Receiver<IndexProgress> {
        self.sender.subscribe()
    }

    pub fn start_pass(&self, total_files: usize) {
        self.sender.send_replace(IndexProgress {
            status: IndexStatus::Indexing,
            total_files,
            processed_files: 0,
            error: None,
        });
    }

    pub fn set_total(&self, total_files: usize) {
        self.sender.send_modify(|p| p.total_files = total_files);
    }

    pub fn set_processed(&self, processed_files: usize) {
        self.sender.send_modify(|p| p.processed_files = processed_files);
    }

    pub fn set_status(&self, status: IndexStatus) {
        self.sender.send_modify(|p| {
            p.status = status;
            if status != IndexStatus::Failed {
                p.error = None;
            }
        });
    }

    pub fn fail(&self, error: impl Into<String>) {
        let error = error.into();
        self.sender.send_modify(|p| {
            p.status = IndexStatus::Failed;
            p.error = Some(error);
        });
    }

    /// Swap `from` for `to` only if the status is still `from`.
    pub fn transition(&self, from: IndexStatus, to: IndexStatus) -> bool {
        self.sender.send_if_modified(|p| {
            if p.status == from {
                p.status = to;
                true
            } else {
                false
            }
        })
    }
}
