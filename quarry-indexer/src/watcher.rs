//! Filesystem watching for local folder sources.
//!
//! Each watched root gets a debounced `notify` watcher and a worker task. The
//! debouncer thread pushes batches of [`FileChange`]s into a bounded flume
//! channel; the worker drains it and hands each change to the
//! [`FileChangeHandler`].
//!
//! The debouncer never blocks on a full channel. It sets a rescan flag
//! instead, and the worker answers the flag with a full incremental pass. The
//! same happens when notify itself reports that events were dropped.

use crate::coordinator::IndexPipeline;
use crate::error::{IndexError, Result};
use crate::handler::FileChangeHandler;
use crate::progress::IndexStatus;
use itertools::Itertools;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{DebounceEventResult, Debouncer, RecommendedCache, new_debouncer};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl FileChange {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Changes described by one notify event. Renames split into a delete of the
/// old path and a create of the new one.
pub fn classify(event: &notify::Event) -> Vec<FileChange> {
    let all = |kind| {
        event
            .paths
            .iter()
            .map(|p| FileChange::new(p.clone(), kind))
            .collect()
    };
    match event.kind {
        EventKind::Create(_) => all(ChangeKind::Create),
        EventKind::Remove(_) => all(ChangeKind::Delete),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => all(ChangeKind::Delete),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => all(ChangeKind::Create),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => vec![
            FileChange::new(event.paths[0].clone(), ChangeKind::Delete),
            FileChange::new(event.paths[1].clone(), ChangeKind::Create),
        ],
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => all(ChangeKind::Modify),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

/// Keep the last change per path, ordered by where that change occurred.
pub fn coalesce(changes: Vec<FileChange>) -> Vec<FileChange> {
    let mut last_wins = changes
        .into_iter()
        .rev()
        .unique_by(|c| c.path.clone())
        .collect::<Vec<_>>();
    last_wins.reverse();
    last_wins
}

fn is_fatal(error: &notify::Error) -> bool {
    matches!(
        error.kind,
        notify::ErrorKind::MaxFilesWatch | notify::ErrorKind::PathNotFound
    )
}

/// State the debouncer thread hands to the worker outside the channel.
#[derive(Debug, Default)]
struct WatchFlags {
    rescan: AtomicBool,
    fatal: Mutex<Option<String>>,
}

impl WatchFlags {
    fn set_fatal(&self, reason: String) {
        let mut fatal = self.fatal.lock().unwrap_or_else(|p| p.into_inner());
        fatal.get_or_insert(reason);
    }

    fn take_fatal(&self) -> Option<String> {
        self.fatal.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

/// A debounced watch on one root.
pub struct FileWatcher {
    root: PathBuf,
    // Dropping the debouncer stops the watch
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
    receiver: flume::Receiver<Vec<FileChange>>,
    flags: Arc<WatchFlags>,
}

impl FileWatcher {
    pub fn start(root: &Path, debounce: Duration, capacity: usize) -> Result<Self> {
        let (sender, receiver) = flume::bounded(capacity.max(1));
        let flags = Arc::new(WatchFlags::default());

        let thread_flags = flags.clone();
        let watched_root = root.to_path_buf();
        let mut debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
            let nudge = |sender: &flume::Sender<Vec<FileChange>>| {
                // An empty batch only wakes the worker; if the channel is
                // full the worker is awake anyway
                let _ = sender.try_send(Vec::new());
            };

            match result {
                Ok(events) => {
                    if events.iter().any(|e| e.need_rescan()) {
                        thread_flags.rescan.store(true, Ordering::SeqCst);
                        nudge(&sender);
                    }
                    let root_removed = events.iter().any(|e| {
                        matches!(e.kind, EventKind::Remove(_))
                            && e.paths.iter().any(|p| p == &watched_root)
                    });
                    if root_removed {
                        thread_flags.set_fatal(format!(
                            "watched root {} was removed",
                            watched_root.display()
                        ));
                        nudge(&sender);
                        return;
                    }

                    let changes = coalesce(events.iter().flat_map(|e| classify(e)).collect());
                    if changes.is_empty() {
                        return;
                    }
                    if let Err(flume::TrySendError::Full(_)) = sender.try_send(changes) {
                        thread_flags.rescan.store(true, Ordering::SeqCst);
                    }
                }
                Err(errors) => {
                    for e in errors {
                        if is_fatal(&e) {
                            thread_flags.set_fatal(e.to_string());
                            nudge(&sender);
                        } else {
                            warn!("File watcher error: {}", e);
                        }
                    }
                }
            }
        })
        .map_err(|e| IndexError::watch(format!("cannot create watcher: {e}")))?;

        debouncer
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| IndexError::watch(format!("cannot watch {}: {e}", root.display())))?;
        info!("Watching {}", root.display());

        Ok(Self {
            root: root.to_path_buf(),
            _debouncer: debouncer,
            receiver,
            flags,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Wait for the next batch of changes. `None` once the watcher is gone.
    pub async fn next_batch(&self) -> Option<Vec<FileChange>> {
        self.receiver.recv_async().await.ok()
    }

    /// Consume the rescan flag, discarding any queued changes it covers.
    fn take_rescan(&self) -> bool {
        if self.flags.rescan.swap(false, Ordering::SeqCst) {
            let dropped = self.receiver.drain().count();
            debug!(dropped, "Discarding queued changes before rescan");
            true
        } else {
            false
        }
    }
}

/// Runs one root's watch loop until cancelled or a fatal watch error.
pub(crate) struct WatchWorker {
    pub(crate) watcher: FileWatcher,
    pub(crate) handler: Arc<FileChangeHandler>,
    pub(crate) pipeline: Arc<IndexPipeline>,
    /// Shared by every root of a coordinator; a fatal error cancels them all
    pub(crate) token: CancellationToken,
}

impl WatchWorker {
    pub(crate) async fn run(self) {
        loop {
            let batch = tokio::select! {
                _ = self.token.cancelled() => break,
                batch = self.watcher.next_batch() => batch,
            };
            let Some(batch) = batch else {
                self.fail("watch channel closed");
                break;
            };

            if let Some(reason) = self.watcher.flags.take_fatal() {
                self.fail(&reason);
                break;
            }
            // Removing the root may only surface as removals of its children
            let root = self.watcher.root();
            if !tokio::fs::metadata(root).await.is_ok_and(|m| m.is_dir()) {
                self.fail(&format!("watched root {} was removed", root.display()));
                break;
            }

            if self.watcher.take_rescan() {
                info!(
                    "Change backlog for {} overflowed, running a full pass",
                    self.watcher.root().display()
                );
                if !self.pipeline.run_pass().await {
                    // The pass already recorded FAILED
                    self.token.cancel();
                    break;
                }
                continue;
            }

            for change in batch {
                if let Err(e) = self.handler.handle(&change).await {
                    error!("Failed to apply change to {}: {}", change.path.display(), e);
                }
            }
        }

        self.pipeline.set_watching(false);
        self.pipeline
            .tracker()
            .transition(IndexStatus::Watching, IndexStatus::Ready);
        debug!("Watch worker for {} exited", self.watcher.root().display());
    }

    fn fail(&self, reason: &str) {
        error!(
            "Watching {} failed: {}",
            self.watcher.root().display(),
            reason
        );
        self.pipeline.set_watching(false);
        self.pipeline.tracker().fail(reason);
        self.pipeline.emitter().watch_failed(reason);
        self.token.cancel();
    }
}
