//! Applies single filesystem changes to the index.

use crate::coordinator::local_folder::walk_tree;
use crate::coordinator::{IndexPipeline, ResourceOutcome};
use crate::error::{IndexError, Result};
use crate::filter::PathFilter;
use crate::watcher::{ChangeKind, FileChange};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a change did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// Outside the roots or excluded by the filter
    Ignored,
    Removed { segments: usize },
    Updated(ResourceOutcome),
    /// A directory appeared or changed; counts files re-indexed and segments
    /// removed below it
    Synced { indexed: usize, removed: usize },
}

pub struct FileChangeHandler {
    pipeline: Arc<IndexPipeline>,
    filter: Arc<PathFilter>,
}

impl FileChangeHandler {
    pub fn new(pipeline: Arc<IndexPipeline>, filter: Arc<PathFilter>) -> Self {
        Self { pipeline, filter }
    }

    pub async fn handle(&self, change: &FileChange) -> Result<ChangeOutcome> {
        self.handle_file_change(&change.path, change.kind).await
    }

    /// Update the index for one path.
    ///
    /// A create or modify for a path that no longer exists is handled as a
    /// delete; the debouncer can merge a modify and a later removal into the
    /// modify alone. Directories moved in or out of a root arrive as a single
    /// event for the directory, so they apply to everything below it.
    pub async fn handle_file_change(&self, path: &Path, kind: ChangeKind) -> Result<ChangeOutcome> {
        if !self.filter.covers(path) {
            return Ok(ChangeOutcome::Ignored);
        }
        let id = path.to_string_lossy();

        let metadata = tokio::fs::metadata(path).await.ok();
        match metadata {
            Some(m) if kind != ChangeKind::Delete && m.is_dir() => {
                if self.filter.is_excluded(path, true) {
                    debug!("Ignoring change to excluded directory {}", id);
                    return Ok(ChangeOutcome::Ignored);
                }
                self.sync_directory(path).await
            }
            Some(m) if kind != ChangeKind::Delete && m.is_file() => {
                if !self.filter.accepts_file(path) {
                    debug!("Ignoring change to excluded path {}", id);
                    return Ok(ChangeOutcome::Ignored);
                }

                let outcome = self.pipeline.update_resource(&id).await?;
                match &outcome {
                    ResourceOutcome::Indexed { segments, .. } => {
                        info!(segments, "Re-indexed {}", id);
                    }
                    other => debug!("Change to {} gave {:?}", id, other),
                }
                Ok(ChangeOutcome::Updated(outcome))
            }
            _ => {
                let mut ids = self.pipeline.recorded_under(path).await?;
                if ids.is_empty() {
                    ids.push(id.into_owned());
                }
                let mut segments = 0;
                for id in &ids {
                    segments += self.pipeline.remove_resource(id).await?;
                }
                if segments > 0 {
                    info!(segments, "Removed {} from the index", path.display());
                }
                Ok(ChangeOutcome::Removed { segments })
            }
        }
    }

    /// Index every accepted file below `dir` and drop records of files that
    /// are no longer there. Keeps going past a failing file and returns the
    /// first error once the rest are done.
    async fn sync_directory(&self, dir: &Path) -> Result<ChangeOutcome> {
        let walk_dir = dir.to_path_buf();
        let filter = self.filter.clone();
        let files = tokio::task::spawn_blocking(move || walk_tree(&walk_dir, filter))
            .await
            .map_err(|e| IndexError::Io {
                source: std::io::Error::other(e),
            })?;

        let present = files.iter().map(String::as_str).collect::<HashSet<_>>();
        let mut first_error = None;
        let mut removed = 0;
        for stale in self.pipeline.recorded_under(dir).await? {
            if !present.contains(stale.as_str()) {
                removed += self.pipeline.remove_resource(&stale).await?;
            }
        }

        let mut indexed = 0;
        for file in &files {
            match self.pipeline.update_resource(file).await {
                Ok(ResourceOutcome::Indexed { .. }) => indexed += 1,
                Ok(_) => {}
                Err(e) => {
                    warn!("Failed to index {}: {}", file, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        info!(indexed, removed, "Synced directory {}", dir.display());

        match first_error {
            Some(e) => Err(e),
            None => Ok(ChangeOutcome::Synced { indexed, removed }),
        }
    }
}
