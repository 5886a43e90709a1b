//! Coordinator for local folder sources.

use super::pipeline::{IndexPipeline, ResourceSource};
use super::{CoordinatorContext, IndexingCoordinator};
use crate::error::{IndexError, Result};
use crate::extract::{RawResource, SkipReason, read_bounded};
use crate::filter::PathFilter;
use crate::handler::FileChangeHandler;
use crate::progress::{IndexProgress, IndexStatus};
use crate::source::SourceType;
use crate::watcher::{FileWatcher, WatchWorker};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Enumerates files under a set of roots.
pub struct FolderSource {
    roots: Vec<PathBuf>,
    filter: Arc<PathFilter>,
    max_file_bytes: u64,
}

impl FolderSource {
    pub fn new(roots: Vec<PathBuf>, filter: Arc<PathFilter>, max_file_bytes: u64) -> Self {
        Self {
            roots,
            filter,
            max_file_bytes,
        }
    }

    fn walk(roots: &[PathBuf], filter: Arc<PathFilter>) -> Result<Vec<String>> {
        let mut files = Vec::new();
        for root in roots {
            // A missing root must fail the pass rather than look like every
            // file under it was deleted
            if !root.is_dir() {
                return Err(IndexError::config(format!(
                    "folder {} does not exist",
                    root.display()
                )));
            }
            files.extend(walk_tree(root, filter.clone()));
        }
        files.sort();
        files.dedup();
        Ok(files)
    }
}

/// Files under `dir` the filter accepts. `dir` itself is not checked.
pub(crate) fn walk_tree(dir: &Path, filter: Arc<PathFilter>) -> Vec<String> {
    let walker = ignore::WalkBuilder::new(dir)
        .hidden(false)
        .follow_links(false)
        .filter_entry(move |entry| {
            let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
            entry.depth() == 0 || !filter.is_excluded(entry.path(), is_dir)
        })
        .build();

    let mut files = Vec::new();
    for entry in walker {
        match entry {
            Ok(entry) if entry.file_type().is_some_and(|t| t.is_file()) => {
                files.push(entry.path().to_string_lossy().into_owned());
            }
            Ok(_) => {}
            Err(e) => warn!("Skipping unreadable entry under {}: {}", dir.display(), e),
        }
    }
    files
}

#[async_trait]
impl ResourceSource for FolderSource {
    async fn enumerate(&self) -> Result<Vec<String>> {
        let roots = self.roots.clone();
        let filter = self.filter.clone();
        tokio::task::spawn_blocking(move || Self::walk(&roots, filter))
            .await
            .map_err(|e| IndexError::Io {
                source: std::io::Error::other(e),
            })?
    }

    async fn load(&self, id: &str) -> std::result::Result<RawResource, SkipReason> {
        let bytes = read_bounded(Path::new(id), self.max_file_bytes).await?;
        Ok(RawResource::new(id, bytes))
    }
}

struct WatchSession {
    token: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl WatchSession {
    fn is_finished(&self) -> bool {
        self.workers.iter().all(|w| w.is_finished())
    }
}

pub struct LocalFolderCoordinator {
    pipeline: Arc<IndexPipeline>,
    filter: Arc<PathFilter>,
    debounce: Duration,
    channel_capacity: usize,
    session: Mutex<Option<WatchSession>>,
}

impl LocalFolderCoordinator {
    pub fn new(ctx: &CoordinatorContext, roots: Vec<PathBuf>, filter: PathFilter) -> Self {
        let filter = Arc::new(filter);
        let source = FolderSource::new(roots, filter.clone(), ctx.settings.max_file_bytes);
        Self {
            pipeline: Arc::new(IndexPipeline::new(
                ctx,
                SourceType::LocalFolders,
                Arc::new(source),
            )),
            filter,
            debounce: ctx.settings.debounce,
            channel_capacity: ctx.settings.channel_capacity,
            session: Mutex::new(None),
        }
    }

    pub fn pipeline(&self) -> &Arc<IndexPipeline> {
        &self.pipeline
    }

    /// A handler applying single changes through this coordinator's pipeline.
    pub fn change_handler(&self) -> FileChangeHandler {
        FileChangeHandler::new(self.pipeline.clone(), self.filter.clone())
    }

    async fn stop_session(session: WatchSession) {
        session.token.cancel();
        for worker in session.workers {
            if let Err(e) = worker.await {
                warn!("Watch worker ended abnormally: {}", e);
            }
        }
    }
}

#[async_trait]
impl IndexingCoordinator for LocalFolderCoordinator {
    fn source_type(&self) -> SourceType {
        SourceType::LocalFolders
    }

    fn progress(&self) -> IndexProgress {
        self.pipeline.tracker().get()
    }

    fn subscribe(&self) -> watch::Receiver<IndexProgress> {
        self.pipeline.tracker().subscribe()
    }

    async fn start_indexing(&self) -> bool {
        self.pipeline.run_pass().await
    }

    async fn start_watching(&self, scope: &CancellationToken) -> Result<()> {
        let mut session = self.session.lock().await;
        if let Some(existing) = session.as_ref() {
            if !existing.is_finished() {
                debug!("Already watching; ignoring start_watching");
                return Ok(());
            }
        }
        // A worker that ended on its own leaves its session behind
        if let Some(stale) = session.take() {
            Self::stop_session(stale).await;
        }

        let status = self.pipeline.tracker().status();
        if !status.has_baseline() {
            return Err(IndexError::NotReady {
                status: status.to_string(),
            });
        }

        let mut watchers = Vec::new();
        for root in self.filter.roots() {
            watchers.push(FileWatcher::start(
                root,
                self.debounce,
                self.channel_capacity,
            )?);
        }

        let token = scope.child_token();
        let handler = Arc::new(self.change_handler());
        self.pipeline.set_watching(true);
        self.pipeline
            .tracker()
            .transition(IndexStatus::Ready, IndexStatus::Watching);

        let workers = watchers
            .into_iter()
            .map(|watcher| {
                tokio::spawn(
                    WatchWorker {
                        watcher,
                        handler: handler.clone(),
                        pipeline: self.pipeline.clone(),
                        token: token.clone(),
                    }
                    .run(),
                )
            })
            .collect();

        info!(
            project = %self.pipeline.project_id(),
            roots = self.filter.roots().len(),
            "Started watching"
        );
        *session = Some(WatchSession { token, workers });
        Ok(())
    }

    async fn stop_watching(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            Self::stop_session(session).await;
            info!(project = %self.pipeline.project_id(), "Stopped watching");
        }
    }

    async fn close(&self) {
        self.stop_watching().await;
    }
}
