//! Indexing coordinators, one per knowledge source.
//!
//! A coordinator owns the full-pass algorithm for its source and the
//! lifecycle of an optional live watch:
//!
//! ```text
//! NOT_STARTED ──start_indexing──▶ INDEXING ──▶ READY ──start_watching──▶ WATCHING
//!                                     │                                   │
//!                                     └──────────▶ FAILED ◀───────────────┘
//! ```
//!
//! `FAILED` sticks until `start_indexing` is called again. Watching requires a
//! completed pass, so the watcher's incremental updates always start from a
//! consistent baseline.

pub mod local_folder;
pub mod pipeline;
pub mod registry;
pub mod url;

use crate::config::QuarryConfig;
use crate::error::Result;
use crate::events::EventBus;
use crate::extract::{ContentExtractor, DocumentExtractor};
use crate::progress::IndexProgress;
use crate::source::SourceType;
use crate::storage::{EmbeddingStore, IndexStateStore};
use async_trait::async_trait;
use quarry_context::ChunkingConfig;
use quarry_embed::EmbeddingProvider;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub use local_folder::LocalFolderCoordinator;
pub use pipeline::{IndexPipeline, ResourceOutcome, ResourceSource};
pub use registry::CoordinatorRegistry;
pub use url::UrlCoordinator;

#[async_trait]
pub trait IndexingCoordinator: Send + Sync {
    fn source_type(&self) -> SourceType;

    /// Snapshot of the current progress.
    fn progress(&self) -> IndexProgress;

    /// Receiver that observes every progress change.
    fn subscribe(&self) -> watch::Receiver<IndexProgress>;

    /// Run a full incremental pass. Returns whether it completed; the failure
    /// reason is in `progress().error`.
    async fn start_indexing(&self) -> bool;

    /// Begin live updates. Fails with `NotReady` unless a pass has completed.
    /// Calling it while already watching does nothing. Cancelling `scope`
    /// stops the watch as if [`stop_watching`](Self::stop_watching) had been
    /// called.
    async fn start_watching(&self, scope: &CancellationToken) -> Result<()>;

    /// Stop live updates and wait for the worker to exit. Safe to call when
    /// not watching.
    async fn stop_watching(&self);

    /// Stop watching and release the coordinator.
    async fn close(&self);
}

/// Tunables of the per-resource pipeline.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub chunking: ChunkingConfig,
    pub segment_batch_size: usize,
    pub embed_timeout: Duration,
    pub max_file_bytes: u64,
    /// Checkpoint after this many dirty resources; 0 saves only at the end
    pub save_every: usize,
    pub debounce: Duration,
    pub channel_capacity: usize,
    pub poll_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            segment_batch_size: 32,
            embed_timeout: Duration::from_secs(30),
            max_file_bytes: 10 * 1024 * 1024,
            save_every: 200,
            debounce: Duration::from_millis(500),
            channel_capacity: 1024,
            poll_interval: Duration::from_secs(300),
        }
    }
}

impl PipelineSettings {
    /// Settings for a configured project, sizing chunks to the provider's
    /// input budget.
    pub fn from_config(config: &QuarryConfig, provider: &dyn EmbeddingProvider) -> Self {
        Self {
            chunking: config
                .chunking
                .chunking_config(provider.max_input_tokens()),
            segment_batch_size: config.indexing.segment_batch_size,
            embed_timeout: config.embedding.timeout(),
            max_file_bytes: config.indexing.max_file_bytes,
            save_every: config.indexing.save_every,
            debounce: config.watch.debounce(),
            channel_capacity: config.watch.channel_capacity,
            poll_interval: config.watch.poll_interval(),
        }
    }
}

/// Handles every coordinator of a project is built from. The stores are
/// shared across coordinators; each only touches rows scoped by its own
/// project and source type.
#[derive(Clone)]
pub struct CoordinatorContext {
    pub project_id: String,
    pub provider: Arc<dyn EmbeddingProvider>,
    pub embeddings: Arc<dyn EmbeddingStore>,
    pub states: Arc<dyn IndexStateStore>,
    pub extractor: Arc<dyn ContentExtractor>,
    pub events: EventBus,
    pub settings: PipelineSettings,
}

impl CoordinatorContext {
    pub fn new(
        project_id: impl Into<String>,
        provider: Arc<dyn EmbeddingProvider>,
        embeddings: Arc<dyn EmbeddingStore>,
        states: Arc<dyn IndexStateStore>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            provider,
            embeddings,
            states,
            extractor: Arc::new(DocumentExtractor::new()),
            events: EventBus::default(),
            settings: PipelineSettings::default(),
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn ContentExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }
}
