//! The incremental pass shared by every coordinator.
//!
//! A pass diffs the source's current resources against the recorded hashes:
//!
//! 1. Resources recorded but no longer enumerated lose their segments and
//!    their hash.
//! 2. Each enumerated resource is loaded and hashed (blake3 over the raw
//!    bytes, before any extraction). A matching hash means nothing to do.
//! 3. Dirty resources have their old segments removed, then are extracted,
//!    chunked and embedded. Only once the last batch of a resource is
//!    upserted does its new hash enter the in-memory map.
//! 4. The map replaces the stored state in one `batch_save` at the end, and
//!    every `save_every` dirty resources along the way.
//!
//! Every hash in the map therefore describes segments that are already in
//! the embedding store. A pass that dies early leaves dirty resources without
//! a recorded hash, and the next pass redoes them.

use super::CoordinatorContext;
use crate::error::{IndexError, Result};
use crate::events::EventEmitter;
use crate::extract::{ContentExtractor, Extraction, RawResource, SkipReason};
use crate::indexer::HybridIndexer;
use crate::progress::{IndexStatus, ProcessingStats, ProgressTracker};
use crate::segment::{SegmentBuilder, TextSegment};
use crate::source::SourceType;
use crate::storage::IndexStateStore;
use async_trait::async_trait;
use quarry_context::TextChunker;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Where a coordinator's resources come from.
#[async_trait]
pub trait ResourceSource: Send + Sync {
    /// Every resource identifier currently in the source.
    async fn enumerate(&self) -> Result<Vec<String>>;

    /// Load one resource's bytes, refusing oversized ones.
    async fn load(&self, id: &str) -> std::result::Result<RawResource, SkipReason>;
}

/// What indexing one resource did to its record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceOutcome {
    /// Hash matched; nothing touched
    Unchanged,
    /// Segments written; record the hash
    Indexed { hash: String, segments: usize },
    /// No text to embed (unsupported format or empty); record the hash so
    /// the resource is not retried until it changes
    Empty { hash: String },
    /// Old segments removed and no hash may be recorded
    Dropped { reason: SkipReason },
    /// The resource could not be read; its record is left as it was
    Kept { reason: SkipReason },
}

impl ResourceOutcome {
    /// Apply the outcome to a hash map being built by a pass.
    fn apply(&self, id: &str, hashes: &mut HashMap<String, String>) {
        match self {
            ResourceOutcome::Indexed { hash, .. } | ResourceOutcome::Empty { hash } => {
                hashes.insert(id.to_string(), hash.clone());
            }
            ResourceOutcome::Dropped { .. } => {
                hashes.remove(id);
            }
            ResourceOutcome::Unchanged | ResourceOutcome::Kept { .. } => {}
        }
    }

    fn is_dirty(&self) -> bool {
        !matches!(
            self,
            ResourceOutcome::Unchanged | ResourceOutcome::Kept { .. }
        )
    }

    fn count(&self, stats: &mut ProcessingStats) {
        match self {
            ResourceOutcome::Unchanged => stats.files_unchanged += 1,
            ResourceOutcome::Indexed { segments, .. } => {
                stats.files_indexed += 1;
                stats.segments_embedded += segments;
            }
            ResourceOutcome::Empty { .. } => stats.files_skipped += 1,
            ResourceOutcome::Dropped { .. } | ResourceOutcome::Kept { .. } => {
                stats.files_skipped += 1;
                stats.errors += 1;
            }
        }
    }
}

/// Content hash used for change detection.
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

pub struct IndexPipeline {
    project_id: String,
    source_type: SourceType,
    source: Arc<dyn ResourceSource>,
    states: Arc<dyn IndexStateStore>,
    extractor: Arc<dyn ContentExtractor>,
    chunker: Arc<TextChunker>,
    save_every: usize,
    tracker: ProgressTracker,
    emitter: EventEmitter,
    /// Held for the whole of a pass or a single-resource update, so one
    /// coordinator never writes its rows concurrently
    indexer: Mutex<HybridIndexer>,
    watching: AtomicBool,
    stats: std::sync::Mutex<ProcessingStats>,
}

impl IndexPipeline {
    pub fn new(
        ctx: &CoordinatorContext,
        source_type: SourceType,
        source: Arc<dyn ResourceSource>,
    ) -> Self {
        let indexer = HybridIndexer::new(
            ctx.provider.clone(),
            ctx.embeddings.clone(),
            ctx.project_id.clone(),
            source_type,
        )
        .with_batch_size(ctx.settings.segment_batch_size)
        .with_timeout(ctx.settings.embed_timeout);

        Self {
            project_id: ctx.project_id.clone(),
            source_type,
            source,
            states: ctx.states.clone(),
            extractor: ctx.extractor.clone(),
            chunker: Arc::new(TextChunker::new(ctx.settings.chunking)),
            save_every: ctx.settings.save_every,
            tracker: ProgressTracker::new(),
            emitter: EventEmitter::new(ctx.events.clone(), &ctx.project_id, source_type),
            indexer: Mutex::new(indexer),
            watching: AtomicBool::new(false),
            stats: std::sync::Mutex::new(ProcessingStats::default()),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub(crate) fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    /// Counters of the most recent pass.
    pub fn stats(&self) -> ProcessingStats {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Mark whether a watch is running, which decides the status a
    /// successful pass ends in.
    pub(crate) fn set_watching(&self, watching: bool) {
        self.watching.store(watching, Ordering::SeqCst);
    }

    pub(crate) fn is_watching(&self) -> bool {
        self.watching.load(Ordering::SeqCst)
    }

    /// Run one full pass. Returns whether it completed.
    pub async fn run_pass(&self) -> bool {
        let mut indexer = self.indexer.lock().await;
        indexer.discard_batch();

        self.tracker.start_pass(0);
        self.emitter.started();
        info!(
            project = %self.project_id,
            source = %self.source_type,
            "Starting index pass"
        );

        let mut stats = ProcessingStats::default();
        let result = self.pass(&mut indexer, &mut stats).await;
        *self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = stats.clone();

        match result {
            Ok(()) => {
                let status = if self.is_watching() {
                    IndexStatus::Watching
                } else {
                    IndexStatus::Ready
                };
                self.tracker.set_status(status);
                self.emitter.completed();
                info!(
                    project = %self.project_id,
                    source = %self.source_type,
                    indexed = stats.files_indexed,
                    unchanged = stats.files_unchanged,
                    removed = stats.files_removed,
                    skipped = stats.files_skipped,
                    segments = stats.segments_embedded,
                    "Index pass completed"
                );
                true
            }
            Err(e) => {
                error!(
                    project = %self.project_id,
                    source = %self.source_type,
                    "Index pass failed: {}",
                    e
                );
                self.tracker.fail(e.to_string());
                self.emitter.failed(e.to_string());
                false
            }
        }
    }

    async fn pass(&self, indexer: &mut HybridIndexer, stats: &mut ProcessingStats) -> Result<()> {
        let resources = self.source.enumerate().await?;
        let total = resources.len();
        self.tracker.set_total(total);

        let stored = self
            .states
            .hashes_for_source(&self.project_id, self.source_type)
            .await
            .map_err(IndexError::persistence)?;
        let mut hashes = stored.clone();
        let mut dirty = 0usize;

        let current: HashSet<&str> = resources.iter().map(String::as_str).collect();
        for removed in stored.keys().filter(|k| !current.contains(k.as_str())) {
            indexer.remove_file_from_index(removed).await?;
            hashes.remove(removed);
            stats.files_removed += 1;
            dirty += 1;
            debug!("Removed {} from the index", removed);
        }

        for (i, id) in resources.iter().enumerate() {
            let previous = hashes.get(id).cloned();
            let outcome = match self.index_resource(indexer, id, previous.as_deref()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Whatever was recorded so far is backed by segments
                    hashes.remove(id);
                    self.checkpoint(&hashes).await.ok();
                    return Err(e);
                }
            };
            if let ResourceOutcome::Dropped { reason } | ResourceOutcome::Kept { reason } =
                &outcome
            {
                warn!("Skipping {}: {}", id, reason);
            }
            outcome.count(stats);
            outcome.apply(id, &mut hashes);
            if outcome.is_dirty() {
                dirty += 1;
            }

            self.tracker.set_processed(i + 1);
            self.emitter.in_progress(i + 1, total);

            if self.save_every > 0 && dirty >= self.save_every {
                self.checkpoint(&hashes).await?;
                dirty = 0;
            }
        }

        self.checkpoint(&hashes).await
    }

    async fn checkpoint(&self, hashes: &HashMap<String, String>) -> Result<()> {
        self.states
            .batch_save(&self.project_id, hashes, self.source_type)
            .await
            .map_err(|e| {
                error!("Failed to save index state: {}", e);
                IndexError::persistence(e)
            })
    }

    /// Bring one resource's segments in line with its current content.
    ///
    /// On an embedding or vector store error the resource's segments are
    /// removed (best effort) before the error is returned, so no partial
    /// set of segments is left behind for a resource without a hash.
    pub(crate) async fn index_resource(
        &self,
        indexer: &mut HybridIndexer,
        id: &str,
        previous: Option<&str>,
    ) -> Result<ResourceOutcome> {
        let resource = match self.source.load(id).await {
            Ok(resource) => resource,
            Err(reason @ SkipReason::Unreadable(_)) => {
                return Ok(ResourceOutcome::Kept { reason });
            }
            Err(reason) => {
                indexer.remove_file_from_index(id).await?;
                return Ok(ResourceOutcome::Dropped { reason });
            }
        };

        let hash = content_hash(&resource.bytes);
        if previous == Some(hash.as_str()) {
            return Ok(ResourceOutcome::Unchanged);
        }

        indexer.remove_file_from_index(id).await?;

        let segments = match self.extract_segments(resource).await {
            Ok(segments) => segments,
            Err(SkipReason::Unsupported(kind)) => {
                debug!("No extractor for {} ({})", id, kind);
                return Ok(ResourceOutcome::Empty { hash });
            }
            Err(reason) => return Ok(ResourceOutcome::Dropped { reason }),
        };
        if segments.is_empty() {
            return Ok(ResourceOutcome::Empty { hash });
        }

        let count = segments.len();
        match self.embed_segments(indexer, id, segments).await {
            Ok(()) => Ok(ResourceOutcome::Indexed {
                hash,
                segments: count,
            }),
            Err(e) => {
                indexer.discard_batch();
                if let Err(cleanup) = indexer.remove_file_from_index(id).await {
                    warn!("Cleanup of {} after failure also failed: {}", id, cleanup);
                }
                Err(e)
            }
        }
    }

    async fn embed_segments(
        &self,
        indexer: &mut HybridIndexer,
        id: &str,
        segments: Vec<TextSegment>,
    ) -> Result<()> {
        for segment in segments {
            indexer.add_segment_to_batch(segment, id).await?;
        }
        indexer.flush_remaining_segments().await?;
        Ok(())
    }

    /// Extract and chunk on a blocking thread. A panicking decoder counts as
    /// a malformed resource.
    async fn extract_segments(
        &self,
        resource: RawResource,
    ) -> std::result::Result<Vec<TextSegment>, SkipReason> {
        let extractor = self.extractor.clone();
        let chunker = self.chunker.clone();
        let builder = SegmentBuilder::new(&self.project_id, self.source_type, &resource.id);

        tokio::task::spawn_blocking(move || {
            let text_like = extractor.is_text_like(&resource);
            match extractor.extract(&resource) {
                Extraction::Text(text) if text_like => {
                    Ok(builder.from_line_chunks(chunker.chunk_with_line_tracking(&text)))
                }
                Extraction::Text(text) => Ok(builder.from_chunks(chunker.chunk(&text))),
                Extraction::Skipped(reason) => Err(reason),
            }
        })
        .await
        .unwrap_or_else(|e| Err(SkipReason::Malformed(format!("extraction task failed: {e}"))))
    }

    /// Re-index a single resource and record the result with a single-row
    /// update, leaving sibling rows untouched.
    pub async fn update_resource(&self, id: &str) -> Result<ResourceOutcome> {
        let mut indexer = self.indexer.lock().await;
        let previous = self
            .states
            .hashes_for_source(&self.project_id, self.source_type)
            .await
            .map_err(IndexError::persistence)?
            .remove(id);

        let outcome = match self.index_resource(&mut indexer, id, previous.as_deref()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // Segments are gone; drop the record so the next pass retries
                self.forget(id).await.ok();
                return Err(e);
            }
        };

        match &outcome {
            ResourceOutcome::Indexed { hash, .. } | ResourceOutcome::Empty { hash } => {
                self.states
                    .save_file_hash(&self.project_id, self.source_type, id, hash)
                    .await
                    .map_err(IndexError::persistence)?;
            }
            ResourceOutcome::Dropped { .. } => self.forget(id).await?,
            ResourceOutcome::Unchanged | ResourceOutcome::Kept { .. } => {}
        }
        Ok(outcome)
    }

    /// Remove a single resource's segments, then its record.
    pub async fn remove_resource(&self, id: &str) -> Result<usize> {
        let indexer = self.indexer.lock().await;
        let removed = indexer.remove_file_from_index(id).await?;
        self.forget(id).await?;
        Ok(removed)
    }

    /// Recorded resource ids at or below `dir`, sorted.
    pub async fn recorded_under(&self, dir: &Path) -> Result<Vec<String>> {
        let mut ids = self
            .states
            .hashes_for_source(&self.project_id, self.source_type)
            .await
            .map_err(IndexError::persistence)?
            .into_keys()
            .filter(|id| Path::new(id).starts_with(dir))
            .collect::<Vec<_>>();
        ids.sort();
        Ok(ids)
    }

    async fn forget(&self, id: &str) -> Result<()> {
        self.states
            .remove_file_hash(&self.project_id, self.source_type, id)
            .await
            .map_err(IndexError::persistence)?;
        Ok(())
    }

    /// Remove every segment and record this pipeline's source owns.
    pub async fn clear(&self) -> Result<usize> {
        let indexer = self.indexer.lock().await;
        let removed = indexer.clear_source().await?;
        self.states
            .batch_save(&self.project_id, &HashMap::new(), self.source_type)
            .await
            .map_err(IndexError::persistence)?;
        Ok(removed)
    }
}
