//! Segment batching, embedding and vector-store upserts.

use crate::error::{IndexError, Result};
use crate::segment::{TextSegment, keys};
use crate::source::SourceType;
use crate::storage::{EmbeddingStore, MetadataFilter, VectorEntry};
use quarry_embed::{EmbedError, EmbeddingProvider};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Turns segments into vector entries.
///
/// Segments accumulate until `batch_size` are pending, then one embedding
/// call covers the whole batch. A batch is all or nothing: if the embedding
/// call fails, times out or the upsert fails, none of its segments are written
/// and the batch is discarded.
pub struct HybridIndexer {
    provider: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn EmbeddingStore>,
    project_id: String,
    source_type: SourceType,
    batch_size: usize,
    timeout: Duration,
    batch: Vec<TextSegment>,
    batch_sources: BTreeSet<String>,
}

impl HybridIndexer {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn EmbeddingStore>,
        project_id: impl Into<String>,
        source_type: SourceType,
    ) -> Self {
        Self {
            provider,
            store,
            project_id: project_id.into(),
            source_type,
            batch_size: 32,
            timeout: Duration::from_secs(30),
            batch: Vec::new(),
            batch_sources: BTreeSet::new(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Upper bound on a single embedding call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn EmbeddingStore> {
        &self.store
    }

    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    /// Queue a segment of `source_identifier`, flushing once the batch is
    /// full. Returns how many segments were written by this call.
    pub async fn add_segment_to_batch(
        &mut self,
        segment: TextSegment,
        source_identifier: &str,
    ) -> Result<usize> {
        if !self.batch_sources.contains(source_identifier) {
            self.batch_sources.insert(source_identifier.to_string());
        }
        self.batch.push(segment);

        if self.batch.len() >= self.batch_size {
            self.flush_remaining_segments().await
        } else {
            Ok(0)
        }
    }

    /// Embed and upsert whatever is pending. Returns how many segments were
    /// written.
    pub async fn flush_remaining_segments(&mut self) -> Result<usize> {
        if self.batch.is_empty() {
            return Ok(0);
        }

        let batch = std::mem::take(&mut self.batch);
        let sources = std::mem::take(&mut self.batch_sources);
        let count = batch.len();

        match self.embed_and_upsert(batch).await {
            Ok(()) => {
                debug!(segments = count, "Flushed segment batch");
                Ok(count)
            }
            Err(e) => {
                warn!(
                    segments = count,
                    sources = ?sources,
                    "Segment batch failed: {}",
                    e
                );
                Err(e)
            }
        }
    }

    /// Drop pending segments without writing them.
    pub fn discard_batch(&mut self) {
        self.batch.clear();
        self.batch_sources.clear();
    }

    async fn embed_and_upsert(&self, batch: Vec<TextSegment>) -> Result<()> {
        let texts: Vec<String> = batch.iter().map(|s| s.text.clone()).collect();

        let result = tokio::time::timeout(self.timeout, self.provider.embed_texts(&texts))
            .await
            .map_err(|_| EmbedError::Timeout {
                seconds: self.timeout.as_secs(),
            })??;
        if result.embeddings.len() != batch.len() {
            return Err(EmbedError::CountMismatch {
                expected: batch.len(),
                actual: result.embeddings.len(),
            }
            .into());
        }

        let entries = batch
            .into_iter()
            .zip(result.embeddings)
            .map(|(segment, vector)| VectorEntry {
                id: segment.vector_id(),
                vector,
                text: segment.text,
                metadata: segment.metadata,
            })
            .collect();
        self.store
            .upsert(entries)
            .await
            .map_err(IndexError::vector_store)
    }

    fn file_filter(&self, source_identifier: &str) -> MetadataFilter {
        MetadataFilter::new()
            .eq(keys::PROJECT_ID, &self.project_id)
            .eq(keys::SOURCE_TYPE, self.source_type.as_str())
            .eq(keys::FILE_PATH, source_identifier)
    }

    /// Delete every vector entry of one file. Idempotent.
    pub async fn remove_file_from_index(&self, source_identifier: &str) -> Result<usize> {
        let removed = self
            .store
            .delete_where(&self.file_filter(source_identifier))
            .await
            .map_err(IndexError::vector_store)?;
        if removed > 0 {
            debug!(removed, "Removed segments of {}", source_identifier);
        }
        Ok(removed)
    }

    /// Delete every vector entry this indexer's project and source type own.
    pub async fn clear_source(&self) -> Result<usize> {
        let filter = MetadataFilter::new()
            .eq(keys::PROJECT_ID, &self.project_id)
            .eq(keys::SOURCE_TYPE, self.source_type.as_str());
        self.store
            .delete_where(&filter)
            .await
            .map_err(IndexError::vector_store)
    }
}
