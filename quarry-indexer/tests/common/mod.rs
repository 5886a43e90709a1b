#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use half::f16;
use quarry_context::ChunkingConfig;
use quarry_embed::{EmbedError, EmbeddingProvider, EmbeddingResult};
use quarry_indexer::coordinator::{CoordinatorContext, LocalFolderCoordinator, PipelineSettings};
use quarry_indexer::events::EventBus;
use quarry_indexer::extract::{ContentExtractor, DocumentExtractor, Extraction, RawResource};
use quarry_indexer::filter::PathFilter;
use quarry_indexer::segment::keys;
use quarry_indexer::source::SourceType;
use quarry_indexer::storage::{
    IndexFileState, IndexStateStore, InMemoryEmbeddingStore, InMemoryIndexStateStore, VectorEntry,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

pub const PROJECT: &str = "test-project";

/// Deterministic provider that counts what it embeds.
#[derive(Default)]
pub struct CountingProvider {
    pub calls: AtomicUsize,
    pub texts: AtomicUsize,
    pub fail: AtomicBool,
}

impl CountingProvider {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn texts(&self) -> usize {
        self.texts.load(Ordering::SeqCst)
    }

    pub fn vector_for(text: &str) -> Vec<f16> {
        let bytes = text.as_bytes();
        let sum: u32 = bytes.iter().map(|&b| b as u32).sum();
        vec![
            f16::from_f32(bytes.len() as f32 % 97.0),
            f16::from_f32((sum % 89) as f32),
            f16::from_f32(bytes.first().copied().unwrap_or(0) as f32),
            f16::ONE,
        ]
    }
}

#[async_trait]
impl EmbeddingProvider for CountingProvider {
    async fn embed_texts(&self, texts: &[String]) -> quarry_embed::Result<EmbeddingResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(EmbedError::External {
                source: anyhow::anyhow!("model crashed"),
            });
        }
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(EmbeddingResult::new(
            texts.iter().map(|t| Self::vector_for(t)).collect(),
        ))
    }

    fn embedding_dimension(&self) -> usize {
        4
    }

    fn max_input_tokens(&self) -> usize {
        64
    }

    fn provider_name(&self) -> &str {
        "counting"
    }
}

/// State store whose operations can be made to fail on demand.
#[derive(Default)]
pub struct FlakyStateStore {
    pub inner: InMemoryIndexStateStore,
    pub fail_saves: AtomicBool,
    pub fail_reads: AtomicBool,
}

impl FlakyStateStore {
    fn check(flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            anyhow::bail!("disk I/O error");
        }
        Ok(())
    }
}

#[async_trait]
impl IndexStateStore for FlakyStateStore {
    async fn hashes_for_source(
        &self,
        project_id: &str,
        source_type: SourceType,
    ) -> Result<HashMap<String, String>> {
        Self::check(&self.fail_reads)?;
        self.inner.hashes_for_source(project_id, source_type).await
    }

    async fn batch_save(
        &self,
        project_id: &str,
        file_hashes: &HashMap<String, String>,
        source_type: SourceType,
    ) -> Result<()> {
        Self::check(&self.fail_saves)?;
        self.inner
            .batch_save(project_id, file_hashes, source_type)
            .await
    }

    async fn save_file_hash(
        &self,
        project_id: &str,
        source_type: SourceType,
        file_path: &str,
        file_hash: &str,
    ) -> Result<()> {
        Self::check(&self.fail_saves)?;
        self.inner
            .save_file_hash(project_id, source_type, file_path, file_hash)
            .await
    }

    async fn remove_file_hash(
        &self,
        project_id: &str,
        source_type: SourceType,
        file_path: &str,
    ) -> Result<bool> {
        Self::check(&self.fail_saves)?;
        self.inner
            .remove_file_hash(project_id, source_type, file_path)
            .await
    }

    async fn clear_project(&self, project_id: &str) -> Result<usize> {
        self.inner.clear_project(project_id).await
    }

    async fn list_states(&self, project_id: &str) -> Result<Vec<IndexFileState>> {
        self.inner.list_states(project_id).await
    }
}

/// Treats any `.pdf` as a document whose text is known, so binary fixtures
/// can stand in for real PDFs.
pub struct StubPdfExtractor;

impl ContentExtractor for StubPdfExtractor {
    fn is_text_like(&self, resource: &RawResource) -> bool {
        !resource.id.ends_with(".pdf") && DocumentExtractor.is_text_like(resource)
    }

    fn extract(&self, resource: &RawResource) -> Extraction {
        if resource.id.ends_with(".pdf") {
            return Extraction::Text(format!(
                "Extracted PDF text ({} bytes)",
                resource.bytes.len()
            ));
        }
        DocumentExtractor.extract(resource)
    }
}

/// A project folder with in-memory stores and a counting provider.
pub struct Fixture {
    pub dir: TempDir,
    pub root: PathBuf,
    pub provider: Arc<CountingProvider>,
    pub embeddings: Arc<InMemoryEmbeddingStore>,
    pub states: Arc<FlakyStateStore>,
    pub events: EventBus,
    pub settings: PipelineSettings,
}

impl Fixture {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().canonicalize()?;
        let settings = PipelineSettings {
            chunking: ChunkingConfig::new(200, 40),
            segment_batch_size: 4,
            debounce: Duration::from_millis(100),
            ..PipelineSettings::default()
        };
        Ok(Self {
            dir,
            root,
            provider: Arc::new(CountingProvider::default()),
            embeddings: Arc::new(InMemoryEmbeddingStore::new()),
            states: Arc::new(FlakyStateStore::default()),
            events: EventBus::default(),
            settings,
        })
    }

    pub fn context(&self) -> CoordinatorContext {
        CoordinatorContext::new(
            PROJECT,
            self.provider.clone(),
            self.embeddings.clone(),
            self.states.clone(),
        )
        .with_events(self.events.clone())
        .with_extractor(Arc::new(StubPdfExtractor))
        .with_settings(self.settings)
    }

    pub fn coordinator(&self) -> LocalFolderCoordinator {
        LocalFolderCoordinator::new(
            &self.context(),
            vec![self.root.clone()],
            PathFilter::permissive(&[self.root.clone()]),
        )
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Resource id of a file under the root.
    pub fn id(&self, rel: &str) -> String {
        self.path(rel).to_string_lossy().into_owned()
    }

    pub fn write(&self, rel: &str, contents: impl AsRef<[u8]>) -> Result<()> {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn remove(&self, rel: &str) -> Result<()> {
        std::fs::remove_file(self.path(rel))?;
        Ok(())
    }

    pub fn entries_for(&self, rel: &str) -> Vec<VectorEntry> {
        let id = self.id(rel);
        self.embeddings
            .entries()
            .into_iter()
            .filter(|e| e.metadata.get(keys::FILE_PATH) == Some(&id))
            .collect()
    }

    pub async fn hashes(&self) -> Result<HashMap<String, String>> {
        self.states
            .inner
            .hashes_for_source(PROJECT, SourceType::LocalFolders)
            .await
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

pub fn lines(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}
