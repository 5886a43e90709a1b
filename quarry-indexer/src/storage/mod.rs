//! Storage abstractions for the indexer.
//!
//! Two stores back every project:
//!
//! - **EmbeddingStore**: vectors plus their segment text and flat metadata.
//!   Supports upsert by id, delete by metadata filter and similarity search.
//! - **IndexStateStore**: `(project, source type, file path) -> content hash`,
//!   the change-detection ledger consulted by every index pass.
//!
//! ```text
//! IndexStateStore ── SqliteIndexStateStore / InMemoryIndexStateStore
//! EmbeddingStore  ── SqliteEmbeddingStore  / InMemoryEmbeddingStore
//! ```
//!
//! The two stores are updated in lockstep by the coordinators: segments are
//! upserted before a hash is recorded, and removed before a hash is dropped.
//! Both SQLite stores can share one database file.

use crate::source::SourceType;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use half::f16;
use serde::Serialize;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

pub mod memory;
pub mod sqlite_state;
pub mod sqlite_vectors;

pub use memory::{InMemoryEmbeddingStore, InMemoryIndexStateStore};
pub use sqlite_state::SqliteIndexStateStore;
pub use sqlite_vectors::SqliteEmbeddingStore;

/// One vector and the segment it was computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorEntry {
    pub id: String,
    pub vector: Vec<f16>,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    /// Cosine similarity to the query
    pub score: f32,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
}

/// Conjunction of metadata equalities. An empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFilter {
    equals: BTreeMap<String, String>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.equals.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.equals.is_empty()
    }

    pub fn conditions(&self) -> impl Iterator<Item = (&str, &str)> {
        self.equals.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn matches(&self, metadata: &BTreeMap<String, String>) -> bool {
        self.equals
            .iter()
            .all(|(k, v)| metadata.get(k).is_some_and(|m| m == v))
    }
}

/// Vector storage and similarity search.
#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    /// Insert entries, replacing any existing entry with the same id.
    /// Either every entry is written or none is.
    async fn upsert(&self, entries: Vec<VectorEntry>) -> Result<()>;

    /// Delete every entry whose metadata matches, returning how many went.
    async fn delete_where(&self, filter: &MetadataFilter) -> Result<usize>;

    /// Top `k` entries by cosine similarity, best first.
    async fn search(
        &self,
        query: &[f16],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>>;

    async fn count(&self, filter: Option<&MetadataFilter>) -> Result<usize>;
}

/// A recorded content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexFileState {
    pub project_id: String,
    pub source_type: SourceType,
    pub file_path: String,
    pub file_hash: String,
    pub indexed_at: DateTime<Utc>,
}

/// Persistent change-detection ledger.
#[async_trait]
pub trait IndexStateStore: Send + Sync {
    /// Every recorded `file path -> hash` for one source of a project.
    async fn hashes_for_source(
        &self,
        project_id: &str,
        source_type: SourceType,
    ) -> Result<HashMap<String, String>>;

    /// Replace all rows for `(project_id, source_type)` with `file_hashes`
    /// in a single transaction.
    async fn batch_save(
        &self,
        project_id: &str,
        file_hashes: &HashMap<String, String>,
        source_type: SourceType,
    ) -> Result<()>;

    /// Insert or update the row for one file, leaving its siblings alone.
    async fn save_file_hash(
        &self,
        project_id: &str,
        source_type: SourceType,
        file_path: &str,
        file_hash: &str,
    ) -> Result<()>;

    /// Returns whether a row existed.
    async fn remove_file_hash(
        &self,
        project_id: &str,
        source_type: SourceType,
        file_path: &str,
    ) -> Result<bool>;

    /// Remove every row of a project regardless of source type.
    async fn clear_project(&self, project_id: &str) -> Result<usize>;

    async fn list_states(&self, project_id: &str) -> Result<Vec<IndexFileState>>;
}

/// Open (creating if needed) the SQLite database both stores live in.
pub async fn connect_pool(db_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let pool = SqlitePool::connect_with(
        SqliteConnectOptions::new()
            .filename(db_path)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .create_if_missing(true),
    )
    .await?;
    tracing::debug!("Opened index database at {}", db_path.display());
    Ok(pool)
}

/// In-memory database. Each SQLite connection gets its own private memory
/// database, so the pool is held to a single connection.
pub async fn connect_memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    Ok(pool)
}

/// Cosine similarity of two vectors; zero when lengths differ or either is zero.
pub fn cosine_similarity(a: &[f16], b: &[f16]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot_product = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (x.to_f32(), y.to_f32());
        dot_product += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot_product / denom
    }
}

/// Order hits best first and keep the top `k`.
pub(crate) fn top_k(mut hits: Vec<SearchHit>, k: usize) -> Vec<SearchHit> {
    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    hits.truncate(k);
    hits
}
