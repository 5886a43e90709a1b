//! In-memory stores for tests and throwaway runs.

use super::{
    EmbeddingStore, IndexFileState, IndexStateStore, MetadataFilter, SearchHit, VectorEntry,
    cosine_similarity, top_k,
};
use crate::source::SourceType;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use half::f16;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
pub struct InMemoryEmbeddingStore {
    entries: Mutex<BTreeMap<String, VectorEntry>>,
}

impl InMemoryEmbeddingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every entry, ordered by id.
    pub fn entries(&self) -> Vec<VectorEntry> {
        lock(&self.entries).values().cloned().collect()
    }
}

#[async_trait]
impl EmbeddingStore for InMemoryEmbeddingStore {
    async fn upsert(&self, entries: Vec<VectorEntry>) -> Result<()> {
        let mut stored = lock(&self.entries);
        for entry in entries {
            stored.insert(entry.id.clone(), entry);
        }
        Ok(())
    }

    async fn delete_where(&self, filter: &MetadataFilter) -> Result<usize> {
        let mut stored = lock(&self.entries);
        let before = stored.len();
        stored.retain(|_, entry| !filter.matches(&entry.metadata));
        Ok(before - stored.len())
    }

    async fn search(
        &self,
        query: &[f16],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>> {
        let hits = lock(&self.entries)
            .values()
            .filter(|entry| filter.is_none_or(|f| f.matches(&entry.metadata)))
            .map(|entry| SearchHit {
                id: entry.id.clone(),
                score: cosine_similarity(query, &entry.vector),
                text: entry.text.clone(),
                metadata: entry.metadata.clone(),
            })
            .collect();
        Ok(top_k(hits, k))
    }

    async fn count(&self, filter: Option<&MetadataFilter>) -> Result<usize> {
        Ok(lock(&self.entries)
            .values()
            .filter(|entry| filter.is_none_or(|f| f.matches(&entry.metadata)))
            .count())
    }
}

type StateKey = (String, SourceType, String);

#[derive(Debug, Default)]
pub struct InMemoryIndexStateStore {
    rows: Mutex<BTreeMap<StateKey, (String, DateTime<Utc>)>>,
}

impl InMemoryIndexStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IndexStateStore for InMemoryIndexStateStore {
    async fn hashes_for_source(
        &self,
        project_id: &str,
        source_type: SourceType,
    ) -> Result<HashMap<String, String>> {
        Ok(lock(&self.rows)
            .iter()
            .filter(|((p, s, _), _)| p == project_id && *s == source_type)
            .map(|((_, _, path), (hash, _))| (path.clone(), hash.clone()))
            .collect())
    }

    async fn batch_save(
        &self,
        project_id: &str,
        file_hashes: &HashMap<String, String>,
        source_type: SourceType,
    ) -> Result<()> {
        let now = Utc::now();
        let mut rows = lock(&self.rows);
        let mut previous = HashMap::new();
        rows.retain(|(p, s, path), row| {
            let in_scope = p == project_id && *s == source_type;
            if in_scope {
                previous.insert(path.clone(), row.clone());
            }
            !in_scope
        });
        for (path, hash) in file_hashes {
            let indexed_at = match previous.get(path) {
                Some((old, at)) if old == hash => *at,
                _ => now,
            };
            rows.insert(
                (project_id.to_string(), source_type, path.clone()),
                (hash.clone(), indexed_at),
            );
        }
        Ok(())
    }

    async fn save_file_hash(
        &self,
        project_id: &str,
        source_type: SourceType,
        file_path: &str,
        file_hash: &str,
    ) -> Result<()> {
        lock(&self.rows).insert(
            (project_id.to_string(), source_type, file_path.to_string()),
            (file_hash.to_string(), Utc::now()),
        );
        Ok(())
    }

    async fn remove_file_hash(
        &self,
        project_id: &str,
        source_type: SourceType,
        file_path: &str,
    ) -> Result<bool> {
        let key = (project_id.to_string(), source_type, file_path.to_string());
        Ok(lock(&self.rows).remove(&key).is_some())
    }

    async fn clear_project(&self, project_id: &str) -> Result<usize> {
        let mut rows = lock(&self.rows);
        let before = rows.len();
        rows.retain(|(p, _, _), _| p != project_id);
        Ok(before - rows.len())
    }

    async fn list_states(&self, project_id: &str) -> Result<Vec<IndexFileState>> {
        Ok(lock(&self.rows)
            .iter()
            .filter(|((p, _, _), _)| p == project_id)
            .map(|((p, s, path), (hash, at))| IndexFileState {
                project_id: p.clone(),
                source_type: *s,
                file_path: path.clone(),
                file_hash: hash.clone(),
                indexed_at: *at,
            })
            .collect())
    }
}
