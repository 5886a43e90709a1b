//! SQLite-backed embedding store.
//!
//! Vectors are stored as little-endian f16 BLOBs and metadata as a JSON
//! object. Filters compile to `json_extract` equalities. Search is a
//! brute-force cosine scan over the filtered rows, computed in Rust.

use super::{
    EmbeddingStore, MetadataFilter, SearchHit, VectorEntry, connect_memory_pool, connect_pool,
    cosine_similarity, top_k,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use half::f16;
use sqlx::sqlite::SqliteArguments;
use sqlx::{Arguments, Row, SqlitePool};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Clone, Debug)]
pub struct SqliteEmbeddingStore {
    pool: SqlitePool,
}

impl SqliteEmbeddingStore {
    pub async fn open(db_path: &Path) -> Result<Self> {
        Self::from_pool(connect_pool(db_path).await?).await
    }

    /// In-memory store for tests.
    pub async fn open_memory() -> Result<Self> {
        Self::from_pool(connect_memory_pool().await?).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        Self::create_tables(&pool).await?;
        Ok(Self { pool })
    }

    async fn create_tables(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vectors (
                id TEXT PRIMARY KEY,
                embedding BLOB NOT NULL,
                dimension INTEGER NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }
}

/// `WHERE` clause and bound arguments for a metadata filter.
fn where_clause(filter: Option<&MetadataFilter>) -> Result<(String, SqliteArguments<'static>)> {
    let mut args = SqliteArguments::default();
    let Some(filter) = filter.filter(|f| !f.is_empty()) else {
        return Ok((String::new(), args));
    };

    let mut conditions = Vec::new();
    for (key, value) in filter.conditions() {
        conditions.push("json_extract(metadata, ?) = ?");
        args.add(json_path(key)).map_err(|e| anyhow::anyhow!(e))?;
        args.add(value.to_string()).map_err(|e| anyhow::anyhow!(e))?;
    }
    Ok((format!(" WHERE {}", conditions.join(" AND ")), args))
}

fn json_path(key: &str) -> String {
    format!("$.\"{}\"", key.replace('"', "\\\""))
}

#[async_trait]
impl EmbeddingStore for SqliteEmbeddingStore {
    async fn upsert(&self, entries: Vec<VectorEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for entry in &entries {
            let metadata = serde_json::to_string(&entry.metadata)?;
            let blob: &[u8] = bytemuck::cast_slice(entry.vector.as_slice());
            sqlx::query(
                r#"
                INSERT INTO vectors (id, embedding, dimension, content, metadata, updated_at)
                VALUES (?, ?, ?, ?, ?, CURRENT_TIMESTAMP)
                ON CONFLICT(id) DO UPDATE SET
                    embedding = excluded.embedding,
                    dimension = excluded.dimension,
                    content = excluded.content,
                    metadata = excluded.metadata,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&entry.id)
            .bind(blob)
            .bind(entry.vector.len() as i64)
            .bind(&entry.text)
            .bind(metadata)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to upsert vector {}", entry.id))?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_where(&self, filter: &MetadataFilter) -> Result<usize> {
        let (clause, args) = where_clause(Some(filter))?;
        let sql = format!("DELETE FROM vectors{clause}");
        let result = sqlx::query_with(&sql, args).execute(&self.pool).await?;
        Ok(result.rows_affected() as usize)
    }

    async fn search(
        &self,
        query: &[f16],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let (clause, args) = where_clause(filter)?;
        let sql = format!("SELECT id, embedding, content, metadata FROM vectors{clause}");
        let rows = sqlx::query_with(&sql, args).fetch_all(&self.pool).await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: Vec<u8> = row.try_get("embedding")?;
            // pod_collect_to_vec copies, so the BLOB needs no particular alignment
            let vector: Vec<f16> = bytemuck::pod_collect_to_vec(&blob);
            let metadata: String = row.try_get("metadata")?;
            let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata)?;
            hits.push(SearchHit {
                id: row.try_get("id")?,
                score: cosine_similarity(query, &vector),
                text: row.try_get("content")?,
                metadata,
            });
        }
        Ok(top_k(hits, k))
    }

    async fn count(&self, filter: Option<&MetadataFilter>) -> Result<usize> {
        let (clause, args) = where_clause(filter)?;
        let sql = format!("SELECT COUNT(*) AS n FROM vectors{clause}");
        let row = sqlx::query_with(&sql, args).fetch_one(&self.pool).await?;
        let n: i64 = row.try_get("n")?;
        Ok(n as usize)
    }
}
