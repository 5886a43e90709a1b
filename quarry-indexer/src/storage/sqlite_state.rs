//! SQLite-backed index state store.
//!
//! ```sql
//! CREATE TABLE index_file_state (
//!     project_id  TEXT NOT NULL,
//!     source_type TEXT NOT NULL,
//!     file_path   TEXT NOT NULL,
//!     file_hash   TEXT NOT NULL,   -- hex blake3 of the raw resource bytes
//!     indexed_at  TIMESTAMP NOT NULL,
//!     PRIMARY KEY (project_id, source_type, file_path)
//! );
//! ```

use super::{IndexFileState, IndexStateStore, connect_memory_pool, connect_pool};
use crate::source::SourceType;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;

#[derive(Clone, Debug)]
pub struct SqliteIndexStateStore {
    pool: SqlitePool,
}

impl SqliteIndexStateStore {
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
            CREATE TABLE IF NOT EXISTS index_file_state (
                project_id TEXT NOT NULL,
                source_type TEXT NOT NULL,
                file_path TEXT NOT NULL,
                file_hash TEXT NOT NULL,
                indexed_at TIMESTAMP NOT NULL,
                PRIMARY KEY (project_id, source_type, file_path)
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl IndexStateStore for SqliteIndexStateStore {
    async fn hashes_for_source(
        &self,
        project_id: &str,
        source_type: SourceType,
    ) -> Result<HashMap<String, String>> {
        let rows = sqlx::query(
            "SELECT file_path, file_hash FROM index_file_state WHERE project_id = ? AND source_type = ?",
        )
        .bind(project_id)
        .bind(source_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok((row.try_get("file_path")?, row.try_get("file_hash")?)))
            .collect()
    }

    async fn batch_save(
        &self,
        project_id: &str,
        file_hashes: &HashMap<String, String>,
        source_type: SourceType,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Rows whose hash is unchanged keep their original timestamp
        let previous: HashMap<String, (String, DateTime<Utc>)> = sqlx::query(
            "SELECT file_path, file_hash, indexed_at FROM index_file_state WHERE project_id = ? AND source_type = ?",
        )
        .bind(project_id)
        .bind(source_type.as_str())
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| {
            Ok((
                row.try_get("file_path")?,
                (row.try_get("file_hash")?, row.try_get("indexed_at")?),
            ))
        })
        .collect::<Result<_>>()?;

        sqlx::query("DELETE FROM index_file_state WHERE project_id = ? AND source_type = ?")
            .bind(project_id)
            .bind(source_type.as_str())
            .execute(&mut *tx)
            .await?;

        for (file_path, file_hash) in file_hashes {
            let indexed_at = match previous.get(file_path) {
                Some((hash, at)) if hash == file_hash => *at,
                _ => now,
            };
            sqlx::query(
                r#"
                INSERT INTO index_file_state (project_id, source_type, file_path, file_hash, indexed_at)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(project_id)
            .bind(source_type.as_str())
            .bind(file_path)
            .bind(file_hash)
            .bind(indexed_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to record hash for {file_path}"))?;
        }

        tx.commit().await?;
        tracing::debug!(
            project = project_id,
            source = %source_type,
            rows = file_hashes.len(),
            "Saved index state"
        );
        Ok(())
    }

    async fn save_file_hash(
        &self,
        project_id: &str,
        source_type: SourceType,
        file_path: &str,
        file_hash: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO index_file_state (project_id, source_type, file_path, file_hash, indexed_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(project_id, source_type, file_path) DO UPDATE SET
                file_hash = excluded.file_hash,
                indexed_at = excluded.indexed_at
            "#,
        )
        .bind(project_id)
        .bind(source_type.as_str())
        .bind(file_path)
        .bind(file_hash)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_file_hash(
        &self,
        project_id: &str,
        source_type: SourceType,
        file_path: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM index_file_state WHERE project_id = ? AND source_type = ? AND file_path = ?",
        )
        .bind(project_id)
        .bind(source_type.as_str())
        .bind(file_path)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_project(&self, project_id: &str) -> Result<usize> {
        let result = sqlx::query("DELETE FROM index_file_state WHERE project_id = ?")
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn list_states(&self, project_id: &str) -> Result<Vec<IndexFileState>> {
        let rows = sqlx::query(
            r#"
            SELECT project_id, source_type, file_path, file_hash, indexed_at
            FROM index_file_state
            WHERE project_id = ?
            ORDER BY source_type, file_path
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let source_type: String = row.try_get("source_type")?;
                let indexed_at: DateTime<Utc> = row.try_get("indexed_at")?;
                Ok(IndexFileState {
                    project_id: row.try_get("project_id")?,
                    source_type: source_type
                        .parse()
                        .map_err(|e: String| anyhow::anyhow!(e))?,
                    file_path: row.try_get("file_path")?,
                    file_hash: row.try_get("file_hash")?,
                    indexed_at,
                })
            })
            .collect()
    }
}
