//! quarry-indexer: incremental knowledge indexing
//!
//! Keeps a vector index of a project's knowledge sources in step with their
//! content. Each pass hashes every resource, re-embeds only what changed and
//! removes what disappeared; a live watch then applies single changes as they
//! happen.
//!
//! ## Key Modules
//!
//! - **[`coordinator`]**: per-source passes, watch lifecycle and the registry
//! - **[`extract`]**: text extraction for plain text, HTML, PDF and Office files
//! - **[`indexer`]**: batched embedding and upsert of text segments
//! - **[`storage`]**: index state and embedding stores, SQLite and in-memory
//! - **[`watcher`]** / **[`handler`]**: filesystem change events and their effect
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quarry_indexer::coordinator::{CoordinatorContext, CoordinatorRegistry, PipelineSettings};
//! use quarry_indexer::config::load_config;
//! use quarry_indexer::storage::{SqliteEmbeddingStore, SqliteIndexStateStore, connect_pool};
//! use quarry_embed::{EmbeddingProvider, FastEmbedProvider};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = load_config(Path::new("quarry.toml"))?;
//! let provider = Arc::new(FastEmbedProvider::create(config.embedding.clone()).await?);
//! let pool = connect_pool(&config.project.db_path).await?;
//!
//! let ctx = CoordinatorContext::new(
//!     config.project.id.clone(),
//!     provider.clone(),
//!     Arc::new(SqliteEmbeddingStore::from_pool(pool.clone()).await?),
//!     Arc::new(SqliteIndexStateStore::from_pool(pool).await?),
//! )
//! .with_settings(PipelineSettings::from_config(&config, provider.as_ref()));
//!
//! for coordinator in CoordinatorRegistry::with_defaults().build_all(&ctx, &config.sources, &config.filter)? {
//!     coordinator.start_indexing().await;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Source → Extractor → Chunker → HybridIndexer → EmbeddingStore
//!   ↑                                 ↓
//! FileWatcher → ChangeHandler    IndexStateStore (hash per resource)
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod extract;
pub mod filter;
pub mod handler;
pub mod indexer;
pub mod progress;
pub mod segment;
pub mod source;
pub mod storage;
pub mod watcher;

pub use coordinator::{CoordinatorContext, CoordinatorRegistry, IndexingCoordinator};
pub use error::{IndexError, Result};
pub use events::{EventBus, IndexEvent};
pub use progress::{IndexProgress, IndexStatus};
pub use source::{KnowledgeSourceConfig, SourceType};
