//! # quarry-embed
//!
//! Text embedding for the quarry indexer. Embeddings are produced by local ONNX
//! models through FastEmbed and stored as normalized half-precision vectors.
//!
//! ## Quick Start
//!
//! ```no_run
//! use quarry_embed::{EmbedConfig, EmbeddingProvider, FastEmbedProvider};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let provider = FastEmbedProvider::create(EmbedConfig::default()).await?;
//!
//! let texts = vec!["Hello world".to_string(), "How are you?".to_string()];
//! let result = provider.embed_texts(&texts).await?;
//!
//! println!("Generated {} embeddings of dimension {}",
//!          result.len(), result.dimension);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`config`]: model selection, batch size and input budget
//! - [`provider`]: the [`EmbeddingProvider`] trait and the FastEmbed implementation
//! - [`error`]: error types and result handling
//!
//! Models are cached process-wide, so several providers built from the same
//! configuration share one loaded model.

pub mod config;
pub mod error;
pub mod provider;

// Re-export main types for easy access
pub use config::EmbedConfig;
pub use error::{EmbedError, Result};
pub use provider::{EmbeddingProvider, EmbeddingResult, FastEmbedProvider};
