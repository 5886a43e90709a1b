//! Configuration for embedding models

use crate::error::{EmbedError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default FastEmbed model code.
pub const DEFAULT_MODEL: &str = "all-MiniLM-L6-v2";

/// Configuration for embedding models.
///
/// Deserializes from the `[embedding]` table of the indexer configuration file;
/// every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    /// FastEmbed model name, e.g. `all-MiniLM-L6-v2`
    pub model: String,
    /// Where downloaded model files are kept. FastEmbed's default when unset.
    pub cache_dir: Option<PathBuf>,
    /// Maximum number of texts sent to the model at once
    pub batch_size: usize,
    /// Maximum tokens the model reads per input; longer inputs are truncated
    pub max_input_tokens: usize,
    /// Upper bound on one batch, in seconds
    pub timeout_secs: u64,
    /// Whether to L2-normalize embeddings
    pub normalize: bool,
    /// Show a progress bar while FastEmbed downloads model files
    pub show_download_progress: bool,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            cache_dir: None,
            batch_size: 32,
            max_input_tokens: 256,
            timeout_secs: 30,
            normalize: true,
            show_download_progress: true,
        }
    }
}

impl EmbedConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }

    /// Set the model cache directory (builder style)
    pub fn with_cache_dir<P: AsRef<Path>>(self, cache_dir: P) -> Self {
        Self {
            cache_dir: Some(cache_dir.as_ref().to_path_buf()),
            ..self
        }
    }

    /// Set the batch size for embedding generation (builder style)
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }

    /// Set the per-input token budget (builder style)
    pub fn with_max_input_tokens(self, max_input_tokens: usize) -> Self {
        Self {
            max_input_tokens,
            ..self
        }
    }

    /// Set the per-batch timeout (builder style)
    pub fn with_timeout_secs(self, timeout_secs: u64) -> Self {
        Self {
            timeout_secs,
            ..self
        }
    }

    /// Set whether to normalize embeddings (builder style)
    pub fn with_normalize(self, normalize: bool) -> Self {
        Self { normalize, ..self }
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Check the numeric settings are usable.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(EmbedError::invalid_config("model must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(EmbedError::invalid_config("batch_size must be at least 1"));
        }
        if self.max_input_tokens == 0 {
            return Err(EmbedError::invalid_config(
                "max_input_tokens must be at least 1",
            ));
        }
        if self.timeout_secs == 0 {
            return Err(EmbedError::invalid_config("timeout_secs must be at least 1"));
        }
        tracing::debug!("Embedding config validated for: {}", self.model);
        Ok(())
    }
}
