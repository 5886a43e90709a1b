//! TOML configuration for a quarry project.
//!
//! ```toml
//! [project]
//! id = "handbook"
//!
//! [chunking]
//! overlap_fraction = 0.15
//!
//! [embedding]
//! model = "all-MiniLM-L6-v2"
//!
//! [[sources]]
//! type = "local_folders"
//! paths = ["docs"]
//! ```
//!
//! Relative paths (the database and local folder roots) are resolved against
//! the directory holding the configuration file.

use crate::source::KnowledgeSourceConfig;
use anyhow::{Context, Result};
use quarry_context::text::{ChunkingConfig, DEFAULT_CHARS_PER_TOKEN};
use quarry_embed::EmbedConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarryConfig {
    pub project: ProjectConfig,
    #[serde(default)]
    pub chunking: ChunkingSettings,
    #[serde(default)]
    pub embedding: EmbedConfig,
    #[serde(default)]
    pub indexing: IndexingSettings,
    #[serde(default)]
    pub watch: WatchSettings,
    #[serde(default)]
    pub filter: FilterSettings,
    #[serde(default)]
    pub sources: Vec<KnowledgeSourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub id: String,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".quarry").join("index.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingSettings {
    #[serde(default = "default_overlap_fraction")]
    pub overlap_fraction: f32,
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
    /// Overrides the embedding model's input budget when set
    #[serde(default)]
    pub max_tokens: Option<usize>,
}

fn default_overlap_fraction() -> f32 {
    0.15
}
fn default_chars_per_token() -> usize {
    DEFAULT_CHARS_PER_TOKEN
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            overlap_fraction: default_overlap_fraction(),
            chars_per_token: default_chars_per_token(),
            max_tokens: None,
        }
    }
}

impl ChunkingSettings {
    /// Window sizes for a model reading at most `model_max_tokens` per input.
    pub fn chunking_config(&self, model_max_tokens: usize) -> ChunkingConfig {
        ChunkingConfig::from_token_budget(
            self.max_tokens.unwrap_or(model_max_tokens),
            self.chars_per_token,
            self.overlap_fraction,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingSettings {
    /// Segments embedded per provider call
    #[serde(default = "default_segment_batch_size")]
    pub segment_batch_size: usize,
    /// Files larger than this are skipped as too large
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// Checkpoint the state store after this many dirty resources; 0 disables
    #[serde(default = "default_save_every")]
    pub save_every: usize,
}

fn default_segment_batch_size() -> usize {
    32
}
fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_save_every() -> usize {
    200
}

impl Default for IndexingSettings {
    fn default() -> Self {
        Self {
            segment_batch_size: default_segment_batch_size(),
            max_file_bytes: default_max_file_bytes(),
            save_every: default_save_every(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSettings {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Pending change events before the watcher falls back to a full rescan
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Re-poll interval for URL sources
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_debounce_ms() -> u64 {
    500
}
fn default_channel_capacity() -> usize {
    1024
}
fn default_poll_interval_secs() -> u64 {
    300
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            channel_capacity: default_channel_capacity(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl WatchSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterSettings {
    /// Extra gitignore-style patterns to exclude
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub include_hidden: bool,
}

impl QuarryConfig {
    /// Minimal configuration for a project, with every section defaulted.
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project: ProjectConfig {
                id: project_id.into(),
                db_path: default_db_path(),
            },
            chunking: ChunkingSettings::default(),
            embedding: EmbedConfig::default(),
            indexing: IndexingSettings::default(),
            watch: WatchSettings::default(),
            filter: FilterSettings::default(),
            sources: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: KnowledgeSourceConfig) -> Self {
        self.sources.push(source);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.project.id.trim().is_empty() {
            anyhow::bail!("project.id must not be empty");
        }
        if !(0.0..=0.5).contains(&self.chunking.overlap_fraction) {
            anyhow::bail!("chunking.overlap_fraction must be in [0.0, 0.5]");
        }
        if self.chunking.chars_per_token == 0 {
            anyhow::bail!("chunking.chars_per_token must be > 0");
        }
        if self.chunking.max_tokens == Some(0) {
            anyhow::bail!("chunking.max_tokens must be > 0");
        }
        if self.indexing.segment_batch_size == 0 {
            anyhow::bail!("indexing.segment_batch_size must be > 0");
        }
        if self.indexing.max_file_bytes == 0 {
            anyhow::bail!("indexing.max_file_bytes must be > 0");
        }
        if self.watch.channel_capacity == 0 {
            anyhow::bail!("watch.channel_capacity must be > 0");
        }
        if self.watch.poll_interval_secs == 0 {
            anyhow::bail!("watch.poll_interval_secs must be > 0");
        }
        self.embedding
            .validate()
            .map_err(|e| anyhow::anyhow!("embedding: {e}"))?;
        Ok(())
    }

    /// Make the database path and folder roots absolute relative to `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.project.db_path.is_relative() {
            self.project.db_path = base.join(&self.project.db_path);
        }
        for source in &mut self.sources {
            if let KnowledgeSourceConfig::LocalFolders { paths, .. } = source {
                for path in paths.iter_mut() {
                    if path.is_relative() {
                        *path = base.join(&*path);
                    }
                }
            }
        }
    }
}

pub fn load_config(path: &Path) -> Result<QuarryConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: QuarryConfig =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    let base = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    config.resolve_paths(base);

    tracing::debug!(
        project = %config.project.id,
        sources = config.sources.len(),
        "Loaded configuration from {}",
        path.display()
    );
    Ok(config)
}
