//! Error taxonomy for indexing passes.
//!
//! Per-resource problems ([`IndexError::Extraction`]) are absorbed by the pass
//! and counted. Everything else ends the pass, puts the coordinator into
//! `FAILED` and is surfaced through `IndexProgress::error` and the event bus.

use quarry_embed::EmbedError;

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// A single resource could not be read or decoded
    #[error("Extraction failed for {resource}: {reason}")]
    Extraction { resource: String, reason: String },

    /// The embedding model failed or timed out; the whole pass is aborted
    #[error("Embedding failed: {source}")]
    Embedding {
        #[from]
        source: EmbedError,
    },

    /// Upsert or delete against the embedding store failed
    #[error("Vector store operation failed: {source}")]
    VectorStore {
        #[source]
        source: anyhow::Error,
    },

    /// The index state store could not be read or written
    #[error("Index state persistence failed: {source}")]
    Persistence {
        #[source]
        source: anyhow::Error,
    },

    /// The filesystem watch loop stopped
    #[error("File watching failed: {reason}")]
    Watch { reason: String },

    /// An operation required a successful index pass first
    #[error("Coordinator is {status}, expected a completed index pass")]
    NotReady { status: String },

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl IndexError {
    pub fn extraction(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Extraction {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    pub fn vector_store(source: anyhow::Error) -> Self {
        Self::VectorStore { source }
    }

    pub fn persistence(source: anyhow::Error) -> Self {
        Self::Persistence { source }
    }

    pub fn watch(reason: impl Into<String>) -> Self {
        Self::Watch {
            reason: reason.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether the pass can skip the affected resource and carry on.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Extraction { .. })
    }
}
