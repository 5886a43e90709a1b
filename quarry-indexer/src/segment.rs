//! Text segments: the unit of embedding and of vector-store storage.

use crate::source::SourceType;
use quarry_context::LineChunk;
use std::collections::BTreeMap;
use std::path::Path;

/// Metadata keys written on every segment.
pub mod keys {
    pub const PROJECT_ID: &str = "project_id";
    pub const SOURCE_TYPE: &str = "source_type";
    pub const FILE_PATH: &str = "file_path";
    pub const FILE_NAME: &str = "file_name";
    pub const EXTENSION: &str = "extension";
    pub const CHUNK_INDEX: &str = "chunk_index";
    pub const CHUNK_TOTAL: &str = "chunk_total";
    /// Only present for text-like resources
    pub const START_LINE: &str = "start_line";
    pub const END_LINE: &str = "end_line";
}

/// A chunk of extracted text plus flat string metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSegment {
    pub text: String,
    pub metadata: BTreeMap<String, String>,
}

impl TextSegment {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn file_path(&self) -> Option<&str> {
        self.get(keys::FILE_PATH)
    }

    /// Stable id for the vector entry. Re-indexing the same chunk position of
    /// the same file yields the same id, so an upsert replaces rather than
    /// duplicates.
    pub fn vector_id(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for key in [
            keys::PROJECT_ID,
            keys::SOURCE_TYPE,
            keys::FILE_PATH,
            keys::CHUNK_INDEX,
        ] {
            hasher.update(self.get(key).unwrap_or_default().as_bytes());
            hasher.update(&[0]);
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// Builds the segments of one resource, filling in the per-file metadata.
#[derive(Debug, Clone)]
pub struct SegmentBuilder {
    base: BTreeMap<String, String>,
}

impl SegmentBuilder {
    pub fn new(project_id: &str, source_type: SourceType, file_path: &str) -> Self {
        let (file_name, extension) = name_and_extension(file_path);

        let mut base = BTreeMap::new();
        base.insert(keys::PROJECT_ID.to_string(), project_id.to_string());
        base.insert(keys::SOURCE_TYPE.to_string(), source_type.to_string());
        base.insert(keys::FILE_PATH.to_string(), file_path.to_string());
        base.insert(keys::FILE_NAME.to_string(), file_name);
        base.insert(keys::EXTENSION.to_string(), extension);
        Self { base }
    }

    fn segment(&self, text: String, index: usize, total: usize) -> TextSegment {
        let mut metadata = self.base.clone();
        metadata.insert(keys::CHUNK_INDEX.to_string(), index.to_string());
        metadata.insert(keys::CHUNK_TOTAL.to_string(), total.to_string());
        TextSegment { text, metadata }
    }

    /// Segments without line metadata, for rich or binary formats.
    pub fn from_chunks(&self, chunks: Vec<String>) -> Vec<TextSegment> {
        let total = chunks.len();
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, text)| self.segment(text, i, total))
            .collect()
    }

    pub fn from_line_chunks(&self, chunks: Vec<LineChunk>) -> Vec<TextSegment> {
        let total = chunks.len();
        chunks
            .into_iter()
            .map(|chunk| {
                let mut segment = self.segment(chunk.text, chunk.sequence, total);
                segment
                    .metadata
                    .insert(keys::START_LINE.to_string(), chunk.start_line.to_string());
                segment
                    .metadata
                    .insert(keys::END_LINE.to_string(), chunk.end_line.to_string());
                segment
            })
            .collect()
    }
}

/// File name and lowercase extension of a path or URL.
fn name_and_extension(file_path: &str) -> (String, String) {
    let without_query = file_path.split(['?', '#']).next().unwrap_or(file_path);
    let trimmed = without_query.trim_end_matches('/');
    let name = Path::new(trimmed)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| trimmed.to_string());
    let extension = crate::extract::extension_of(&name).unwrap_or_default();
    (name, extension)
}
