pub mod lines;
pub mod text;

// Re-export the main chunking types for external use
pub use lines::LineIndex;
pub use text::{ChunkingConfig, LineChunk, TextChunker};
