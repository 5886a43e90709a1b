//! Sliding-window text chunking for embedding.
//!
//! Extracted document text is cut into overlapping windows sized to fit an
//! embedding model's input budget. Window ends are nudged back to a natural
//! boundary (paragraph break, line break, whitespace) when one exists in the
//! second half of the window, so chunks rarely split a word in two.
//!
//! The two entry points are:
//! - [`TextChunker::chunk`]: plain chunk texts, in document order.
//! - [`TextChunker::chunk_with_line_tracking`]: chunks plus the 1-based line
//!   range each one covers, for line-oriented sources such as plain text files.
//!
//! # Guarantees
//!
//! *   **Coverage**: every byte of the input belongs to at least one chunk;
//!     consecutive chunks overlap by at most `overlap_chars` characters and never
//!     leave a gap.
//! *   **Order**: chunks are emitted in document order, so line ranges are
//!     monotonically non-decreasing.
//! *   **Empty input**: text that is empty or entirely whitespace yields no chunks.
//!
//! ```
//! use quarry_context::text::{ChunkingConfig, TextChunker};
//!
//! let chunker = TextChunker::new(ChunkingConfig::new(400, 60));
//! let chunks = chunker.chunk_with_line_tracking("line1\nline2\nline3");
//!
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].start_line, 1);
//! assert_eq!(chunks[0].end_line, 3);
//! ```
use crate::lines::LineIndex;
use regex::Regex;
use serde::Serialize;
use std::ops::Range;

/// Boundary patterns, most preferred first.
pub const DEFAULT_BOUNDARIES: &[&str] = &[
    r"\n\s*\n", // Paragraphs
    r"\n",      // Line breaks
    r"[ \t]",   // Spaces
];

/// Rough characters-per-token ratio used to turn a token budget into a window size.
pub const DEFAULT_CHARS_PER_TOKEN: usize = 4;

/// Window size and overlap, both measured in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkingConfig {
    pub chunk_chars: usize,
    pub overlap_chars: usize,
}

impl ChunkingConfig {
    /// Window sizes are clamped so that `chunk_chars >= 1` and the overlap is
    /// at most half a window.
    pub fn new(chunk_chars: usize, overlap_chars: usize) -> Self {
        let chunk_chars = chunk_chars.max(1);
        Self {
            chunk_chars,
            overlap_chars: overlap_chars.min(chunk_chars / 2),
        }
    }

    /// Derive a window from a model's input budget.
    ///
    /// # Arguments
    /// * `max_tokens` - Maximum tokens the embedding model accepts per input
    /// * `chars_per_token` - Heuristic characters per token (usually [`DEFAULT_CHARS_PER_TOKEN`])
    /// * `overlap_fraction` - Fraction of the window shared with the next one, clamped to `[0, 0.5]`
    pub fn from_token_budget(
        max_tokens: usize,
        chars_per_token: usize,
        overlap_fraction: f32,
    ) -> Self {
        let chunk_chars = max_tokens.max(1) * chars_per_token.max(1);
        let fraction = overlap_fraction.clamp(0.0, 0.5);
        let overlap_chars = (chunk_chars as f32 * fraction).floor() as usize;
        Self::new(chunk_chars, overlap_chars)
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self::from_token_budget(256, DEFAULT_CHARS_PER_TOKEN, 0.15)
    }
}

/// A chunk with the line range it was taken from.
///
/// `end_line` is the line holding the chunk's last character, so a chunk that
/// ends on a `'\n'` reports the line that newline terminates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineChunk {
    /// Position of this chunk within the document (0-indexed).
    pub sequence: usize,
    pub text: String,
    pub start_line: usize,
    pub end_line: usize,
}

/// Splits text into overlapping windows.
pub struct TextChunker {
    config: ChunkingConfig,
    boundaries: Vec<Regex>,
}

impl TextChunker {
    /// Creates a chunker using [`DEFAULT_BOUNDARIES`].
    ///
    /// # Panics
    ///
    /// Never in practice; the default boundary patterns are valid regular expressions.
    pub fn new(config: ChunkingConfig) -> Self {
        let boundaries = DEFAULT_BOUNDARIES
            .iter()
            .map(|&pattern| Regex::new(pattern).expect("valid regex"))
            .collect();
        Self { config, boundaries }
    }

    /// Creates a chunker with custom boundary patterns, most preferred first.
    pub fn with_boundaries(
        config: ChunkingConfig,
        patterns: &[&str],
    ) -> Result<Self, regex::Error> {
        let boundaries = patterns
            .iter()
            .map(|&pattern| Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { config, boundaries })
    }

    pub fn config(&self) -> ChunkingConfig {
        self.config
    }

    /// Chunk texts in document order.
    pub fn chunk(&self, text: &str) -> Vec<String> {
        self.windows(text)
            .into_iter()
            .map(|range| text[range].to_string())
            .collect()
    }

    /// Chunks annotated with their 1-based line ranges.
    pub fn chunk_with_line_tracking(&self, text: &str) -> Vec<LineChunk> {
        let lines = LineIndex::new(text);
        self.windows(text)
            .into_iter()
            .enumerate()
            .map(|(sequence, range)| {
                let last_char = prev_char_boundary(text, range.end);
                LineChunk {
                    sequence,
                    start_line: lines.line_at(range.start),
                    end_line: lines.line_at(last_char),
                    text: text[range].to_string(),
                }
            })
            .collect()
    }

    /// Byte ranges of every window. Each range starts and ends on a char boundary.
    /// Windows holding only whitespace are dropped.
    pub fn windows(&self, text: &str) -> Vec<Range<usize>> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let ChunkingConfig {
            chunk_chars,
            overlap_chars,
        } = self.config;

        let mut windows = Vec::new();
        let mut start = 0;
        loop {
            let hard_end = advance_chars(text, start, chunk_chars);
            if hard_end == text.len() {
                windows.push(start..hard_end);
                break;
            }

            let search_from = advance_chars(text, start, chunk_chars / 2);
            let end = self
                .find_boundary(text, search_from, hard_end)
                .filter(|&end| end > start)
                .unwrap_or(hard_end);
            windows.push(start..end);

            let next = retreat_chars(text, end, overlap_chars);
            start = if next <= start { end } else { next };
        }
        // A trailing run of whitespace past the last boundary has nothing to embed
        windows.retain(|range| !text[range.clone()].trim().is_empty());
        windows
    }

    /// End offset just past the last boundary match in `text[from..to]`,
    /// trying each pattern in order of preference.
    fn find_boundary(&self, text: &str, from: usize, to: usize) -> Option<usize> {
        let region = &text[from..to];
        self.boundaries.iter().find_map(|pattern| {
            pattern
                .find_iter(region)
                .last()
                .map(|found| from + found.end())
        })
    }
}

/// Byte offset `n` characters after `start`, or the end of the text.
fn advance_chars(text: &str, start: usize, n: usize) -> usize {
    text[start..]
        .char_indices()
        .nth(n)
        .map(|(i, _)| start + i)
        .unwrap_or(text.len())
}

/// Byte offset `n` characters before `end`, or zero.
fn retreat_chars(text: &str, end: usize, n: usize) -> usize {
    if n == 0 {
        return end;
    }
    text[..end]
        .char_indices()
        .rev()
        .nth(n - 1)
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Start offset of the character that ends just before `end`.
fn prev_char_boundary(text: &str, end: usize) -> usize {
    text[..end]
        .char_indices()
        .next_back()
        .map(|(i, _)| i)
        .unwrap_or(0)
}
