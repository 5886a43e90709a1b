//! Byte offset to line number lookup.
//!
//! Lines are 1-based. A `'\n'` belongs to the line it terminates, so a trailing
//! newline at the end of a text does not open a new line.

/// Sorted positions of every `'\n'` in a text, used to map byte offsets to lines
/// in `O(log n)`.
#[derive(Debug, Clone, Default)]
pub struct LineIndex {
    newlines: Vec<usize>,
    len: usize,
}

impl LineIndex {
    pub fn new(text: &str) -> Self {
        let newlines = text
            .bytes()
            .enumerate()
            .filter_map(|(i, b)| (b == b'\n').then_some(i))
            .collect();
        Self {
            newlines,
            len: text.len(),
        }
    }

    /// Line containing the byte at `offset`.
    pub fn line_at(&self, offset: usize) -> usize {
        1 + self.newlines.partition_point(|&nl| nl < offset)
    }

    /// Number of lines in the indexed text. Empty text has zero lines.
    pub fn total_lines(&self) -> usize {
        if self.len == 0 {
            return 0;
        }
        match self.newlines.last() {
            Some(&last) if last + 1 == self.len => self.newlines.len(),
            _ => self.newlines.len() + 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_at_maps_offsets() {
        let index = LineIndex::new("ab\ncd\nef");
        assert_eq!(index.line_at(0), 1);
        assert_eq!(index.line_at(2), 1); // the newline ends line 1
        assert_eq!(index.line_at(3), 2);
        assert_eq!(index.line_at(5), 2);
        assert_eq!(index.line_at(6), 3);
        assert_eq!(index.line_at(7), 3);
    }

    #[test]
    fn test_total_lines() {
        assert_eq!(LineIndex::new("").total_lines(), 0);
        assert_eq!(LineIndex::new("one").total_lines(), 1);
        assert_eq!(LineIndex::new("one\n").total_lines(), 1);
        assert_eq!(LineIndex::new("one\ntwo").total_lines(), 2);
        assert_eq!(LineIndex::new("one\n\n").total_lines(), 2);
        assert_eq!(LineIndex::new("\n").total_lines(), 1);
    }

    #[test]
    fn test_blank_lines_count() {
        let text = "a\n\n\nb";
        let index = LineIndex::new(text);
        assert_eq!(index.total_lines(), 4);
        assert_eq!(index.line_at(text.len() - 1), 4);
    }
}
