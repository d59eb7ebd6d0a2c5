//! Console ring buffer.
//!
//! Holds the most recent lines printed by the device. Text arrives in
//! arbitrary chunks; a chunk that does not start a new line is appended to
//! the last stored line in place.

use std::collections::VecDeque;

use crate::constants::CONSOLE_CAPACITY;

/// Fixed-capacity buffer of console lines, oldest first.
///
/// Every line except possibly the last ends with `\n`.
#[derive(Debug, Clone)]
pub struct ConsoleBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    /// Lines ever started, including evicted ones.
    started: u64,
}

impl Default for ConsoleBuffer {
    fn default() -> Self {
        Self::new(CONSOLE_CAPACITY)
    }
}

impl ConsoleBuffer {
    /// Create a buffer holding at most `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
            started: 0,
        }
    }

    /// Feed decoded device text.
    pub fn push_text(&mut self, text: &str) {
        for piece in text.split_inclusive('\n') {
            match self.lines.back_mut() {
                Some(last) if !last.ends_with('\n') => last.push_str(piece),
                _ => {
                    if self.lines.len() == self.capacity {
                        self.lines.pop_front();
                    }
                    self.lines.push_back(piece.to_string());
                    self.started += 1;
                }
            }
        }
    }

    /// Number of stored lines.
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether nothing has been stored.
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Stored lines, oldest first.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    /// Completed lines at or after `cursor`, and the cursor to pass next.
    ///
    /// Cursors count lines since the buffer was created, so a reader that
    /// fell behind simply resumes at the oldest line still stored. A cursor
    /// from another buffer (ahead of this one) starts over.
    pub fn completed_since(&self, cursor: u64) -> (Vec<String>, u64) {
        let first = self.started - self.lines.len() as u64;
        let mut next = if cursor > self.started {
            first
        } else {
            cursor.max(first)
        };
        let skip = usize::try_from(next - first).unwrap_or(usize::MAX);

        let mut out = Vec::new();
        for line in self.lines.iter().skip(skip) {
            if !line.ends_with('\n') {
                break;
            }
            out.push(line.clone());
            next += 1;
        }
        (out, next)
    }
}

/// Decode device bytes as ASCII, replacing anything else with `?`.
pub fn decode_ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii() { char::from(b) } else { '?' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(buffer: &ConsoleBuffer) -> Vec<&str> {
        buffer.lines().collect()
    }

    #[test]
    fn test_split_line_is_reassembled() {
        let mut buffer = ConsoleBuffer::default();
        buffer.push_text("AB");
        buffer.push_text("C\n");
        assert_eq!(stored(&buffer), vec!["ABC\n"]);
    }

    #[test]
    fn test_multiple_lines_in_one_chunk() {
        let mut buffer = ConsoleBuffer::default();
        buffer.push_text("one\ntwo\nthr");
        buffer.push_text("ee\n");
        assert_eq!(stored(&buffer), vec!["one\n", "two\n", "three\n"]);
    }

    #[test]
    fn test_chunk_after_complete_line_starts_new_entry() {
        let mut buffer = ConsoleBuffer::default();
        buffer.push_text("done\n");
        buffer.push_text("next");
        assert_eq!(stored(&buffer), vec!["done\n", "next"]);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut buffer = ConsoleBuffer::default();
        for i in 0..1500 {
            buffer.push_text(&format!("line {i}\n"));
        }
        assert_eq!(buffer.len(), 1000);
        assert_eq!(buffer.lines().next(), Some("line 500\n"));
        assert_eq!(buffer.lines().last(), Some("line 1499\n"));
    }

    #[test]
    fn test_completed_since_skips_partial_line() {
        let mut buffer = ConsoleBuffer::default();
        buffer.push_text("a\nb\nc");

        let (lines, cursor) = buffer.completed_since(0);
        assert_eq!(lines, vec!["a\n", "b\n"]);
        assert_eq!(cursor, 2);

        buffer.push_text("\n");
        let (lines, cursor) = buffer.completed_since(cursor);
        assert_eq!(lines, vec!["c\n"]);
        assert_eq!(cursor, 3);
    }

    #[test]
    fn test_completed_since_resumes_after_eviction() {
        let mut buffer = ConsoleBuffer::new(2);
        buffer.push_text("1\n2\n3\n");

        let (lines, cursor) = buffer.completed_since(0);
        assert_eq!(lines, vec!["2\n", "3\n"]);
        assert_eq!(cursor, 3);
    }

    #[test]
    fn test_decode_ascii_replaces_high_bytes() {
        assert_eq!(decode_ascii(b"ok\xff\n"), "ok?\n");
    }
}
