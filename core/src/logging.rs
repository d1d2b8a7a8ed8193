//! Bounded in-memory line buffer with drop counters and snapshot/iterator APIs

use schema::LineInfo;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default number of lines kept per service
pub const MAX_OUTPUT_LINE_COUNT: usize = 5000;

static NEXT_LINE_INDEX: AtomicU64 = AtomicU64::new(1);

/// Next process-wide line index. Indexes are unique across all services so
/// consumers can merge and order lines from several buffers.
pub fn next_line_index() -> u64 {
    NEXT_LINE_INDEX.fetch_add(1, Ordering::Relaxed)
}

/// A bounded-capacity FIFO of recent log lines.
///
/// - When capacity is exceeded, oldest lines are dropped and `total_dropped` is incremented.
/// - Lines keep the index they were created with; the buffer never renumbers.
#[derive(Debug)]
pub struct LineBuffer {
    capacity: usize,
    total_dropped: u64,
    lines: VecDeque<LineInfo>,
}

impl LineBuffer {
    /// Create a new `LineBuffer` with the given capacity (at least 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            total_dropped: 0,
            lines: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Append a line, evicting the oldest one when full
    pub fn push(&mut self, line: LineInfo) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.total_dropped = self.total_dropped.saturating_add(1);
        }
        self.lines.push_back(line);
    }

    /// Current number of lines retained
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Total number of lines ever dropped due to capacity
    pub fn total_dropped(&self) -> u64 {
        self.total_dropped
    }

    /// Remove all lines
    pub fn clear(&mut self) {
        self.lines.clear();
    }

    /// Copy of all retained lines, oldest first
    pub fn snapshot(&self) -> Vec<LineInfo> {
        self.lines.iter().cloned().collect()
    }

    /// Returns all lines with an index strictly greater than `after_index`.
    /// Useful for tailing from a previously observed line.
    pub fn iter_after(&self, after_index: u64) -> Vec<LineInfo> {
        self.lines
            .iter()
            .filter(|l| l.index > after_index)
            .cloned()
            .collect()
    }
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::new(MAX_OUTPUT_LINE_COUNT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::LineType;

    fn mk_line(text: &str) -> LineInfo {
        LineInfo {
            index: next_line_index(),
            time: 0,
            line_type: LineType::Out,
            text: text.to_string(),
            replaces: false,
        }
    }

    #[test]
    fn test_wrap_around_and_drop_count() {
        let mut buffer = LineBuffer::new(3);
        assert!(buffer.is_empty());

        for text in ["a", "b", "c", "d", "e"] {
            buffer.push(mk_line(text));
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.total_dropped(), 2);
        let texts: Vec<_> = buffer.snapshot().into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec!["c", "d", "e"]);
    }

    #[test]
    fn test_iter_after_and_clear() {
        let mut buffer = LineBuffer::new(10);
        let first = mk_line("a");
        let first_index = first.index;
        buffer.push(first);
        buffer.push(mk_line("b"));
        buffer.push(mk_line("c"));

        let texts: Vec<_> = buffer
            .iter_after(first_index)
            .into_iter()
            .map(|l| l.text)
            .collect();
        assert_eq!(texts, vec!["b", "c"]);

        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.total_dropped(), 0);
    }

    #[test]
    fn test_line_indexes_are_monotonic() {
        let a = next_line_index();
        let b = next_line_index();
        assert!(b > a);
    }
}
