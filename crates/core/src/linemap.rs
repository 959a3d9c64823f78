//! Virtual line numbering.
//!
//! Diagnostics and bytecodes are tagged with *virtual* line numbers, a
//! single monotonically increasing counter across the whole input. The
//! [`Linemap`] records which (source file, physical line) each virtual line
//! corresponds to, so `%line` markers and included files keep diagnostics
//! pointing at the right place.

use crate::Line;

#[derive(Debug)]
struct Span {
    /// First virtual line the span covers.
    start: Line,
    file: String,
    file_line: u64,
    line_inc: u64,
}

/// Allocator and resolver of virtual line numbers.
#[derive(Debug)]
pub struct Linemap {
    current: Line,
    spans: Vec<Span>,
}

impl Default for Linemap {
    fn default() -> Self {
        Self::new()
    }
}

impl Linemap {
    /// Creates an empty map; the first [`Linemap::goto_next`] returns 1.
    pub fn new() -> Self {
        Self { current: 0, spans: Vec::new() }
    }

    /// The most recently allocated virtual line.
    pub fn current(&self) -> Line {
        self.current
    }

    /// Allocate the next virtual line and return it.
    pub fn goto_next(&mut self) -> Line {
        self.current += 1;
        self.current
    }

    /// Associate virtual lines, starting with the next allocated one, with
    /// `file`, counting physical lines from `file_line` in steps of
    /// `line_inc`.
    pub fn set(&mut self, file: impl Into<String>, file_line: u64, line_inc: u64) {
        self.spans.push(Span {
            start: self.current + 1,
            file: file.into(),
            file_line,
            line_inc,
        });
    }

    /// Resolve a virtual line to `(source file, physical line)`.
    pub fn lookup(&self, line: Line) -> (&str, u64) {
        let span = self.spans.iter().rev().find(|span| span.start <= line);

        match span {
            Some(span) => (&span.file, span.file_line + (line - span.start) * span.line_inc),
            None => ("<unknown>", 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_mapping() {
        let mut map = Linemap::new();
        map.set("input.asm", 1, 1);

        for _ in 0..5 {
            map.goto_next();
        }

        assert_eq!(map.lookup(1), ("input.asm", 1));
        assert_eq!(map.lookup(5), ("input.asm", 5));
    }

    #[test]
    fn test_line_marker() {
        let mut map = Linemap::new();
        map.set("outer.asm", 1, 1);
        map.goto_next(); // outer.asm:1
        map.goto_next(); // outer.asm:2, say it reads `%line 10+2 "inner.mac"`
        map.set("inner.mac", 10, 2);
        map.goto_next(); // inner.mac:10
        map.goto_next(); // inner.mac:12

        assert_eq!(map.lookup(2), ("outer.asm", 2));
        assert_eq!(map.lookup(3), ("inner.mac", 10));
        assert_eq!(map.lookup(4), ("inner.mac", 12));
    }

    #[test]
    fn test_unknown_line() {
        let map = Linemap::new();
        assert_eq!(map.lookup(1), ("<unknown>", 0));
    }
}
