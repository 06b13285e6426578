use std::ops::Range;

/// Byte range `start..end` inside file `file_id` of a `SourceFileSet`.
///
/// The default span is empty and points at file 0; the compiler uses it for
/// instructions it synthesizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Span {
    pub start: u32,
    pub end: u32,
    pub file_id: u16,
}

impl Span {
    pub fn new(start: usize, end: usize, file_id: u16) -> Self {
        debug_assert!(start <= end, "span start {} after end {}", start, end);
        Self {
            start: start as u32,
            end: end as u32,
            file_id,
        }
    }

    pub fn dummy() -> Self {
        Self::default()
    }

    /// Smallest span containing both. Spans of different files keep `self`.
    pub fn merge(self, other: Span) -> Span {
        if self.file_id != other.file_id {
            return self;
        }
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
            ..self
        }
    }

    pub fn range(&self) -> Range<usize> {
        self.start as usize..self.end as usize
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
