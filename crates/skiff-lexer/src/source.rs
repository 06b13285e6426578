use std::fmt;
use std::sync::Arc;

use crate::Span;

/// One source file registered in a [`SourceFileSet`].
#[derive(Debug, Clone)]
pub struct SourceFile {
    name: String,
    source: Arc<str>,
    /// Byte offset of the first character of every line.
    line_starts: Vec<u32>,
}

impl SourceFile {
    fn new(name: String, source: Arc<str>) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(
            source
                .bytes()
                .enumerate()
                .filter(|(_, b)| *b == b'\n')
                .map(|(i, _)| (i + 1) as u32),
        );
        Self {
            name,
            source,
            line_starts,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Number of lines in the file.
    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    /// 1-based line and column of a byte offset.
    pub fn line_col(&self, offset: u32) -> (usize, usize) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(line) => line,
            Err(next) => next - 1,
        };
        let column = (offset - self.line_starts[line]) as usize + 1;
        (line + 1, column)
    }
}

/// A resolved source location, used in runtime error traces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePosition {
    pub filename: String,
    pub line: usize,
    pub column: usize,
}

impl SourcePosition {
    /// Position used when a span cannot be resolved.
    pub fn unknown() -> Self {
        Self {
            filename: String::new(),
            line: 0,
            column: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.line > 0
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid() {
            return write!(f, "-");
        }
        if self.filename.is_empty() {
            write!(f, "{}:{}", self.line, self.column)
        } else {
            write!(f, "{}:{}:{}", self.filename, self.line, self.column)
        }
    }
}

/// All source files taking part in one compilation: the main file plus
/// every imported module. A span's `file_id` indexes into this set.
#[derive(Debug, Clone, Default)]
pub struct SourceFileSet {
    files: Vec<SourceFile>,
}

impl SourceFileSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file and return its id.
    pub fn add_file(&mut self, name: impl Into<String>, source: impl Into<Arc<str>>) -> u16 {
        self.files.push(SourceFile::new(name.into(), source.into()));
        (self.files.len() - 1) as u16
    }

    pub fn file(&self, file_id: u16) -> Option<&SourceFile> {
        self.files.get(file_id as usize)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn position(&self, span: Span) -> SourcePosition {
        match self.file(span.file_id) {
            Some(file) if (span.start as usize) <= file.source.len() => {
                let (line, column) = file.line_col(span.start);
                SourcePosition {
                    filename: file.name.clone(),
                    line,
                    column,
                }
            }
            _ => SourcePosition::unknown(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_col() {
        let mut set = SourceFileSet::new();
        let id = set.add_file("test.skf", "a := 1\nb := 2\n\nc");
        let file = set.file(id).unwrap();
        assert_eq!(file.line_count(), 4);
        assert_eq!(file.line_col(0), (1, 1));
        assert_eq!(file.line_col(5), (1, 6));
        assert_eq!(file.line_col(7), (2, 1));
        assert_eq!(file.line_col(15), (4, 1));
    }

    #[test]
    fn test_position_display() {
        let mut set = SourceFileSet::new();
        set.add_file("main.skf", "x\ny");
        let id = set.add_file("mod.skf", "foo\n  bar");
        let pos = set.position(Span::new(6, 9, id));
        assert_eq!(pos.to_string(), "mod.skf:2:3");

        let unnamed = {
            let mut set = SourceFileSet::new();
            set.add_file("", "abc");
            set.position(Span::new(1, 2, 0))
        };
        assert_eq!(unnamed.to_string(), "1:2");
    }

    #[test]
    fn test_unknown_file() {
        let set = SourceFileSet::new();
        let pos = set.position(Span::new(0, 1, 3));
        assert!(!pos.is_valid());
        assert_eq!(pos.to_string(), "-");
    }
}
