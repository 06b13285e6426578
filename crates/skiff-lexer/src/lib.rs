mod lexer;
mod literal;
mod source;
mod span;
mod token;

pub use lexer::Lexer;
pub use literal::{parse_char, parse_float, parse_int, parse_raw_string, parse_string, LiteralError};
pub use source::{SourceFile, SourceFileSet, SourcePosition};
pub use span::Span;
pub use token::{Token, TokenKind};
