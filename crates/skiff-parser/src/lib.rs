pub mod ast;
pub mod parser;
mod precedence;

pub use ast::*;
pub use parser::{parse, ParseError, Parser, MAX_ERRORS};
pub use precedence::Precedence;
