//! Bytecode compiler for Skiff.
//!
//! Takes a parsed [`skiff_parser::File`] and produces [`Bytecode`]: a main
//! function plus a shared constant pool. Imported modules are compiled into
//! the same pool.

pub mod bytecode;
pub mod compiler;
pub mod modules;
pub mod opcode;
pub mod optimizer;
pub mod symbol_table;

pub use bytecode::{format_instructions, Bytecode};
pub use compiler::{CompileError, CompileErrorKind, Compiler};
pub use modules::{CompilerOptions, Module, ModuleMap};
pub use opcode::{OpCode, CALL_KWARGS, CALL_SPREAD_ARGS, CALL_SPREAD_KWARGS};
pub use symbol_table::{Symbol, SymbolScope, SymbolTable};
