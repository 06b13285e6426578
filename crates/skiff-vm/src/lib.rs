//! The Skiff virtual machine.
//!
//! Executes [`skiff_compiler::Bytecode`] on a value stack, with builtins and
//! the routine/channel concurrency layer.

mod builtins;
mod format;
pub mod vm;

pub use vm::{Vm, VmConfig, VmError};
