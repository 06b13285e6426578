//! Runtime object model for Skiff.
//!
//! Every value a script can touch is a [`Value`]. Containers are shared by
//! reference behind `parking_lot` locks so values can cross into spawned
//! routines.

pub mod convert;
mod error;
mod function;
mod iterator;
mod ops;
mod sync;
mod value;

pub use error::RuntimeError;
pub use function::{Builtin, CompiledFunction, FreeCell, HostFunction, Kwargs, NativeFn, SourceMap};
pub use iterator::ValueIterator;
pub use ops::Operator;
pub use sync::{CancelToken, Channel, Method, Routine};
pub use value::{ArrayRef, MapRef, Value, MAX_BYTES_LEN, MAX_STRING_LEN};
