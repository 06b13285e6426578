use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use skiff_lexer::Span;

use crate::{RuntimeError, Value};

/// Keyword arguments handed to native functions.
pub type Kwargs = IndexMap<String, Value>;

/// Instruction offset to source span, sparse.
pub type SourceMap = BTreeMap<usize, Span>;

// ---
// Free variables
// ---

/// A shared cell holding one captured variable.
///
/// Every closure capturing the same variable holds a clone of the same cell,
/// so writes through one closure are seen by the others and by the frame that
/// owns the variable. Cells only ever point at values, never at other cells,
/// so they cannot form reference cycles on their own.
#[derive(Clone, Default)]
pub struct FreeCell(Arc<RwLock<Value>>);

impl FreeCell {
    pub fn new(value: Value) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }

    pub fn get(&self) -> Value {
        self.0.read().clone()
    }

    pub fn set(&self, value: Value) {
        *self.0.write() = value;
    }

    pub fn ptr_eq(&self, other: &FreeCell) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for FreeCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FreeCell({:?})", self.get())
    }
}

// ---
// Compiled functions
// ---

/// A compiled function body. Instructions and the source map are shared
/// between a function constant and every closure created from it.
#[derive(Clone, Default)]
pub struct CompiledFunction {
    pub instructions: Arc<[u8]>,
    pub num_locals: usize,
    pub num_parameters: usize,
    pub var_args: bool,
    pub source_map: Arc<SourceMap>,
    /// Cells bound when the closure was created. Empty for plain functions.
    pub free: Vec<FreeCell>,
}

impl CompiledFunction {
    pub fn new(
        instructions: Vec<u8>,
        num_locals: usize,
        num_parameters: usize,
        var_args: bool,
        source_map: SourceMap,
    ) -> Self {
        Self {
            instructions: instructions.into(),
            num_locals,
            num_parameters,
            var_args,
            source_map: Arc::new(source_map),
            free: Vec::new(),
        }
    }

    /// Create a closure sharing this function's code.
    pub fn with_free(&self, free: Vec<FreeCell>) -> Self {
        Self {
            instructions: self.instructions.clone(),
            num_locals: self.num_locals,
            num_parameters: self.num_parameters,
            var_args: self.var_args,
            source_map: self.source_map.clone(),
            free,
        }
    }

    /// Source span of the instruction at (or closest before) `ip`.
    pub fn source_pos(&self, ip: usize) -> Option<Span> {
        self.source_map.range(..=ip).next_back().map(|(_, span)| *span)
    }
}

impl fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("instructions", &self.instructions.len())
            .field("num_locals", &self.num_locals)
            .field("num_parameters", &self.num_parameters)
            .field("var_args", &self.var_args)
            .field("free", &self.free.len())
            .finish()
    }
}

// ---
// Host functions
// ---

pub type NativeFn = dyn Fn(&[Value], &Kwargs) -> Result<Value, RuntimeError> + Send + Sync;

/// A function implemented by the embedding program.
///
/// Returning `Err` aborts the VM. Return `Ok(Value::Error(..))` to report a
/// failure the script can inspect.
pub struct HostFunction {
    pub name: String,
    func: Box<NativeFn>,
}

impl HostFunction {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&[Value], &Kwargs) -> Result<Value, RuntimeError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }

    pub fn call(&self, args: &[Value], kwargs: &Kwargs) -> Result<Value, RuntimeError> {
        (self.func)(args, kwargs)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFunction({})", self.name)
    }
}

// ---
// Builtins
// ---

/// Functions every script can reach through the builtin scope. The
/// discriminant is the operand of `GetBuiltin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Builtin {
    Len,
    Copy,
    Append,
    Delete,
    Splice,
    TypeName,
    Format,
    Range,
    String,
    Int,
    Bool,
    Float,
    Char,
    Bytes,
    Time,
    IsInt,
    IsFloat,
    IsString,
    IsBool,
    IsChar,
    IsBytes,
    IsArray,
    IsImmutableArray,
    IsMap,
    IsImmutableMap,
    IsIterable,
    IsTime,
    IsError,
    IsUndefined,
    IsFunction,
    IsCallable,
    Spawn,
    MakeChannel,
}

impl Builtin {
    pub const ALL: [Builtin; 33] = [
        Builtin::Len,
        Builtin::Copy,
        Builtin::Append,
        Builtin::Delete,
        Builtin::Splice,
        Builtin::TypeName,
        Builtin::Format,
        Builtin::Range,
        Builtin::String,
        Builtin::Int,
        Builtin::Bool,
        Builtin::Float,
        Builtin::Char,
        Builtin::Bytes,
        Builtin::Time,
        Builtin::IsInt,
        Builtin::IsFloat,
        Builtin::IsString,
        Builtin::IsBool,
        Builtin::IsChar,
        Builtin::IsBytes,
        Builtin::IsArray,
        Builtin::IsImmutableArray,
        Builtin::IsMap,
        Builtin::IsImmutableMap,
        Builtin::IsIterable,
        Builtin::IsTime,
        Builtin::IsError,
        Builtin::IsUndefined,
        Builtin::IsFunction,
        Builtin::IsCallable,
        Builtin::Spawn,
        Builtin::MakeChannel,
    ];

    pub fn from_index(index: u8) -> Option<Builtin> {
        Self::ALL.get(index as usize).copied()
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Len => "len",
            Builtin::Copy => "copy",
            Builtin::Append => "append",
            Builtin::Delete => "delete",
            Builtin::Splice => "splice",
            Builtin::TypeName => "type_name",
            Builtin::Format => "format",
            Builtin::Range => "range",
            Builtin::String => "string",
            Builtin::Int => "int",
            Builtin::Bool => "bool",
            Builtin::Float => "float",
            Builtin::Char => "char",
            Builtin::Bytes => "bytes",
            Builtin::Time => "time",
            Builtin::IsInt => "is_int",
            Builtin::IsFloat => "is_float",
            Builtin::IsString => "is_string",
            Builtin::IsBool => "is_bool",
            Builtin::IsChar => "is_char",
            Builtin::IsBytes => "is_bytes",
            Builtin::IsArray => "is_array",
            Builtin::IsImmutableArray => "is_immutable_array",
            Builtin::IsMap => "is_map",
            Builtin::IsImmutableMap => "is_immutable_map",
            Builtin::IsIterable => "is_iterable",
            Builtin::IsTime => "is_time",
            Builtin::IsError => "is_error",
            Builtin::IsUndefined => "is_undefined",
            Builtin::IsFunction => "is_function",
            Builtin::IsCallable => "is_callable",
            Builtin::Spawn => "spawn",
            Builtin::MakeChannel => "make_channel",
        }
    }
}
