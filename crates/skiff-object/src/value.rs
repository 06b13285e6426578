use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};

use crate::function::{Builtin, CompiledFunction, FreeCell, HostFunction};
use crate::iterator::ValueIterator;
use crate::sync::{Channel, Method, Routine};
use crate::RuntimeError;

/// Maximum length of a string value in bytes.
pub const MAX_STRING_LEN: usize = 2_147_483_647;
/// Maximum length of a bytes value.
pub const MAX_BYTES_LEN: usize = 2_147_483_647;

/// Storage shared by `Array` and `ImmutableArray`.
pub type ArrayRef = Arc<RwLock<Vec<Value>>>;
/// Storage shared by `Map` and `ImmutableMap`.
pub type MapRef = Arc<RwLock<IndexMap<String, Value>>>;

/// A runtime value.
///
/// Scalars are stored inline. Arrays and maps are reference types: cloning a
/// `Value::Array` clones the handle, so both copies see the same elements
/// until `copy()` is used.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    String(Arc<str>),
    Bytes(Arc<[u8]>),
    Array(ArrayRef),
    /// Read-only view over array storage. Nested values keep their own
    /// mutability.
    ImmutableArray(ArrayRef),
    Map(MapRef),
    ImmutableMap(MapRef),
    /// A script-level error wrapping one value.
    Error(Arc<Value>),
    Time(SystemTime),
    Function(Arc<CompiledFunction>),
    Builtin(Builtin),
    Host(Arc<HostFunction>),
    /// A method bound to its receiver, e.g. `ch.send`.
    Method(Arc<Method>),
    Iterator(Arc<Mutex<ValueIterator>>),
    Routine(Arc<Routine>),
    Channel(Arc<Channel>),
    /// A captured local living in a stack slot. Never visible to scripts.
    Cell(FreeCell),
}

impl Value {
    // ---
    // Constructors
    // ---

    pub fn string(s: impl Into<Arc<str>>) -> Result<Value, RuntimeError> {
        let s = s.into();
        if s.len() > MAX_STRING_LEN {
            return Err(RuntimeError::StringLimit);
        }
        Ok(Value::String(s))
    }

    pub fn bytes(b: impl Into<Arc<[u8]>>) -> Result<Value, RuntimeError> {
        let b = b.into();
        if b.len() > MAX_BYTES_LEN {
            return Err(RuntimeError::BytesLimit);
        }
        Ok(Value::Bytes(b))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Arc::new(RwLock::new(items)))
    }

    pub fn immutable_array(items: Vec<Value>) -> Value {
        Value::ImmutableArray(Arc::new(RwLock::new(items)))
    }

    pub fn map(entries: IndexMap<String, Value>) -> Value {
        Value::Map(Arc::new(RwLock::new(entries)))
    }

    pub fn immutable_map(entries: IndexMap<String, Value>) -> Value {
        Value::ImmutableMap(Arc::new(RwLock::new(entries)))
    }

    pub fn error(value: Value) -> Value {
        Value::Error(Arc::new(value))
    }

    /// An error value carrying a message string.
    pub fn error_message(message: impl Into<Arc<str>>) -> Value {
        Value::error(Value::String(message.into()))
    }

    // ---
    // Introspection
    // ---

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Char(_) => "char",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::ImmutableArray(_) => "immutable-array",
            Value::Map(_) => "map",
            Value::ImmutableMap(_) => "immutable-map",
            Value::Error(_) => "error",
            Value::Time(_) => "time",
            Value::Function(_) => "compiled-function",
            Value::Builtin(_) => "builtin-function",
            Value::Host(_) => "host-function",
            Value::Method(_) => "method",
            Value::Iterator(_) => "iterator",
            Value::Routine(_) => "routine",
            Value::Channel(_) => "channel",
            Value::Cell(_) => "free-variable",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Value::Function(_) | Value::Builtin(_) | Value::Host(_) | Value::Method(_)
        )
    }

    pub fn is_iterable(&self) -> bool {
        matches!(
            self,
            Value::Array(_)
                | Value::ImmutableArray(_)
                | Value::Map(_)
                | Value::ImmutableMap(_)
                | Value::String(_)
                | Value::Bytes(_)
        )
    }

    /// Falsy values: `false`, `0`, `NaN`, `'\0'`, empty strings and
    /// containers, `undefined` and every error.
    pub fn is_falsy(&self) -> bool {
        match self {
            Value::Undefined | Value::Error(_) => true,
            Value::Bool(b) => !b,
            Value::Int(i) => *i == 0,
            Value::Float(f) => f.is_nan(),
            Value::Char(c) => *c == '\0',
            Value::String(s) => s.is_empty(),
            Value::Bytes(b) => b.is_empty(),
            Value::Array(a) | Value::ImmutableArray(a) => a.read().is_empty(),
            Value::Map(m) | Value::ImmutableMap(m) => m.read().is_empty(),
            Value::Time(t) => *t == SystemTime::UNIX_EPOCH,
            Value::Cell(cell) => cell.get().is_falsy(),
            _ => false,
        }
    }

    pub fn is_truthy(&self) -> bool {
        !self.is_falsy()
    }

    // ---
    // Copy semantics
    // ---

    /// Deep copy. Containers get fresh storage all the way down; everything
    /// else is immutable and is shared.
    pub fn copy(&self) -> Value {
        match self {
            Value::Array(a) | Value::ImmutableArray(a) => {
                let items = a.read().iter().map(Value::copy).collect();
                Value::array(items)
            }
            Value::Map(m) | Value::ImmutableMap(m) => {
                let entries = m
                    .read()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.copy()))
                    .collect();
                Value::map(entries)
            }
            Value::Error(inner) => Value::error(inner.copy()),
            Value::Cell(cell) => cell.get().copy(),
            other => other.clone(),
        }
    }

    /// Read-only view over the same storage. Scalars are returned as is.
    pub fn immutable(&self) -> Value {
        match self {
            Value::Array(a) => Value::ImmutableArray(a.clone()),
            Value::Map(m) => Value::ImmutableMap(m.clone()),
            other => other.clone(),
        }
    }

    /// Unwrap a captured local to the value it holds.
    pub fn deref_cell(self) -> Value {
        match self {
            Value::Cell(cell) => cell.get(),
            other => other,
        }
    }

    /// Text used by `string()` and string concatenation: strings and chars
    /// unquoted, everything else as displayed.
    pub fn to_text(&self) -> String {
        match self {
            Value::String(s) => s.to_string(),
            Value::Char(c) => c.to_string(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            other => other.to_string(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (
                Value::Array(a) | Value::ImmutableArray(a),
                Value::Array(b) | Value::ImmutableArray(b),
            ) => Arc::ptr_eq(a, b) || *a.read() == *b.read(),
            (
                Value::Map(a) | Value::ImmutableMap(a),
                Value::Map(b) | Value::ImmutableMap(b),
            ) => {
                if Arc::ptr_eq(a, b) {
                    return true;
                }
                let (a, b) = (a.read(), b.read());
                a.len() == b.len() && a.iter().all(|(k, v)| b.get(k) == Some(v))
            }
            (Value::Error(a), Value::Error(b)) => a == b,
            (Value::Time(a), Value::Time(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Host(a), Value::Host(b)) => Arc::ptr_eq(a, b),
            (Value::Method(a), Value::Method(b)) => Arc::ptr_eq(a, b),
            (Value::Iterator(a), Value::Iterator(b)) => Arc::ptr_eq(a, b),
            (Value::Routine(a), Value::Routine(b)) => Arc::ptr_eq(a, b),
            (Value::Channel(a), Value::Channel(b)) => Arc::ptr_eq(a, b),
            (Value::Cell(a), Value::Cell(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "<undefined>"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Char(c) => write!(f, "{}", c),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "{:?}", b),
            Value::Array(a) | Value::ImmutableArray(a) => {
                write!(f, "[")?;
                for (i, item) in a.read().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(m) | Value::ImmutableMap(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.read().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Error(inner) => write!(f, "error: {}", inner),
            Value::Time(t) => match t.duration_since(SystemTime::UNIX_EPOCH) {
                Ok(d) => write!(f, "time({}.{:09})", d.as_secs(), d.subsec_nanos()),
                Err(e) => write!(f, "time(-{:?})", e.duration()),
            },
            Value::Function(_) => write!(f, "<compiled-function>"),
            Value::Builtin(b) => write!(f, "<builtin-function:{}>", b.name()),
            Value::Host(h) => write!(f, "<host-function:{}>", h.name),
            Value::Method(m) => write!(f, "<method:{}>", m.name()),
            Value::Iterator(_) => write!(f, "<iterator>"),
            Value::Routine(_) => write!(f, "<routine>"),
            Value::Channel(_) => write!(f, "<channel>"),
            Value::Cell(cell) => write!(f, "{}", cell.get()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.type_name(), self)
    }
}

// ---
// Host conversions
// ---

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<char> for Value {
    fn from(v: char) -> Self {
        Value::Char(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(Arc::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(Arc::from(v))
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::array(v)
    }
}

impl From<HostFunction> for Value {
    fn from(v: HostFunction) -> Self {
        Value::Host(Arc::new(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_semantics() {
        let a = Value::array(vec![Value::Int(1), Value::Int(2)]);
        let alias = a.clone();
        if let Value::Array(items) = &a {
            items.write()[0] = Value::Int(5);
        }
        match &alias {
            Value::Array(items) => assert_eq!(items.read()[0], Value::Int(5)),
            other => panic!("expected array, got {:?}", other),
        }
    }

    #[test]
    fn test_copy_breaks_aliasing() {
        let inner = Value::array(vec![Value::Int(1)]);
        let outer = Value::array(vec![inner.clone()]);
        let copied = outer.copy();
        if let Value::Array(items) = &inner {
            items.write().push(Value::Int(2));
        }
        assert_eq!(copied, Value::array(vec![Value::array(vec![Value::Int(1)])]));
        assert_ne!(copied, outer);
    }

    #[test]
    fn test_immutable_shares_storage() {
        let a = Value::array(vec![Value::Int(1)]);
        let frozen = a.immutable();
        if let Value::Array(items) = &a {
            items.write().push(Value::Int(2));
        }
        match frozen {
            Value::ImmutableArray(items) => assert_eq!(items.read().len(), 2),
            other => panic!("expected immutable array, got {:?}", other),
        }
    }

    #[test]
    fn test_falsy() {
        assert!(Value::Undefined.is_falsy());
        assert!(Value::Int(0).is_falsy());
        assert!(Value::from("").is_falsy());
        assert!(Value::array(vec![]).is_falsy());
        assert!(Value::error(Value::Int(1)).is_falsy());
        assert!(Value::Float(f64::NAN).is_falsy());
        assert!(Value::Int(3).is_truthy());
        assert!(Value::from("x").is_truthy());
    }

    #[test]
    fn test_equality() {
        assert_eq!(Value::Int(1), Value::Int(1));
        assert_ne!(Value::Int(1), Value::Float(1.0));
        assert_eq!(
            Value::array(vec![Value::from("a")]),
            Value::immutable_array(vec![Value::from("a")])
        );
        let mut m1 = IndexMap::new();
        m1.insert("a".to_string(), Value::Int(1));
        m1.insert("b".to_string(), Value::Int(2));
        let mut m2 = IndexMap::new();
        m2.insert("b".to_string(), Value::Int(2));
        m2.insert("a".to_string(), Value::Int(1));
        assert_eq!(Value::map(m1), Value::map(m2));
    }

    #[test]
    fn test_display() {
        let v = Value::array(vec![Value::Int(1), Value::from("x"), Value::Undefined]);
        assert_eq!(v.to_string(), r#"[1, "x", <undefined>]"#);
        assert_eq!(Value::from("x").to_text(), "x");
        assert_eq!(Value::error(Value::from("bad")).to_string(), r#"error: "bad""#);
        assert_eq!(Value::Float(1.5).to_string(), "1.5");
    }

    #[test]
    fn test_string_limit() {
        assert!(Value::string("ok").is_ok());
    }
}
