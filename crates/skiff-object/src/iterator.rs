use std::sync::Arc;

use crate::value::{ArrayRef, MapRef};
use crate::{RuntimeError, Value};

enum Source {
    Array(ArrayRef),
    Bytes(Arc<[u8]>),
    /// Keys are captured when the iterator is created; entries removed
    /// afterwards are skipped.
    Map { map: MapRef, keys: Vec<String> },
    String(Vec<char>),
}

/// Cursor behind `for k, v in x`.
///
/// `next()` must return `true` before `key()` or `value()` are meaningful.
pub struct ValueIterator {
    source: Source,
    /// Position of the current element plus one. Zero before the first call
    /// to `next()`.
    pos: usize,
    current: Option<(Value, Value)>,
}

impl ValueIterator {
    pub fn new(value: &Value) -> Result<Self, RuntimeError> {
        let source = match value {
            Value::Array(items) | Value::ImmutableArray(items) => Source::Array(items.clone()),
            Value::Bytes(bytes) => Source::Bytes(bytes.clone()),
            Value::Map(map) | Value::ImmutableMap(map) => {
                let keys = map.read().keys().cloned().collect();
                Source::Map {
                    map: map.clone(),
                    keys,
                }
            }
            Value::String(s) => Source::String(s.chars().collect()),
            Value::Cell(cell) => return Self::new(&cell.get()),
            other => return Err(RuntimeError::NotIterable(other.type_name())),
        };
        Ok(Self {
            source,
            pos: 0,
            current: None,
        })
    }

    /// Advance to the next element. Returns `false` once exhausted.
    pub fn next(&mut self) -> bool {
        loop {
            let i = self.pos;
            self.pos += 1;
            let entry = match &self.source {
                Source::Array(items) => {
                    let items = items.read();
                    match items.get(i) {
                        Some(v) => Some((Value::Int(i as i64), v.clone())),
                        None => None,
                    }
                }
                Source::Bytes(bytes) => bytes
                    .get(i)
                    .map(|b| (Value::Int(i as i64), Value::Int(*b as i64))),
                Source::String(chars) => chars
                    .get(i)
                    .map(|c| (Value::Int(i as i64), Value::Char(*c))),
                Source::Map { map, keys } => {
                    let Some(key) = keys.get(i) else {
                        self.current = None;
                        return false;
                    };
                    match map.read().get(key) {
                        Some(v) => Some((Value::from(key.as_str()), v.clone())),
                        // Removed while iterating.
                        None => continue,
                    }
                }
            };
            let more = entry.is_some();
            self.current = entry;
            return more;
        }
    }

    pub fn key(&self) -> Value {
        self.current.as_ref().map(|(k, _)| k.clone()).unwrap_or_default()
    }

    pub fn value(&self) -> Value {
        self.current.as_ref().map(|(_, v)| v.clone()).unwrap_or_default()
    }
}
