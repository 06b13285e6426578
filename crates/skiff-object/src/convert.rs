//! Loose conversions used by the conversion builtins and host code.
//!
//! Each returns `None` when the value has no sensible counterpart, letting
//! the caller fall back to a default.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::Value;

pub fn to_int(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::Float(f) => Some(*f as i64),
        Value::Char(c) => Some(*c as i64),
        Value::Bool(b) => Some(*b as i64),
        Value::String(s) => skiff_lexer::parse_int(s.trim()).ok(),
        Value::Time(t) => t
            .duration_since(SystemTime::UNIX_EPOCH)
            .ok()
            .map(|d| d.as_secs() as i64),
        _ => None,
    }
}

pub fn to_float(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Every value has a truth value.
pub fn to_bool(value: &Value) -> bool {
    value.is_truthy()
}

pub fn to_char(value: &Value) -> Option<char> {
    match value {
        Value::Char(c) => Some(*c),
        Value::Int(i) => u32::try_from(*i).ok().and_then(char::from_u32),
        Value::String(s) => {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Some(c),
                _ => None,
            }
        }
        _ => None,
    }
}

pub fn to_string(value: &Value) -> Option<String> {
    match value {
        Value::Undefined => None,
        other => Some(other.to_text()),
    }
}

pub fn to_bytes(value: &Value) -> Option<Arc<[u8]>> {
    match value {
        Value::Bytes(b) => Some(b.clone()),
        Value::String(s) => Some(s.as_bytes().into()),
        _ => None,
    }
}

/// Ints are read as seconds since the Unix epoch.
pub fn to_time(value: &Value) -> Option<SystemTime> {
    match value {
        Value::Time(t) => Some(*t),
        Value::Int(secs) if *secs >= 0 => {
            SystemTime::UNIX_EPOCH.checked_add(Duration::from_secs(*secs as u64))
        }
        _ => None,
    }
}
