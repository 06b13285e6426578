//! Operator, index and slice contracts for [`Value`].

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::sync::Method;
use crate::value::{MAX_BYTES_LEN, MAX_STRING_LEN};
use crate::{RuntimeError, Value};

/// Binary operators handled by `Value::binary_op`. The discriminant is the
/// operand of the `BinaryOp` instruction. Equality has its own opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Operator {
    Add,
    Sub,
    Mul,
    Quo,
    Rem,
    And,
    Or,
    Xor,
    AndNot,
    Shl,
    Shr,
    Less,
    Greater,
    LessEq,
    GreaterEq,
}

impl Operator {
    pub const ALL: [Operator; 15] = [
        Operator::Add,
        Operator::Sub,
        Operator::Mul,
        Operator::Quo,
        Operator::Rem,
        Operator::And,
        Operator::Or,
        Operator::Xor,
        Operator::AndNot,
        Operator::Shl,
        Operator::Shr,
        Operator::Less,
        Operator::Greater,
        Operator::LessEq,
        Operator::GreaterEq,
    ];

    pub fn from_u8(byte: u8) -> Option<Operator> {
        Self::ALL.get(byte as usize).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Add => "+",
            Operator::Sub => "-",
            Operator::Mul => "*",
            Operator::Quo => "/",
            Operator::Rem => "%",
            Operator::And => "&",
            Operator::Or => "|",
            Operator::Xor => "^",
            Operator::AndNot => "&^",
            Operator::Shl => "<<",
            Operator::Shr => ">>",
            Operator::Less => "<",
            Operator::Greater => ">",
            Operator::LessEq => "<=",
            Operator::GreaterEq => ">=",
        }
    }

    fn compare<T: PartialOrd>(self, a: T, b: T) -> Option<bool> {
        Some(match self {
            Operator::Less => a < b,
            Operator::Greater => a > b,
            Operator::LessEq => a <= b,
            Operator::GreaterEq => a >= b,
            _ => return None,
        })
    }
}

fn int_op(op: Operator, a: i64, b: i64) -> Result<Option<Value>, RuntimeError> {
    let v = match op {
        Operator::Add => a.wrapping_add(b),
        Operator::Sub => a.wrapping_sub(b),
        Operator::Mul => a.wrapping_mul(b),
        Operator::Quo => {
            if b == 0 {
                return Err(RuntimeError::DivisionByZero);
            }
            a.wrapping_div(b)
        }
        Operator::Rem => {
            if b == 0 {
                return Err(RuntimeError::DivisionByZero);
            }
            a.wrapping_rem(b)
        }
        Operator::And => a & b,
        Operator::Or => a | b,
        Operator::Xor => a ^ b,
        Operator::AndNot => a & !b,
        Operator::Shl => {
            if b < 0 {
                return Err(RuntimeError::NegativeShift(b));
            }
            if b >= 64 {
                0
            } else {
                a << b
            }
        }
        Operator::Shr => {
            if b < 0 {
                return Err(RuntimeError::NegativeShift(b));
            }
            if b >= 64 {
                if a < 0 {
                    -1
                } else {
                    0
                }
            } else {
                a >> b
            }
        }
        cmp => return Ok(cmp.compare(a, b).map(Value::Bool)),
    };
    Ok(Some(Value::Int(v)))
}

fn float_op(op: Operator, a: f64, b: f64) -> Option<Value> {
    Some(Value::Float(match op {
        Operator::Add => a + b,
        Operator::Sub => a - b,
        Operator::Mul => a * b,
        Operator::Quo => a / b,
        cmp => return cmp.compare(a, b).map(Value::Bool),
    }))
}

fn offset_time(t: SystemTime, nanos: i64) -> SystemTime {
    let d = Duration::from_nanos(nanos.unsigned_abs());
    if nanos >= 0 {
        t.checked_add(d).unwrap_or(t)
    } else {
        t.checked_sub(d).unwrap_or(t)
    }
}

fn time_diff_nanos(a: SystemTime, b: SystemTime) -> i64 {
    match a.duration_since(b) {
        Ok(d) => d.as_nanos() as i64,
        Err(e) => -(e.duration().as_nanos() as i64),
    }
}

fn concat_strings(a: &str, b: &str) -> Result<Value, RuntimeError> {
    if a.len() + b.len() > MAX_STRING_LEN {
        return Err(RuntimeError::StringLimit);
    }
    let mut s = String::with_capacity(a.len() + b.len());
    s.push_str(a);
    s.push_str(b);
    Ok(Value::String(s.into()))
}

/// Resolve a script index into a position inside `len`, or `None` when it
/// falls outside.
fn position(index: i64, len: usize) -> Option<usize> {
    usize::try_from(index).ok().filter(|&i| i < len)
}

impl Value {
    /// Apply a binary operator. Unsupported operand pairs are reported as
    /// `invalid operation: <left> <op> <right>`.
    pub fn binary_op(&self, op: Operator, rhs: &Value) -> Result<Value, RuntimeError> {
        let result = match (self, rhs) {
            (Value::Int(a), Value::Int(b)) => int_op(op, *a, *b)?,
            (Value::Int(a), Value::Float(b)) => float_op(op, *a as f64, *b),
            (Value::Float(a), Value::Int(b)) => float_op(op, *a, *b as f64),
            (Value::Float(a), Value::Float(b)) => float_op(op, *a, *b),
            (Value::Int(a), Value::Char(b)) => match op {
                Operator::Add => char::from_u32((*a as u32).wrapping_add(*b as u32)).map(Value::Char),
                cmp => cmp.compare(*a, *b as i64).map(Value::Bool),
            },
            (Value::Char(a), Value::Int(b)) => match op {
                Operator::Add => char::from_u32((*a as i64).wrapping_add(*b) as u32).map(Value::Char),
                Operator::Sub => char::from_u32((*a as i64).wrapping_sub(*b) as u32).map(Value::Char),
                cmp => cmp.compare(*a as i64, *b).map(Value::Bool),
            },
            (Value::Char(a), Value::Char(b)) => match op {
                Operator::Sub => Some(Value::Int(*a as i64 - *b as i64)),
                cmp => cmp.compare(a, b).map(Value::Bool),
            },
            (Value::String(a), Value::String(b)) => match op {
                Operator::Add => Some(concat_strings(a, b)?),
                cmp => cmp.compare(a, b).map(Value::Bool),
            },
            (Value::String(a), other) if op == Operator::Add => {
                Some(concat_strings(a, &other.to_text())?)
            }
            (Value::Bytes(a), Value::Bytes(b)) if op == Operator::Add => {
                if a.len() + b.len() > MAX_BYTES_LEN {
                    return Err(RuntimeError::BytesLimit);
                }
                let joined: Arc<[u8]> = a.iter().chain(b.iter()).copied().collect();
                Some(Value::Bytes(joined))
            }
            (
                Value::Array(a) | Value::ImmutableArray(a),
                Value::Array(b) | Value::ImmutableArray(b),
            ) if op == Operator::Add => {
                let mut items = a.read().clone();
                items.extend(b.read().iter().cloned());
                Some(Value::array(items))
            }
            (Value::Time(t), Value::Int(n)) => match op {
                Operator::Add => Some(Value::Time(offset_time(*t, *n))),
                Operator::Sub => Some(Value::Time(offset_time(*t, n.wrapping_neg()))),
                _ => None,
            },
            (Value::Time(a), Value::Time(b)) => match op {
                Operator::Sub => Some(Value::Int(time_diff_nanos(*a, *b))),
                cmp => cmp.compare(a, b).map(Value::Bool),
            },
            (Value::Cell(cell), rhs) => return cell.get().binary_op(op, rhs),
            (lhs, Value::Cell(cell)) => return lhs.binary_op(op, &cell.get()),
            _ => None,
        };
        result.ok_or(RuntimeError::InvalidOperator {
            op: op.as_str(),
            left: self.type_name(),
            right: rhs.type_name(),
        })
    }

    /// Unary `-x`.
    pub fn negate(&self) -> Result<Value, RuntimeError> {
        match self {
            Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(RuntimeError::InvalidUnaryOperator {
                op: "-",
                operand: other.type_name(),
            }),
        }
    }

    /// Unary `^x`.
    pub fn complement(&self) -> Result<Value, RuntimeError> {
        match self {
            Value::Int(i) => Ok(Value::Int(!i)),
            other => Err(RuntimeError::InvalidUnaryOperator {
                op: "^",
                operand: other.type_name(),
            }),
        }
    }

    // ---
    // Indexing
    // ---

    /// `x[index]`. Missing elements read as `undefined`.
    pub fn index_get(&self, index: &Value) -> Result<Value, RuntimeError> {
        match self {
            Value::Array(items) | Value::ImmutableArray(items) => match index {
                Value::Int(i) => {
                    let items = items.read();
                    Ok(position(*i, items.len())
                        .map(|i| items[i].clone())
                        .unwrap_or_default())
                }
                other => Err(RuntimeError::InvalidIndexType(other.type_name())),
            },
            Value::Bytes(bytes) => match index {
                Value::Int(i) => Ok(position(*i, bytes.len())
                    .map(|i| Value::Int(bytes[i] as i64))
                    .unwrap_or_default()),
                other => Err(RuntimeError::InvalidIndexType(other.type_name())),
            },
            Value::String(s) => match index {
                Value::Int(i) => Ok(usize::try_from(*i)
                    .ok()
                    .and_then(|i| s.chars().nth(i))
                    .map(Value::Char)
                    .unwrap_or_default()),
                other => Err(RuntimeError::InvalidIndexType(other.type_name())),
            },
            Value::Map(map) | Value::ImmutableMap(map) => match index {
                Value::String(key) => Ok(map.read().get(&**key).cloned().unwrap_or_default()),
                other => Err(RuntimeError::InvalidIndexType(other.type_name())),
            },
            Value::Error(inner) => match index {
                Value::String(key) if &**key == "value" => Ok((**inner).clone()),
                _ => Err(RuntimeError::InvalidIndexOnError),
            },
            Value::Routine(routine) => match index {
                Value::String(name) => Ok(Method::for_routine(routine, name)
                    .map(|m| Value::Method(Arc::new(m)))
                    .unwrap_or_default()),
                other => Err(RuntimeError::InvalidIndexType(other.type_name())),
            },
            Value::Channel(channel) => match index {
                Value::String(name) => Ok(Method::for_channel(channel, name)
                    .map(|m| Value::Method(Arc::new(m)))
                    .unwrap_or_default()),
                other => Err(RuntimeError::InvalidIndexType(other.type_name())),
            },
            Value::Undefined => Ok(Value::Undefined),
            Value::Cell(cell) => cell.get().index_get(index),
            other => Err(RuntimeError::NotIndexable(other.type_name())),
        }
    }

    /// `x[index] = value`. Only mutable arrays and maps accept this.
    pub fn index_set(&self, index: &Value, value: Value) -> Result<(), RuntimeError> {
        match self {
            Value::Array(items) => match index {
                Value::Int(i) => {
                    let mut items = items.write();
                    let pos = position(*i, items.len()).ok_or(RuntimeError::IndexOutOfBounds)?;
                    items[pos] = value;
                    Ok(())
                }
                other => Err(RuntimeError::InvalidIndexType(other.type_name())),
            },
            Value::Map(map) => match index {
                Value::String(key) => {
                    map.write().insert(key.to_string(), value);
                    Ok(())
                }
                other => Err(RuntimeError::InvalidIndexType(other.type_name())),
            },
            Value::Cell(cell) => cell.get().index_set(index, value),
            other => Err(RuntimeError::NotIndexAssignable(other.type_name())),
        }
    }

    /// `x[low:high]`. Either bound may be `undefined`. Bounds are clamped to
    /// the length; `low > high` is an error.
    pub fn slice(&self, low: &Value, high: &Value) -> Result<Value, RuntimeError> {
        let len = match self {
            Value::Array(items) | Value::ImmutableArray(items) => items.read().len(),
            Value::String(s) => s.chars().count(),
            Value::Bytes(b) => b.len(),
            Value::Cell(cell) => return cell.get().slice(low, high),
            other => return Err(RuntimeError::NotSliceable(other.type_name())),
        };
        let bound = |v: &Value, default: usize| -> Result<usize, RuntimeError> {
            match v {
                Value::Undefined => Ok(default),
                Value::Int(i) => Ok((*i).clamp(0, len as i64) as usize),
                other => Err(RuntimeError::InvalidIndexType(other.type_name())),
            }
        };
        let lo = bound(low, 0)?;
        let hi = bound(high, len)?;
        if lo > hi {
            return Err(RuntimeError::InvalidSliceIndex(lo as i64, hi as i64));
        }
        Ok(match self {
            Value::Array(items) | Value::ImmutableArray(items) => {
                Value::array(items.read()[lo..hi].to_vec())
            }
            Value::String(s) => {
                let sliced: String = s.chars().skip(lo).take(hi - lo).collect();
                Value::String(sliced.into())
            }
            Value::Bytes(b) => Value::Bytes(b[lo..hi].into()),
            _ => Value::Undefined,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    #[test]
    fn test_int_arithmetic() {
        let r = Value::Int(7).binary_op(Operator::Quo, &Value::Int(2)).unwrap();
        assert_eq!(r, Value::Int(3));
        let r = Value::Int(i64::MAX).binary_op(Operator::Add, &Value::Int(1)).unwrap();
        assert_eq!(r, Value::Int(i64::MIN));
        let r = Value::Int(1).binary_op(Operator::Add, &Value::Float(0.5)).unwrap();
        assert_eq!(r, Value::Float(1.5));
        assert_eq!(
            Value::Int(1).binary_op(Operator::Quo, &Value::Int(0)),
            Err(RuntimeError::DivisionByZero)
        );
        assert_eq!(
            Value::Int(1).binary_op(Operator::Shl, &Value::Int(-1)),
            Err(RuntimeError::NegativeShift(-1))
        );
    }

    #[test]
    fn test_comparison() {
        let r = Value::Int(1).binary_op(Operator::Less, &Value::Int(2)).unwrap();
        assert_eq!(r, Value::Bool(true));
        let r = Value::from("b").binary_op(Operator::Greater, &Value::from("a")).unwrap();
        assert_eq!(r, Value::Bool(true));
    }

    #[test]
    fn test_string_concat() {
        let r = Value::from("n=").binary_op(Operator::Add, &Value::Int(3)).unwrap();
        assert_eq!(r, Value::from("n=3"));
        let r = Value::from("c").binary_op(Operator::Add, &Value::Char('d')).unwrap();
        assert_eq!(r, Value::from("cd"));
    }

    #[test]
    fn test_invalid_operator_names_types() {
        let err = Value::Bool(true)
            .binary_op(Operator::Add, &Value::Int(1))
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid operation: bool + int");
    }

    #[test]
    fn test_index_get_out_of_range_is_undefined() {
        let a = Value::array(vec![Value::Int(1)]);
        assert_eq!(a.index_get(&Value::Int(5)).unwrap(), Value::Undefined);
        assert_eq!(a.index_get(&Value::Int(-1)).unwrap(), Value::Undefined);
        assert!(a.index_get(&Value::from("x")).is_err());
    }

    #[test]
    fn test_index_set() {
        let a = Value::array(vec![Value::Int(1)]);
        a.index_set(&Value::Int(0), Value::Int(9)).unwrap();
        assert_eq!(a.index_get(&Value::Int(0)).unwrap(), Value::Int(9));
        assert_eq!(
            a.index_set(&Value::Int(3), Value::Int(0)),
            Err(RuntimeError::IndexOutOfBounds)
        );
        let frozen = a.immutable();
        let err = frozen.index_set(&Value::Int(0), Value::Int(1)).unwrap_err();
        assert_eq!(err.to_string(), "not index-assignable: immutable-array");
    }

    #[test]
    fn test_map_index() {
        let m = Value::map(IndexMap::new());
        m.index_set(&Value::from("a"), Value::Int(1)).unwrap();
        assert_eq!(m.index_get(&Value::from("a")).unwrap(), Value::Int(1));
        assert_eq!(m.index_get(&Value::from("b")).unwrap(), Value::Undefined);
    }

    #[test]
    fn test_error_value_index() {
        let e = Value::error(Value::Int(4));
        assert_eq!(e.index_get(&Value::from("value")).unwrap(), Value::Int(4));
        assert_eq!(
            e.index_get(&Value::from("other")),
            Err(RuntimeError::InvalidIndexOnError)
        );
    }

    #[test]
    fn test_slice_clamps() {
        let a = Value::array((0..5).map(Value::Int).collect());
        let s = a.slice(&Value::Int(-3), &Value::Int(2)).unwrap();
        assert_eq!(s, Value::array(vec![Value::Int(0), Value::Int(1)]));
        let s = a.slice(&Value::Int(3), &Value::Undefined).unwrap();
        assert_eq!(s, Value::array(vec![Value::Int(3), Value::Int(4)]));
        assert!(a.slice(&Value::Int(4), &Value::Int(2)).is_err());
        let s = Value::from("héllo").slice(&Value::Int(1), &Value::Int(3)).unwrap();
        assert_eq!(s, Value::from("él"));
        assert!(Value::Int(1).slice(&Value::Undefined, &Value::Undefined).is_err());
    }
}
