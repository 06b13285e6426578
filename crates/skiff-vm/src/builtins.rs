//! Builtin functions, reachable from scripts through the builtin scope.

use std::sync::Arc;

use skiff_object::convert;
use skiff_object::{Builtin, Channel, Kwargs, RuntimeError, Value, MAX_BYTES_LEN};

use crate::format::format;
use crate::vm::Vm;

type Result<T> = std::result::Result<T, RuntimeError>;

pub(crate) fn call(vm: &Vm, builtin: Builtin, args: &[Value], kwargs: &Kwargs) -> Result<Value> {
    if !kwargs.is_empty() {
        return Err(RuntimeError::UnexpectedKeywordArguments);
    }
    match builtin {
        Builtin::Len => len(args),
        Builtin::Copy => {
            arity(args, 1)?;
            Ok(args[0].copy())
        }
        Builtin::Append => append(args),
        Builtin::Delete => delete(args),
        Builtin::Splice => splice(args),
        Builtin::TypeName => {
            arity(args, 1)?;
            Ok(Value::from(args[0].type_name()))
        }
        Builtin::Format => format(args),
        Builtin::Range => range(vm, args),

        Builtin::String => convert_with(args, |v| match convert::to_string(v) {
            Some(s) => Value::string(s).map(Some),
            None => Ok(None),
        }),
        Builtin::Int => convert_with(args, |v| Ok(convert::to_int(v).map(Value::Int))),
        Builtin::Float => convert_with(args, |v| Ok(convert::to_float(v).map(Value::Float))),
        Builtin::Char => convert_with(args, |v| Ok(convert::to_char(v).map(Value::Char))),
        Builtin::Bool => {
            arity(args, 1)?;
            Ok(Value::Bool(convert::to_bool(&args[0])))
        }
        Builtin::Bytes => convert_with(args, |v| match v {
            Value::Int(n) => {
                let n = usize::try_from(*n).unwrap_or(0);
                if n > MAX_BYTES_LEN {
                    return Err(RuntimeError::BytesLimit);
                }
                vm.charge(n)?;
                let mut buf = Vec::new();
                buf.try_reserve_exact(n)
                    .map_err(|_| RuntimeError::AllocationLimitExceeded)?;
                buf.resize(n, 0u8);
                Ok(Some(Value::Bytes(buf.into())))
            }
            other => Ok(convert::to_bytes(other).map(Value::Bytes)),
        }),
        Builtin::Time => convert_with(args, |v| Ok(convert::to_time(v).map(Value::Time))),

        Builtin::IsInt => is(args, |v| matches!(v, Value::Int(_))),
        Builtin::IsFloat => is(args, |v| matches!(v, Value::Float(_))),
        Builtin::IsString => is(args, |v| matches!(v, Value::String(_))),
        Builtin::IsBool => is(args, |v| matches!(v, Value::Bool(_))),
        Builtin::IsChar => is(args, |v| matches!(v, Value::Char(_))),
        Builtin::IsBytes => is(args, |v| matches!(v, Value::Bytes(_))),
        Builtin::IsArray => is(args, |v| matches!(v, Value::Array(_))),
        Builtin::IsImmutableArray => is(args, |v| matches!(v, Value::ImmutableArray(_))),
        Builtin::IsMap => is(args, |v| matches!(v, Value::Map(_))),
        Builtin::IsImmutableMap => is(args, |v| matches!(v, Value::ImmutableMap(_))),
        Builtin::IsIterable => is(args, Value::is_iterable),
        Builtin::IsTime => is(args, |v| matches!(v, Value::Time(_))),
        Builtin::IsError => is(args, |v| matches!(v, Value::Error(_))),
        Builtin::IsUndefined => is(args, Value::is_undefined),
        Builtin::IsFunction => is(args, |v| matches!(v, Value::Function(_))),
        Builtin::IsCallable => is(args, Value::is_callable),

        Builtin::Spawn => {
            let Some((callee, rest)) = args.split_first() else {
                return Err(RuntimeError::WrongNumArgumentsVariadic { want: 1, got: 0 });
            };
            tracing::debug!(args = rest.len(), "spawning routine");
            vm.spawn(callee.clone(), rest.to_vec())
        }
        Builtin::MakeChannel => make_channel(args),
    }
}

fn arity(args: &[Value], want: usize) -> Result<()> {
    if args.len() != want {
        return Err(RuntimeError::WrongNumArguments {
            want,
            got: args.len(),
        });
    }
    Ok(())
}

fn invalid(name: &str, expected: &'static str, found: &Value) -> RuntimeError {
    RuntimeError::InvalidArgumentType {
        name: name.to_string(),
        expected,
        found: found.type_name(),
    }
}

fn is(args: &[Value], pred: impl Fn(&Value) -> bool) -> Result<Value> {
    arity(args, 1)?;
    Ok(Value::Bool(pred(&args[0])))
}

/// `conv(value [, default])`: the converted value, else the default, else
/// `undefined`.
fn convert_with(
    args: &[Value],
    conv: impl Fn(&Value) -> Result<Option<Value>>,
) -> Result<Value> {
    let (value, default) = match args {
        [value] => (value, None),
        [value, default] => (value, Some(default)),
        _ => {
            return Err(RuntimeError::WrongNumArguments {
                want: 1,
                got: args.len(),
            })
        }
    };
    Ok(match conv(value)? {
        Some(converted) => converted,
        None => default.cloned().unwrap_or_default(),
    })
}

fn len(args: &[Value]) -> Result<Value> {
    arity(args, 1)?;
    let n = match &args[0] {
        Value::Array(items) | Value::ImmutableArray(items) => items.read().len(),
        Value::Map(map) | Value::ImmutableMap(map) => map.read().len(),
        Value::String(s) => s.chars().count(),
        Value::Bytes(b) => b.len(),
        other => return Err(invalid("first", "array/string/bytes/map", other)),
    };
    Ok(Value::Int(n as i64))
}

/// A new array holding the elements of the first argument followed by the
/// rest of the arguments.
fn append(args: &[Value]) -> Result<Value> {
    let Some((first, rest)) = args.split_first() else {
        return Err(RuntimeError::WrongNumArgumentsVariadic { want: 1, got: 0 });
    };
    let mut items = match first {
        Value::Array(items) | Value::ImmutableArray(items) => items.read().clone(),
        Value::Undefined => Vec::new(),
        other => return Err(invalid("first", "array", other)),
    };
    items.extend(rest.iter().cloned());
    Ok(Value::array(items))
}

fn delete(args: &[Value]) -> Result<Value> {
    arity(args, 2)?;
    let Value::Map(map) = &args[0] else {
        return Err(invalid("first", "map", &args[0]));
    };
    let Value::String(key) = &args[1] else {
        return Err(invalid("second", "string", &args[1]));
    };
    map.write().shift_remove(&**key);
    Ok(Value::Undefined)
}

/// `splice(array [, start [, count [, items...]]])` removes `count`
/// elements at `start`, inserts `items` there and returns the removed
/// elements.
fn splice(args: &[Value]) -> Result<Value> {
    let Some(first) = args.first() else {
        return Err(RuntimeError::WrongNumArgumentsVariadic { want: 1, got: 0 });
    };
    let Value::Array(array) = first else {
        return Err(invalid("first", "array", first));
    };
    let mut items = array.write();
    let len = items.len();

    let start = match args.get(1) {
        None => 0,
        Some(Value::Int(i)) if *i >= 0 && (*i as usize) <= len => *i as usize,
        Some(Value::Int(_)) => return Err(RuntimeError::IndexOutOfBounds),
        Some(other) => return Err(invalid("second", "int", other)),
    };
    let count = match args.get(2) {
        None => len - start,
        Some(Value::Int(n)) if *n >= 0 => (*n as usize).min(len - start),
        Some(Value::Int(_)) => return Err(RuntimeError::IndexOutOfBounds),
        Some(other) => return Err(invalid("third", "int", other)),
    };
    let inserted = args.get(3..).unwrap_or_default().iter().cloned();
    let removed: Vec<Value> = items.splice(start..start + count, inserted).collect();
    Ok(Value::array(removed))
}

/// `range(start, stop [, step])`: ints from `start` towards `stop`,
/// exclusive. `step` must be positive; the direction follows the bounds.
/// Every element is charged to the allocation budget.
fn range(vm: &Vm, args: &[Value]) -> Result<Value> {
    if !(2..=3).contains(&args.len()) {
        return Err(RuntimeError::WrongNumArguments {
            want: 2,
            got: args.len(),
        });
    }
    let int = |i: usize, name: &str| match &args[i] {
        Value::Int(n) => Ok(*n),
        other => Err(invalid(name, "int", other)),
    };
    let start = int(0, "start")?;
    let stop = int(1, "stop")?;
    let step = if args.len() == 3 { int(2, "step")? } else { 1 };
    if step <= 0 {
        return Err(RuntimeError::Custom("invalid range step: must be > 0".into()));
    }

    let (start, stop, step) = (i128::from(start), i128::from(stop), i128::from(step));
    let dir = if start <= stop { 1 } else { -1 };
    let count = ((stop - start).abs() + step - 1) / step;
    let count = usize::try_from(count).unwrap_or(usize::MAX);
    vm.charge(count)?;

    let mut items = Vec::new();
    items
        .try_reserve_exact(count)
        .map_err(|_| RuntimeError::AllocationLimitExceeded)?;
    // Every element lies between start and stop, so it fits in an i64.
    items.extend((0..count).map(|k| Value::Int((start + dir * step * k as i128) as i64)));
    Ok(Value::array(items))
}

fn make_channel(args: &[Value]) -> Result<Value> {
    let capacity = match args {
        [] => 0,
        [Value::Int(n)] if *n >= 0 => *n as usize,
        [other] => return Err(invalid("capacity", "non-negative int", other)),
        _ => {
            return Err(RuntimeError::WrongNumArguments {
                want: 1,
                got: args.len(),
            })
        }
    };
    Ok(Value::Channel(Arc::new(Channel::new(capacity))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_compiler::Compiler;
    use skiff_lexer::SourceFileSet;

    fn vm() -> Vm {
        let files = SourceFileSet::new();
        Vm::new(Compiler::new(files).bytecode(), None, -1)
    }

    fn call_builtin(builtin: Builtin, args: &[Value]) -> Result<Value> {
        call(&vm(), builtin, args, &Kwargs::new())
    }

    fn ints(values: &[i64]) -> Value {
        Value::array(values.iter().map(|i| Value::Int(*i)).collect())
    }

    #[test]
    fn test_len() {
        assert_eq!(call_builtin(Builtin::Len, &[ints(&[1, 2])]).unwrap(), Value::Int(2));
        assert_eq!(call_builtin(Builtin::Len, &[Value::from("héllo")]).unwrap(), Value::Int(5));
        assert!(call_builtin(Builtin::Len, &[Value::Int(1)]).is_err());
    }

    #[test]
    fn test_append_returns_new_array() {
        let original = ints(&[1]);
        let appended = call_builtin(Builtin::Append, &[original.clone(), Value::Int(2)]).unwrap();
        assert_eq!(appended, ints(&[1, 2]));
        assert_eq!(original, ints(&[1]));
    }

    #[test]
    fn test_splice() {
        let array = ints(&[1, 2, 3, 4]);
        let removed = call_builtin(
            Builtin::Splice,
            &[array.clone(), Value::Int(1), Value::Int(2), Value::from("x")],
        )
        .unwrap();
        assert_eq!(removed, ints(&[2, 3]));
        assert_eq!(
            array,
            Value::array(vec![Value::Int(1), Value::from("x"), Value::Int(4)])
        );
        assert_eq!(
            call_builtin(Builtin::Splice, &[array, Value::Int(9)]).unwrap_err(),
            RuntimeError::IndexOutOfBounds
        );
    }

    #[test]
    fn test_delete() {
        let mut entries = indexmap::IndexMap::new();
        entries.insert("a".to_string(), Value::Int(1));
        let map = Value::map(entries);
        call_builtin(Builtin::Delete, &[map.clone(), Value::from("a")]).unwrap();
        assert_eq!(call_builtin(Builtin::Len, &[map]).unwrap(), Value::Int(0));
    }

    #[test]
    fn test_range() {
        assert_eq!(
            call_builtin(Builtin::Range, &[Value::Int(0), Value::Int(5), Value::Int(2)]).unwrap(),
            ints(&[0, 2, 4])
        );
        assert_eq!(
            call_builtin(Builtin::Range, &[Value::Int(3), Value::Int(0)]).unwrap(),
            ints(&[3, 2, 1])
        );
        assert!(call_builtin(Builtin::Range, &[Value::Int(0), Value::Int(3), Value::Int(0)]).is_err());
        assert_eq!(
            call_builtin(Builtin::Range, &[Value::Int(i64::MAX - 1), Value::Int(i64::MAX)]).unwrap(),
            ints(&[i64::MAX - 1])
        );
    }

    #[test]
    fn test_large_buffers_are_charged_per_element() {
        let bounded = || Vm::new(Compiler::new(SourceFileSet::new()).bytecode(), None, 100);

        let huge_range = [Value::Int(0), Value::Int(1 << 40)];
        assert_eq!(
            call(&bounded(), Builtin::Range, &huge_range, &Kwargs::new()).unwrap_err(),
            RuntimeError::AllocationLimitExceeded
        );
        let huge_bytes = [Value::Int(2_147_483_647)];
        assert_eq!(
            call(&bounded(), Builtin::Bytes, &huge_bytes, &Kwargs::new()).unwrap_err(),
            RuntimeError::AllocationLimitExceeded
        );

        // 60 of 100 fit once, not twice.
        let vm = bounded();
        let args = [Value::Int(0), Value::Int(60)];
        assert_eq!(
            call(&vm, Builtin::Range, &args, &Kwargs::new()).unwrap(),
            Value::array((0..60).map(Value::Int).collect())
        );
        assert_eq!(
            call(&vm, Builtin::Range, &args, &Kwargs::new()).unwrap_err(),
            RuntimeError::AllocationLimitExceeded
        );
    }

    #[test]
    fn test_conversions_with_default() {
        assert_eq!(call_builtin(Builtin::Int, &[Value::from("12")]).unwrap(), Value::Int(12));
        assert_eq!(
            call_builtin(Builtin::Int, &[Value::from("x"), Value::Int(-1)]).unwrap(),
            Value::Int(-1)
        );
        assert_eq!(call_builtin(Builtin::Float, &[Value::from("x")]).unwrap(), Value::Undefined);
        assert_eq!(call_builtin(Builtin::String, &[Value::Int(5)]).unwrap(), Value::from("5"));
        assert_eq!(call_builtin(Builtin::Bool, &[Value::Int(0)]).unwrap(), Value::Bool(false));
        assert_eq!(
            call_builtin(Builtin::Bytes, &[Value::Int(2)]).unwrap(),
            Value::Bytes(vec![0, 0].into())
        );
    }

    #[test]
    fn test_predicates() {
        assert_eq!(call_builtin(Builtin::IsInt, &[Value::Int(1)]).unwrap(), Value::Bool(true));
        assert_eq!(call_builtin(Builtin::IsMap, &[ints(&[])]).unwrap(), Value::Bool(false));
        assert_eq!(
            call_builtin(Builtin::IsCallable, &[Value::Builtin(Builtin::Len)]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            call_builtin(Builtin::TypeName, &[Value::Undefined]).unwrap(),
            Value::from("undefined")
        );
    }

    #[test]
    fn test_keyword_arguments_rejected() {
        let mut kwargs = Kwargs::new();
        kwargs.insert("x".into(), Value::Int(1));
        assert_eq!(
            call(&vm(), Builtin::Len, &[ints(&[])], &kwargs).unwrap_err(),
            RuntimeError::UnexpectedKeywordArguments
        );
    }
}
