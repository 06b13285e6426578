//! `format(fmt, args...)` with printf-style verbs.
//!
//! Supported: `%v %d %s %q %f %e %x %X %o %b %t %c %%`, flags `-+0 `,
//! width and precision. A missing argument renders as `%!v(MISSING)`, a
//! mismatched one as `%!d(string=x)`.

use std::fmt::Write as _;

use skiff_object::{RuntimeError, Value};

pub(crate) fn format(args: &[Value]) -> Result<Value, RuntimeError> {
    let Some((fmt, rest)) = args.split_first() else {
        return Err(RuntimeError::WrongNumArgumentsVariadic { want: 1, got: 0 });
    };
    let Value::String(fmt) = fmt else {
        return Err(RuntimeError::InvalidArgumentType {
            name: "format".into(),
            expected: "string",
            found: fmt.type_name(),
        });
    };
    Value::string(render(fmt, rest))
}

#[derive(Debug, Default, Clone, Copy)]
struct Spec {
    minus: bool,
    plus: bool,
    zero: bool,
    space: bool,
    width: Option<usize>,
    precision: Option<usize>,
}

fn render(fmt: &str, args: &[Value]) -> String {
    let mut out = String::with_capacity(fmt.len());
    let mut args = args.iter();
    let mut chars = fmt.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut spec = Spec::default();
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => spec.minus = true,
                '+' => spec.plus = true,
                '0' => spec.zero = true,
                ' ' => spec.space = true,
                _ => break,
            }
            chars.next();
        }
        spec.width = read_number(&mut chars);
        if chars.peek() == Some(&'.') {
            chars.next();
            spec.precision = Some(read_number(&mut chars).unwrap_or(0));
        }
        let Some(verb) = chars.next() else {
            out.push_str("%!(NOVERB)");
            break;
        };
        if verb == '%' {
            out.push('%');
            continue;
        }
        match args.next() {
            Some(arg) => {
                let text = format_one(verb, spec, arg);
                pad(&mut out, &text, spec);
            }
            None => {
                let _ = write!(out, "%!{}(MISSING)", verb);
            }
        }
    }
    out
}

fn read_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<usize> {
    let mut n: Option<usize> = None;
    while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
        n = Some(n.unwrap_or(0).saturating_mul(10).saturating_add(d as usize));
        chars.next();
    }
    n
}

fn format_one(verb: char, spec: Spec, arg: &Value) -> String {
    let sign = |negative: bool, digits: String| -> String {
        if negative {
            format!("-{}", digits)
        } else if spec.plus {
            format!("+{}", digits)
        } else if spec.space {
            format!(" {}", digits)
        } else {
            digits
        }
    };
    match (verb, arg) {
        ('v', Value::Float(f)) | ('f' | 'F', Value::Float(f)) if spec.precision.is_some() || verb != 'v' => {
            let prec = spec.precision.unwrap_or(6);
            sign(f.is_sign_negative(), format!("{:.*}", prec, f.abs()))
        }
        ('v', other) => other.to_text(),
        ('d', Value::Int(i)) => sign(*i < 0, i.unsigned_abs().to_string()),
        ('d', Value::Char(c)) => (*c as u32).to_string(),
        ('s', other) => {
            let text = other.to_text();
            match spec.precision {
                Some(p) => text.chars().take(p).collect(),
                None => text,
            }
        }
        ('q', Value::Char(c)) => format!("{:?}", c),
        ('q', other) => format!("{:?}", other.to_text()),
        ('f' | 'F', Value::Int(i)) => {
            let prec = spec.precision.unwrap_or(6);
            sign(*i < 0, format!("{:.*}", prec, (*i as f64).abs()))
        }
        ('e', Value::Float(f)) => match spec.precision {
            Some(p) => format!("{:.*e}", p, f),
            None => format!("{:e}", f),
        },
        ('x', Value::Int(i)) => sign(*i < 0, format!("{:x}", i.unsigned_abs())),
        ('X', Value::Int(i)) => sign(*i < 0, format!("{:X}", i.unsigned_abs())),
        ('x', Value::String(s)) => s.bytes().map(|b| format!("{:02x}", b)).collect(),
        ('x', Value::Bytes(b)) => b.iter().map(|b| format!("{:02x}", b)).collect(),
        ('X', Value::String(s)) => s.bytes().map(|b| format!("{:02X}", b)).collect(),
        ('X', Value::Bytes(b)) => b.iter().map(|b| format!("{:02X}", b)).collect(),
        ('o', Value::Int(i)) => sign(*i < 0, format!("{:o}", i.unsigned_abs())),
        ('b', Value::Int(i)) => sign(*i < 0, format!("{:b}", i.unsigned_abs())),
        ('t', Value::Bool(b)) => b.to_string(),
        ('c', Value::Char(c)) => c.to_string(),
        ('c', Value::Int(i)) => u32::try_from(*i)
            .ok()
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_else(|| "\u{FFFD}".into()),
        (verb, other) => format!("%!{}({}={})", verb, other.type_name(), other.to_text()),
    }
}

fn pad(out: &mut String, text: &str, spec: Spec) {
    let len = text.chars().count();
    let width = spec.width.unwrap_or(0);
    if len >= width {
        out.push_str(text);
        return;
    }
    let fill = width - len;
    if spec.minus {
        out.push_str(text);
        out.extend(std::iter::repeat(' ').take(fill));
    } else if spec.zero {
        let (sign, digits) = match text.chars().next() {
            Some(c @ ('-' | '+' | ' ')) => (Some(c), &text[1..]),
            _ => (None, text),
        };
        if let Some(sign) = sign {
            out.push(sign);
        }
        out.extend(std::iter::repeat('0').take(fill));
        out.push_str(digits);
    } else {
        out.extend(std::iter::repeat(' ').take(fill));
        out.push_str(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(f: &str, args: &[Value]) -> String {
        render(f, args)
    }

    #[test]
    fn test_basic_verbs() {
        assert_eq!(fmt("%d-%s", &[Value::Int(4), Value::from("x")]), "4-x");
        assert_eq!(fmt("%v %v", &[Value::from("a"), Value::Bool(true)]), "a true");
        assert_eq!(fmt("%q", &[Value::from("a\"b")]), "\"a\\\"b\"");
        assert_eq!(fmt("100%%", &[]), "100%");
        assert_eq!(fmt("%x %X %o %b", &[Value::Int(255), Value::Int(255), Value::Int(8), Value::Int(5)]), "ff FF 10 101");
        assert_eq!(fmt("%c", &[Value::Int(65)]), "A");
    }

    #[test]
    fn test_width_and_precision() {
        assert_eq!(fmt("%.2f", &[Value::Float(1.23456)]), "1.23");
        assert_eq!(fmt("%5d|", &[Value::Int(42)]), "   42|");
        assert_eq!(fmt("%-5d|", &[Value::Int(42)]), "42   |");
        assert_eq!(fmt("%05d", &[Value::Int(-42)]), "-0042");
        assert_eq!(fmt("%+d", &[Value::Int(7)]), "+7");
        assert_eq!(fmt("%.3s", &[Value::from("abcdef")]), "abc");
    }

    #[test]
    fn test_mismatches() {
        assert_eq!(fmt("%d", &[]), "%!d(MISSING)");
        assert_eq!(fmt("%d", &[Value::from("x")]), "%!d(string=x)");
    }

    #[test]
    fn test_format_requires_string() {
        assert!(format(&[Value::Int(1)]).is_err());
        assert_eq!(format(&[Value::from("%v"), Value::Int(1)]).unwrap(), Value::from("1"));
    }
}
