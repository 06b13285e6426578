//! Decoding of literal token text into values.
//!
//! Escapes follow Go's quoting rules: `\a \b \f \n \r \t \v \\ \' \"`,
//! `\xhh`, three-digit octal `\ooo`, `\uhhhh` and `\Uhhhhhhhh`.

use std::num::{ParseFloatError, ParseIntError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LiteralError {
    #[error("unknown escape sequence: \\{0}")]
    UnknownEscape(char),
    #[error("escape sequence at end of literal")]
    TruncatedEscape,
    #[error("invalid {kind} escape: want {digits} digits")]
    BadDigits { kind: &'static str, digits: usize },
    #[error("escape sequence is an invalid code point: {0:#x}")]
    InvalidCodePoint(u32),
    #[error("character literal must hold exactly one character")]
    NotOneChar,
}

/// Integer text with an optional sign, `0x`/`0o`/`0b` prefix and `_`
/// separators.
pub fn parse_int(text: &str) -> Result<i64, ParseIntError> {
    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let digits: String = unsigned.chars().filter(|c| *c != '_').collect();
    let (radix, body) = match digits.get(..2) {
        Some("0x" | "0X") => (16, &digits[2..]),
        Some("0o" | "0O") => (8, &digits[2..]),
        Some("0b" | "0B") => (2, &digits[2..]),
        _ => (10, digits.as_str()),
    };
    if negative {
        i64::from_str_radix(&format!("-{}", body), radix)
    } else {
        i64::from_str_radix(body, radix)
    }
}

pub fn parse_float(text: &str) -> Result<f64, ParseFloatError> {
    text.replace('_', "").parse()
}

/// A double-quoted literal, quotes included.
pub fn parse_string(text: &str) -> Result<String, LiteralError> {
    unquote(strip_delims(text))
}

/// A back-quoted literal. Carriage returns are dropped.
pub fn parse_raw_string(text: &str) -> String {
    strip_delims(text).replace('\r', "")
}

/// A single-quoted literal, quotes included.
pub fn parse_char(text: &str) -> Result<char, LiteralError> {
    let decoded = unquote(strip_delims(text))?;
    let mut chars = decoded.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(LiteralError::NotOneChar),
    }
}

fn strip_delims(text: &str) -> &str {
    let mut chars = text.chars();
    chars.next();
    chars.next_back();
    chars.as_str()
}

fn unquote(body: &str) -> Result<String, LiteralError> {
    if !body.contains('\\') {
        return Ok(body.to_string());
    }
    let mut out = String::with_capacity(body.len());
    let mut rest = body;
    while let Some(pos) = rest.find('\\') {
        out.push_str(&rest[..pos]);
        let (c, len) = escape(&rest[pos + 1..])?;
        out.push(c);
        rest = &rest[pos + 1 + len..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Decode the escape following a backslash. Returns the character and the
/// number of bytes consumed after the backslash.
fn escape(s: &str) -> Result<(char, usize), LiteralError> {
    let first = s.chars().next().ok_or(LiteralError::TruncatedEscape)?;
    let simple = match first {
        'a' => Some('\x07'),
        'b' => Some('\x08'),
        'f' => Some('\x0c'),
        'n' => Some('\n'),
        'r' => Some('\r'),
        't' => Some('\t'),
        'v' => Some('\x0b'),
        '\\' | '\'' | '"' => Some(first),
        _ => None,
    };
    if let Some(c) = simple {
        return Ok((c, 1));
    }
    let (kind, radix, digits, skip) = match first {
        'x' => ("hex", 16, 2, 1),
        'u' => ("unicode", 16, 4, 1),
        'U' => ("unicode", 16, 8, 1),
        '0'..='7' => ("octal", 8, 3, 0),
        other => return Err(LiteralError::UnknownEscape(other)),
    };
    let code = s
        .get(skip..skip + digits)
        .filter(|d| d.chars().all(|c| c.is_digit(radix)))
        .and_then(|d| u32::from_str_radix(d, radix).ok())
        .ok_or(LiteralError::BadDigits { kind, digits })?;
    let c = char::from_u32(code).ok_or(LiteralError::InvalidCodePoint(code))?;
    Ok((c, skip + digits))
}
