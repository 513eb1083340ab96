//! Strict decoder for the literals a board prints.
//!
//! Board replies are the `repr()` of plain data: `None`, booleans, integers,
//! floats, strings, bytes, tuples, lists and dicts. This is a
//! recursive-descent parser for exactly that subset; nothing is evaluated.
//!
//! The module also has the matching encoders used to embed host data
//! (paths, file chunks) in scripts sent to the board.

use std::fmt::Write as _;

use thiserror::Error;

/// Maximum nesting depth accepted by the parser.
const MAX_DEPTH: usize = 64;

/// A decoded literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `None`
    None,
    /// `True` / `False`
    Bool(bool),
    /// An integer that fits in `i64`.
    Int(i64),
    /// A float, including `inf` and `nan`.
    Float(f64),
    /// A text string.
    Str(String),
    /// A bytes literal.
    Bytes(Vec<u8>),
    /// A tuple.
    Tuple(Vec<Value>),
    /// A list.
    List(Vec<Value>),
    /// A dict, in source order.
    Dict(Vec<(Value, Value)>),
}

impl Value {
    /// The integer value, if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The string value, if this is a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The bytes value, if this is `Bytes`.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Items of a tuple or list.
    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Self::Tuple(items) | Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Look up a string key in a dict.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Dict(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Short type name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::Tuple(_) => "tuple",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
        }
    }
}

/// Literal decoding failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at offset {position}")]
pub struct ParseError {
    /// Byte offset into the input.
    pub position: usize,
    /// What went wrong.
    pub message: String,
}

/// Parse `input` as exactly one literal, surrounded by optional whitespace.
pub fn parse(input: &str) -> Result<Value, ParseError> {
    let mut parser = Parser::new(input);
    let value = parser.value(0)?;
    parser.skip_ws();
    if parser.pos != input.len() {
        return Err(parser.error("trailing characters"));
    }
    Ok(value)
}

struct Parser<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            position: self.pos,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, b: u8) -> bool {
        if self.peek() == Some(b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_word(&mut self, word: &str) -> bool {
        let end = self.pos + word.len();
        if self.src.get(self.pos..end) != Some(word) {
            return false;
        }
        // `Nonesuch` is not `None`.
        if self
            .bytes
            .get(end)
            .is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'_')
        {
            return false;
        }
        self.pos = end;
        true
    }

    fn value(&mut self, depth: usize) -> Result<Value, ParseError> {
        if depth > MAX_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        self.skip_ws();

        match self.peek() {
            None => Err(self.error("unexpected end of input")),
            Some(b'(') => self.tuple(depth),
            Some(b'[') => {
                self.pos += 1;
                let items = self.items(b']', depth)?;
                Ok(Value::List(items))
            },
            Some(b'{') => self.dict(depth),
            Some(b'\'' | b'"') => Ok(Value::Str(self.string()?)),
            Some(b'b') if matches!(self.bytes.get(self.pos + 1), Some(b'\'' | b'"')) => {
                self.pos += 1;
                Ok(Value::Bytes(self.bytes_literal()?))
            },
            Some(b'-' | b'+' | b'0'..=b'9' | b'.') => self.number(),
            Some(_) => {
                if self.eat_word("None") {
                    Ok(Value::None)
                } else if self.eat_word("True") {
                    Ok(Value::Bool(true))
                } else if self.eat_word("False") {
                    Ok(Value::Bool(false))
                } else if self.eat_word("inf") {
                    Ok(Value::Float(f64::INFINITY))
                } else if self.eat_word("nan") {
                    Ok(Value::Float(f64::NAN))
                } else {
                    Err(self.error("unexpected character"))
                }
            },
        }
    }

    /// Comma separated values up to `close`, trailing comma allowed.
    fn items(&mut self, close: u8, depth: usize) -> Result<Vec<Value>, ParseError> {
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.eat(close) {
                return Ok(items);
            }
            items.push(self.value(depth + 1)?);
            self.skip_ws();
            if self.eat(b',') {
                continue;
            }
            if self.eat(close) {
                return Ok(items);
            }
            return Err(self.error(format!("expected ',' or '{}'", close as char)));
        }
    }

    fn tuple(&mut self, depth: usize) -> Result<Value, ParseError> {
        self.pos += 1;
        self.skip_ws();
        if self.eat(b')') {
            return Ok(Value::Tuple(Vec::new()));
        }

        let first = self.value(depth + 1)?;
        self.skip_ws();
        if self.eat(b')') {
            // Parenthesized expression, not a tuple.
            return Ok(first);
        }
        if !self.eat(b',') {
            return Err(self.error("expected ',' or ')'"));
        }
        let mut items = vec![first];
        items.extend(self.items(b')', depth)?);
        Ok(Value::Tuple(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, ParseError> {
        self.pos += 1;
        let mut pairs = Vec::new();
        loop {
            self.skip_ws();
            if self.eat(b'}') {
                return Ok(Value::Dict(pairs));
            }
            let key = self.value(depth + 1)?;
            self.skip_ws();
            if !self.eat(b':') {
                return Err(self.error("expected ':'"));
            }
            let value = self.value(depth + 1)?;
            pairs.push((key, value));
            self.skip_ws();
            if self.eat(b',') {
                continue;
            }
            if self.eat(b'}') {
                return Ok(Value::Dict(pairs));
            }
            return Err(self.error("expected ',' or '}'"));
        }
    }

    fn number(&mut self) -> Result<Value, ParseError> {
        let start = self.pos;
        let negative = self.peek() == Some(b'-');
        if matches!(self.peek(), Some(b'-' | b'+')) {
            self.pos += 1;
        }
        if self.eat_word("inf") {
            return Ok(Value::Float(if negative {
                f64::NEG_INFINITY
            } else {
                f64::INFINITY
            }));
        }

        let mut is_float = false;
        let mut digits = 0;
        while let Some(b) = self.peek() {
            match b {
                b'0'..=b'9' => digits += 1,
                b'.' => is_float = true,
                b'e' | b'E' => {
                    is_float = true;
                    if matches!(self.bytes.get(self.pos + 1), Some(b'-' | b'+')) {
                        self.pos += 1;
                    }
                },
                _ => break,
            }
            self.pos += 1;
        }
        if digits == 0 {
            self.pos = start;
            return Err(self.error("invalid number"));
        }

        let text = &self.src[start..self.pos];
        if is_float {
            text.parse::<f64>()
                .map(Value::Float)
                .map_err(|_| ParseError {
                    position: start,
                    message: format!("invalid float {text:?}"),
                })
        } else {
            text.parse::<i64>()
                .map(Value::Int)
                .map_err(|_| ParseError {
                    position: start,
                    message: format!("integer out of range {text:?}"),
                })
        }
    }

    fn quote(&mut self) -> Result<u8, ParseError> {
        match self.peek() {
            Some(q @ (b'\'' | b'"')) => {
                self.pos += 1;
                Ok(q)
            },
            _ => Err(self.error("expected quote")),
        }
    }

    fn hex_escape(&mut self, len: usize) -> Result<u32, ParseError> {
        let digits = self
            .src
            .get(self.pos..self.pos + len)
            .ok_or_else(|| self.error("truncated escape"))?;
        let value =
            u32::from_str_radix(digits, 16).map_err(|_| self.error("invalid hex escape"))?;
        self.pos += len;
        Ok(value)
    }

    /// Common escapes; `None` means the escape is type specific.
    fn simple_escape(b: u8) -> Option<u8> {
        match b {
            b'\\' => Some(b'\\'),
            b'\'' => Some(b'\''),
            b'"' => Some(b'"'),
            b'n' => Some(b'\n'),
            b'r' => Some(b'\r'),
            b't' => Some(b'\t'),
            b'a' => Some(0x07),
            b'b' => Some(0x08),
            b'f' => Some(0x0c),
            b'v' => Some(0x0b),
            b'0' => Some(0),
            _ => None,
        }
    }

    fn string(&mut self) -> Result<String, ParseError> {
        let quote = self.quote()?;
        let mut out = String::new();

        loop {
            let Some(c) = self.src[self.pos..].chars().next() else {
                return Err(self.error("unterminated string"));
            };
            match c {
                '\\' => {
                    self.pos += 1;
                    let esc = self.peek().ok_or_else(|| self.error("unterminated string"))?;
                    self.pos += 1;
                    if let Some(b) = Self::simple_escape(esc) {
                        out.push(b as char);
                        continue;
                    }
                    let code = match esc {
                        b'x' => self.hex_escape(2)?,
                        b'u' => self.hex_escape(4)?,
                        b'U' => self.hex_escape(8)?,
                        _ => return Err(self.error("unknown escape")),
                    };
                    out.push(char::from_u32(code).ok_or_else(|| self.error("invalid code point"))?);
                },
                '\n' => return Err(self.error("newline in string")),
                _ if c as u32 == u32::from(quote) => {
                    self.pos += 1;
                    return Ok(out);
                },
                _ => {
                    out.push(c);
                    self.pos += c.len_utf8();
                },
            }
        }
    }

    fn bytes_literal(&mut self) -> Result<Vec<u8>, ParseError> {
        let quote = self.quote()?;
        let mut out = Vec::new();

        loop {
            let b = self.peek().ok_or_else(|| self.error("unterminated bytes"))?;
            self.pos += 1;
            match b {
                b'\\' => {
                    let esc = self.peek().ok_or_else(|| self.error("unterminated bytes"))?;
                    self.pos += 1;
                    if let Some(b) = Self::simple_escape(esc) {
                        out.push(b);
                    } else if esc == b'x' {
                        // Two hex digits always fit in a byte.
                        out.push(u8::try_from(self.hex_escape(2)?).unwrap_or_default());
                    } else {
                        return Err(self.error("unknown escape"));
                    }
                },
                b'\n' => return Err(self.error("newline in bytes")),
                _ if b == quote => return Ok(out),
                0x20..=0x7e => out.push(b),
                _ => return Err(self.error("non-ASCII character in bytes")),
            }
        }
    }
}

/// Encode text as a single-quoted string literal.
pub fn encode_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            },
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Encode bytes as a single-quoted bytes literal.
///
/// Only printable ASCII goes through as-is, so the literal never contains
/// the raw REPL control bytes.
pub fn encode_bytes(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2 + 3);
    out.push_str("b'");
    for &b in data {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            0x20..=0x7e => out.push(b as char),
            _ => {
                let _ = write!(out, "\\x{b:02x}");
            },
        }
    }
    out.push('\'');
    out
}
