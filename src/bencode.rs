//! # Bencode Codec
//!
//! Decoder and canonical encoder for the bencode format used by torrent
//! files, tracker responses and the extension protocol.
//!
//! ## Format
//!
//! Bencode knows four value kinds:
//!
//! | Kind | Encoding | Example |
//! |------|----------|---------|
//! | byte-string | `<len>:<raw bytes>` | `5:hello` |
//! | integer | `i<decimal>e` | `i-42e` |
//! | list | `l<values>e` | `l5:helloi52ee` |
//! | dictionary | `d(<key><value>)*e` | `d3:foo3:bare` |
//!
//! Byte-strings are raw bytes, not text. The `pieces` blob of a torrent is
//! full of arbitrary bytes, so nothing here assumes UTF-8.
//!
//! ## Canonical form
//!
//! Dictionary keys are held in a `BTreeMap`, so the encoder always emits
//! keys in ascending byte order. Encoding the result of decoding a canonical
//! input reproduces that input byte for byte, which is what keeps the
//! infohash stable.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// A decoded bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Raw byte-string, possibly containing NUL or high bytes
    Bytes(Vec<u8>),
    /// Signed 64-bit integer
    Int(i64),
    /// Ordered sequence of values
    List(Vec<Value>),
    /// Mapping from byte-string keys to values, keys ascending
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    /// Byte-string value from a str, for building protocol payloads.
    pub fn string(s: &str) -> Value {
        Value::Bytes(s.as_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Look up a key in a dictionary value.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        match self {
            Value::Dict(d) => d.get(key),
            _ => None,
        }
    }

    /// Encode to canonical bencode bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Encode into an existing buffer.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Bytes(bytes) => {
                buf.extend_from_slice(bytes.len().to_string().as_bytes());
                buf.push(b':');
                buf.extend_from_slice(bytes);
            }
            Value::Int(i) => {
                buf.push(b'i');
                buf.extend_from_slice(i.to_string().as_bytes());
                buf.push(b'e');
            }
            Value::List(list) => {
                buf.push(b'l');
                for item in list {
                    item.encode_into(buf);
                }
                buf.push(b'e');
            }
            Value::Dict(dict) => {
                buf.push(b'd');
                // BTreeMap iterates keys in ascending byte order
                for (key, value) in dict {
                    buf.extend_from_slice(key.len().to_string().as_bytes());
                    buf.push(b':');
                    buf.extend_from_slice(key);
                    value.encode_into(buf);
                }
                buf.push(b'e');
            }
        }
    }

    /// Render as JSON for the `decode` command. Byte-strings become strings
    /// (lossily, since bencode bytes need not be UTF-8).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Bytes(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::List(list) => serde_json::Value::Array(list.iter().map(Value::to_json).collect()),
            Value::Dict(dict) => serde_json::Value::Object(
                dict.iter()
                    .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

/// Decode one value from the front of `buf`.
///
/// Returns the value together with the number of bytes consumed, so callers
/// can keep parsing whatever follows (the extension protocol puts raw bytes
/// right after a bencoded dictionary).
pub fn decode_prefix(buf: &[u8]) -> Result<(Value, usize)> {
    let mut parser = Parser { buf, pos: 0 };
    let value = parser.parse_value()?;
    Ok((value, parser.pos))
}

/// Decode a complete buffer into one value, rejecting trailing bytes.
pub fn decode(buf: &[u8]) -> Result<Value> {
    let (value, consumed) = decode_prefix(buf)?;
    if consumed != buf.len() {
        return Err(Error::bencode(consumed, "trailing bytes after value"));
    }
    Ok(value)
}

struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn fail<T>(&self, reason: &str) -> Result<T> {
        Err(Error::bencode(self.pos, reason))
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn parse_value(&mut self) -> Result<Value> {
        match self.peek() {
            None => self.fail("unexpected end of input"),
            Some(b'i') => self.parse_int(),
            Some(b'l') => self.parse_list(),
            Some(b'd') => self.parse_dict(),
            Some(c) if c.is_ascii_digit() => Ok(Value::Bytes(self.parse_bytes()?)),
            Some(c) => self.fail(&format!("unexpected byte {:#04x}", c)),
        }
    }

    fn parse_bytes(&mut self) -> Result<Vec<u8>> {
        // Decimal length prefix
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.pos == start {
            return self.fail("expected string length prefix");
        }
        let digits = std::str::from_utf8(&self.buf[start..self.pos]).expect("ascii digits");
        let len: usize = match digits.parse() {
            Ok(len) => len,
            Err(_) => return self.fail("string length prefix too large"),
        };

        // Separator
        if self.peek() != Some(b':') {
            return self.fail("expected ':' after string length");
        }
        self.pos += 1;

        // Raw bytes
        if len > self.buf.len() - self.pos {
            return self.fail("string length past end of input");
        }
        let bytes = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;

        Ok(bytes)
    }

    fn parse_int(&mut self) -> Result<Value> {
        self.pos += 1; // 'i'
        let start = self.pos;
        loop {
            match self.peek() {
                None => return self.fail("missing integer terminator"),
                Some(b'e') => break,
                Some(_) => self.pos += 1,
            }
        }
        let body = &self.buf[start..self.pos];
        // Lenient on purpose: "-0" and leading zeros are accepted, the way
        // most clients in the wild parse them.
        let number: i64 = match std::str::from_utf8(body).ok().and_then(|s| s.parse().ok()) {
            Some(number) => number,
            None => {
                self.pos = start;
                return self.fail("invalid integer");
            }
        };
        self.pos += 1; // 'e'

        Ok(Value::Int(number))
    }

    fn parse_list(&mut self) -> Result<Value> {
        self.pos += 1; // 'l'
        let mut list = Vec::new();
        loop {
            match self.peek() {
                None => return self.fail("missing list terminator"),
                Some(b'e') => break,
                Some(_) => list.push(self.parse_value()?),
            }
        }
        self.pos += 1; // 'e'

        Ok(Value::List(list))
    }

    fn parse_dict(&mut self) -> Result<Value> {
        self.pos += 1; // 'd'
        let mut dict = BTreeMap::new();
        loop {
            match self.peek() {
                None => return self.fail("missing dictionary terminator"),
                Some(b'e') => break,
                Some(c) if c.is_ascii_digit() => {
                    let key = self.parse_bytes()?;
                    let value = self.parse_value()?;
                    dict.insert(key, value);
                }
                Some(_) => return self.fail("dictionary key must be a string"),
            }
        }
        self.pos += 1; // 'e'

        Ok(Value::Dict(dict))
    }
}
