//! # JSON Codec for Documents
//!
//! A small recursive-descent JSON parser and printer for [`Value`]. This is
//! a construction convenience, not a query surface: documents are built
//! from text, stored in the binary value format, and can be rendered back
//! for inspection.
//!
//! ## Mapping
//!
//! | JSON            | Value                               |
//! |-----------------|-------------------------------------|
//! | `null`          | `Value::Null`                       |
//! | `true`/`false`  | `Value::Bool`                       |
//! | integer         | `Value::Int` (when it fits an i64)  |
//! | other number    | `Value::Float`                      |
//! | string          | `Value::String`                     |
//! | array           | `Value::Array`                      |
//! | object          | `Value::Dict` (keys sorted)         |
//!
//! Duplicate object keys keep the last occurrence. Non-finite floats have
//! no JSON form and print as `null`. `Value::Bytes` has no JSON source
//! form and prints as a hex string.

use std::collections::BTreeMap;

use eyre::{bail, ensure, Result};

use crate::parsing::numeric::{format_float, parse_float, parse_signed};
use crate::value::Value;

/// Parses a complete JSON document. Trailing non-whitespace is an error.
pub fn parse_json(text: &str) -> Result<Value> {
    let mut parser = Parser {
        bytes: text.as_bytes(),
        text,
        pos: 0,
    };
    let value = parser.parse_value()?;
    parser.skip_whitespace();
    ensure!(
        parser.pos == parser.bytes.len(),
        "unexpected trailing text at byte {}",
        parser.pos
    );
    Ok(value)
}

/// Renders a document as compact JSON.
pub fn to_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

struct Parser<'a> {
    bytes: &'a [u8],
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn skip_whitespace(&mut self) {
        while let Some(b' ' | b'\t' | b'\n' | b'\r') = self.bytes.get(self.pos) {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Result<u8> {
        self.skip_whitespace();
        match self.bytes.get(self.pos) {
            Some(&b) => Ok(b),
            None => bail!("unexpected end of JSON at byte {}", self.pos),
        }
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        let found = self.peek()?;
        ensure!(
            found == byte,
            "expected '{}' at byte {}, found '{}'",
            byte as char,
            self.pos,
            found as char
        );
        self.pos += 1;
        Ok(())
    }

    fn parse_value(&mut self) -> Result<Value> {
        match self.peek()? {
            b'{' => self.parse_object(),
            b'[' => self.parse_array(),
            b'"' => Ok(Value::String(self.parse_string()?)),
            b't' => self.parse_literal("true", Value::Bool(true)),
            b'f' => self.parse_literal("false", Value::Bool(false)),
            b'n' => self.parse_literal("null", Value::Null),
            _ => self.parse_number(),
        }
    }

    fn parse_literal(&mut self, literal: &str, value: Value) -> Result<Value> {
        if self.text[self.pos..].starts_with(literal) {
            self.pos += literal.len();
            Ok(value)
        } else {
            bail!("invalid JSON literal at byte {}", self.pos)
        }
    }

    fn parse_object(&mut self) -> Result<Value> {
        self.expect(b'{')?;
        let mut map = BTreeMap::new();
        if self.peek()? == b'}' {
            self.pos += 1;
            return Ok(Value::Dict(map));
        }
        loop {
            ensure!(self.peek()? == b'"', "expected object key at byte {}", self.pos);
            let key = self.parse_string()?;
            self.expect(b':')?;
            let value = self.parse_value()?;
            map.insert(key, value);
            match self.peek()? {
                b',' => self.pos += 1,
                b'}' => {
                    self.pos += 1;
                    return Ok(Value::Dict(map));
                }
                found => bail!(
                    "expected ',' or '}}' at byte {}, found '{}'",
                    self.pos,
                    found as char
                ),
            }
        }
    }

    fn parse_array(&mut self) -> Result<Value> {
        self.expect(b'[')?;
        let mut items = Vec::new();
        if self.peek()? == b']' {
            self.pos += 1;
            return Ok(Value::Array(items));
        }
        loop {
            items.push(self.parse_value()?);
            match self.peek()? {
                b',' => self.pos += 1,
                b']' => {
                    self.pos += 1;
                    return Ok(Value::Array(items));
                }
                found => bail!(
                    "expected ',' or ']' at byte {}, found '{}'",
                    self.pos,
                    found as char
                ),
            }
        }
    }

    fn parse_string(&mut self) -> Result<String> {
        self.expect(b'"')?;
        let mut out = String::new();
        loop {
            let Some(&b) = self.bytes.get(self.pos) else {
                bail!("unterminated string at byte {}", self.pos);
            };
            self.pos += 1;
            match b {
                b'"' => return Ok(out),
                b'\\' => {
                    let Some(&esc) = self.bytes.get(self.pos) else {
                        bail!("unterminated escape at byte {}", self.pos);
                    };
                    self.pos += 1;
                    match esc {
                        b'"' => out.push('"'),
                        b'\\' => out.push('\\'),
                        b'/' => out.push('/'),
                        b'b' => out.push('\u{0008}'),
                        b'f' => out.push('\u{000C}'),
                        b'n' => out.push('\n'),
                        b'r' => out.push('\r'),
                        b't' => out.push('\t'),
                        b'u' => out.push(self.parse_unicode_escape()?),
                        _ => bail!("invalid escape '\\{}' at byte {}", esc as char, self.pos),
                    }
                }
                _ if b < 0x20 => bail!("unescaped control character at byte {}", self.pos),
                _ => {
                    // Re-sync to a char boundary and take the whole scalar.
                    let start = self.pos - 1;
                    let ch_len = utf8_len(b)?;
                    ensure!(
                        start + ch_len <= self.bytes.len(),
                        "truncated UTF-8 at byte {}",
                        start
                    );
                    out.push_str(&self.text[start..start + ch_len]);
                    self.pos = start + ch_len;
                }
            }
        }
    }

    fn parse_unicode_escape(&mut self) -> Result<char> {
        let first = self.parse_hex4()?;
        if (0xD800..0xDC00).contains(&first) {
            // High surrogate; a low surrogate escape must follow.
            ensure!(
                self.bytes.get(self.pos) == Some(&b'\\')
                    && self.bytes.get(self.pos + 1) == Some(&b'u'),
                "unpaired surrogate at byte {}",
                self.pos
            );
            self.pos += 2;
            let second = self.parse_hex4()?;
            ensure!(
                (0xDC00..0xE000).contains(&second),
                "invalid low surrogate at byte {}",
                self.pos
            );
            let scalar = 0x10000 + ((first - 0xD800) << 10) + (second - 0xDC00);
            char::from_u32(scalar)
                .ok_or_else(|| eyre::eyre!("invalid surrogate pair at byte {}", self.pos))
        } else {
            char::from_u32(first)
                .ok_or_else(|| eyre::eyre!("invalid unicode escape at byte {}", self.pos))
        }
    }

    fn parse_hex4(&mut self) -> Result<u32> {
        ensure!(
            self.pos + 4 <= self.bytes.len(),
            "truncated unicode escape at byte {}",
            self.pos
        );
        let hex = &self.text[self.pos..self.pos + 4];
        let value = u32::from_str_radix(hex, 16)
            .map_err(|_| eyre::eyre!("invalid unicode escape '{}' at byte {}", hex, self.pos))?;
        self.pos += 4;
        Ok(value)
    }

    fn parse_number(&mut self) -> Result<Value> {
        let start = self.pos;
        while let Some(&b) = self.bytes.get(self.pos) {
            if b.is_ascii_digit() || matches!(b, b'+' | b'-' | b'.' | b'e' | b'E') {
                self.pos += 1;
            } else {
                break;
            }
        }
        let token = &self.text[start..self.pos];
        ensure!(!token.is_empty(), "invalid JSON value at byte {}", start);

        if !token.contains(['.', 'e', 'E']) {
            if let Some(n) = parse_signed(token, false) {
                return Ok(Value::Int(n));
            }
        }
        match parse_float(token, false) {
            Some(f) => Ok(Value::Float(f)),
            None => bail!("invalid number '{}' at byte {}", token, start),
        }
    }
}

fn utf8_len(first_byte: u8) -> Result<usize> {
    match first_byte {
        0x00..=0x7F => Ok(1),
        0xC0..=0xDF => Ok(2),
        0xE0..=0xEF => Ok(3),
        0xF0..=0xF7 => Ok(4),
        _ => bail!("invalid UTF-8 lead byte {:#x}", first_byte),
    }
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Int(n) => out.push_str(&n.to_string()),
        Value::Float(f) => {
            if f.is_finite() {
                out.push_str(&format_float(*f));
            } else {
                out.push_str("null");
            }
        }
        Value::String(s) => write_string(out, s),
        Value::Bytes(b) => {
            out.push('"');
            for byte in b {
                out.push_str(&format!("{:02x}", byte));
            }
            out.push('"');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Dict(map) => {
            out.push('{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                write_value(out, item);
            }
            out.push('}');
        }
    }
}

fn write_string(out: &mut String, text: &str) {
    out.push('"');
    for ch in text.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_parse() {
        assert_eq!(parse_json("null").unwrap(), Value::Null);
        assert_eq!(parse_json("true").unwrap(), Value::Bool(true));
        assert_eq!(parse_json("42").unwrap(), Value::Int(42));
        assert_eq!(parse_json("-3.5").unwrap(), Value::Float(-3.5));
        assert_eq!(parse_json("1e3").unwrap(), Value::Float(1000.0));
        assert_eq!(
            parse_json("\"hi\"").unwrap(),
            Value::String("hi".to_string())
        );
    }

    #[test]
    fn huge_integers_become_floats() {
        assert_eq!(
            parse_json("9223372036854775807").unwrap(),
            Value::Int(i64::MAX)
        );
        assert!(matches!(
            parse_json("9223372036854775808").unwrap(),
            Value::Float(_)
        ));
    }

    #[test]
    fn nested_documents_parse() {
        let doc = parse_json(r#"{"n": 1, "tags": ["a", "b"], "meta": {"ok": true}}"#).unwrap();
        let dict = doc.as_dict().unwrap();
        assert_eq!(dict.get("n"), Some(&Value::Int(1)));
        assert_eq!(
            dict.get("tags"),
            Some(&Value::Array(vec![
                Value::String("a".into()),
                Value::String("b".into())
            ]))
        );
    }

    #[test]
    fn escapes_round_trip() {
        let doc = parse_json(r#""line\nbreak \"quoted\" \u00e9 \ud83d\ude00""#).unwrap();
        assert_eq!(
            doc,
            Value::String("line\nbreak \"quoted\" \u{e9} \u{1F600}".to_string())
        );
        let rendered = to_json(&doc);
        assert_eq!(parse_json(&rendered).unwrap(), doc);
    }

    #[test]
    fn rendering_is_sorted_and_reparsable() {
        let doc = parse_json(r#"{"b": 2, "a": [1, 2.5, null, false]}"#).unwrap();
        let text = to_json(&doc);
        assert_eq!(text, r#"{"a":[1,2.5,null,false],"b":2}"#);
        assert_eq!(parse_json(&text).unwrap(), doc);
    }

    #[test]
    fn malformed_documents_are_rejected() {
        for bad in [
            "", "{", "[1,", "{\"a\"}", "{\"a\":}", "tru", "1.2.3", "\"\\x\"", "{} extra",
        ] {
            assert!(parse_json(bad).is_err(), "accepted {:?}", bad);
        }
    }
}
