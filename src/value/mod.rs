//! # Document Value Model
//!
//! Documents are trees of scalars, arrays, and dictionaries. Three
//! representations exist, used at different points of a value's life:
//!
//! - [`Value`]: the owned in-memory form, used to build documents and
//!   returned by reads
//! - [`view::ValueView`]: a zero-copy decoded view over serialized bytes
//!   in the file image
//! - [`heap::HeapValue`]: the mutable overlay form, holding either a
//!   pointer into the image, an owned value, or a shared mutable
//!   collection promoted by `get_mutable`
//!
//! ## Serialized Form
//!
//! Every value record starts with a tag byte:
//!
//! ```text
//!  0 null    1 false    2 true
//!  3 int     zigzag varint
//!  4 float   8-byte LE f64
//!  5 string  varint length + UTF-8 bytes
//!  6 bytes   varint length + raw bytes
//!  7 array   varint count + count x u32 child offsets
//!  8 dict    varint count + count x {u32 key offset, u32 value offset}
//! ```
//!
//! Dict entries are sorted ascending by key bytes, which gives dictionary
//! lookup by binary search and lets the overlay merge sorted streams. Key
//! records are a varint length plus raw bytes, with no tag. Children are
//! always written before the record that references them, so every stored
//! offset points strictly backward in the file.

pub mod encoder;
pub mod heap;
pub mod view;

pub use encoder::Encoder;
pub use heap::{HeapValue, MutableArray, MutableDict};
pub use view::{ArrayView, DictView, ValueView};

use std::collections::BTreeMap;

use eyre::Result;

pub(crate) const TAG_NULL: u8 = 0;
pub(crate) const TAG_FALSE: u8 = 1;
pub(crate) const TAG_TRUE: u8 = 2;
pub(crate) const TAG_INT: u8 = 3;
pub(crate) const TAG_FLOAT: u8 = 4;
pub(crate) const TAG_STRING: u8 = 5;
pub(crate) const TAG_BYTES: u8 = 6;
pub(crate) const TAG_ARRAY: u8 = 7;
pub(crate) const TAG_DICT: u8 = 8;

/// Which kind of collection a mutable promotion is expected to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionKind {
    Dict,
    Array,
}

/// An owned document value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Dict(BTreeMap<String, Value>),
}

impl Value {
    /// Parses a JSON document into a value.
    pub fn from_json(text: &str) -> Result<Value> {
        crate::parsing::json::parse_json(text)
    }

    /// Renders the value as compact JSON.
    pub fn to_json(&self) -> String {
        crate::parsing::json::to_json(self)
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Dict(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Dictionary member lookup; `None` for missing keys and non-dicts.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict().and_then(|map| map.get(key))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}
