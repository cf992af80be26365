//! # Zero-Copy Value Views
//!
//! Decoded views over serialized value records in a file image. A view
//! borrows the image slice and resolves nested structure lazily: loading a
//! dict does not touch its entries until they are asked for, and string
//! payloads are returned as slices of the image.
//!
//! Every read is bounds-checked against the image slice; a truncated or
//! corrupt record surfaces as an error rather than a panic, because these
//! functions run against bytes recovered from disk.
//!
//! Dictionary lookup is a binary search over the sorted entry table, the
//! same O(log n) access pattern the record format was laid out for.

use std::collections::BTreeMap;

use eyre::{bail, ensure, Result};

use crate::encoding::{decode_varint, zigzag_decode};
use crate::value::{
    Value, TAG_ARRAY, TAG_BYTES, TAG_DICT, TAG_FALSE, TAG_FLOAT, TAG_INT, TAG_NULL, TAG_STRING,
    TAG_TRUE,
};

/// Reads a little-endian u32 at `at`, bounds-checked.
pub(crate) fn read_u32(data: &[u8], at: usize) -> Result<u32> {
    ensure!(
        at + 4 <= data.len(),
        "offset {} is outside the image ({} bytes)",
        at,
        data.len()
    );
    Ok(u32::from_le_bytes([
        data[at],
        data[at + 1],
        data[at + 2],
        data[at + 3],
    ]))
}

/// Reads a key record (varint length + raw bytes) at `pos`.
pub(crate) fn load_key(data: &[u8], pos: u32) -> Result<&[u8]> {
    let at = pos as usize;
    ensure!(at < data.len(), "key offset {} is outside the image", at);
    let (len, used) = decode_varint(&data[at..])?;
    let start = at + used;
    let end = start + len as usize;
    ensure!(end <= data.len(), "key at {} is truncated", at);
    Ok(&data[start..end])
}

/// A decoded value record borrowed from the image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueView<'a> {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(&'a str),
    Bytes(&'a [u8]),
    Array(ArrayView<'a>),
    Dict(DictView<'a>),
}

/// Decodes the value record at `pos`.
pub fn load_value(data: &[u8], pos: u32) -> Result<ValueView<'_>> {
    let at = pos as usize;
    ensure!(at < data.len(), "value offset {} is outside the image", at);
    let body = &data[at + 1..];

    match data[at] {
        TAG_NULL => Ok(ValueView::Null),
        TAG_FALSE => Ok(ValueView::Bool(false)),
        TAG_TRUE => Ok(ValueView::Bool(true)),
        TAG_INT => {
            let (raw, _) = decode_varint(body)?;
            Ok(ValueView::Int(zigzag_decode(raw)))
        }
        TAG_FLOAT => {
            ensure!(body.len() >= 8, "float record at {} is truncated", at);
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&body[..8]);
            Ok(ValueView::Float(f64::from_le_bytes(bytes)))
        }
        TAG_STRING => {
            let (len, used) = decode_varint(body)?;
            let start = at + 1 + used;
            let end = start + len as usize;
            ensure!(end <= data.len(), "string record at {} is truncated", at);
            let text = std::str::from_utf8(&data[start..end])
                .map_err(|e| eyre::eyre!("invalid UTF-8 in string record at {}: {}", at, e))?;
            Ok(ValueView::String(text))
        }
        TAG_BYTES => {
            let (len, used) = decode_varint(body)?;
            let start = at + 1 + used;
            let end = start + len as usize;
            ensure!(end <= data.len(), "bytes record at {} is truncated", at);
            Ok(ValueView::Bytes(&data[start..end]))
        }
        TAG_ARRAY => {
            let (count, used) = decode_varint(body)?;
            let entries = at + 1 + used;
            ensure!(
                entries + count as usize * 4 <= data.len(),
                "array record at {} is truncated",
                at
            );
            Ok(ValueView::Array(ArrayView {
                data,
                entries,
                count: count as usize,
            }))
        }
        TAG_DICT => {
            let (count, used) = decode_varint(body)?;
            let entries = at + 1 + used;
            ensure!(
                entries + count as usize * 8 <= data.len(),
                "dict record at {} is truncated",
                at
            );
            Ok(ValueView::Dict(DictView {
                data,
                entries,
                count: count as usize,
            }))
        }
        tag => bail!("unknown value tag {} at offset {}", tag, at),
    }
}

impl<'a> ValueView<'a> {
    /// Deep-decodes into an owned [`Value`].
    pub fn to_value(&self) -> Result<Value> {
        match self {
            ValueView::Null => Ok(Value::Null),
            ValueView::Bool(b) => Ok(Value::Bool(*b)),
            ValueView::Int(n) => Ok(Value::Int(*n)),
            ValueView::Float(f) => Ok(Value::Float(*f)),
            ValueView::String(s) => Ok(Value::String(s.to_string())),
            ValueView::Bytes(b) => Ok(Value::Bytes(b.to_vec())),
            ValueView::Array(array) => array.to_value(),
            ValueView::Dict(dict) => dict.to_value(),
        }
    }
}

/// View over an array record's entry table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArrayView<'a> {
    data: &'a [u8],
    entries: usize,
    count: usize,
}

impl<'a> ArrayView<'a> {
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Offset of element `index` in the image.
    pub(crate) fn offset_at(&self, index: usize) -> Result<u32> {
        ensure!(
            index < self.count,
            "array index {} out of bounds ({})",
            index,
            self.count
        );
        read_u32(self.data, self.entries + index * 4)
    }

    pub fn get(&self, index: usize) -> Result<ValueView<'a>> {
        load_value(self.data, self.offset_at(index)?)
    }

    pub fn to_value(&self) -> Result<Value> {
        let mut items = Vec::with_capacity(self.count);
        for i in 0..self.count {
            items.push(self.get(i)?.to_value()?);
        }
        Ok(Value::Array(items))
    }
}

/// View over a dict record's sorted entry table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DictView<'a> {
    data: &'a [u8],
    entries: usize,
    count: usize,
}

impl<'a> DictView<'a> {
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Key bytes and value offset of entry `index`.
    pub(crate) fn entry(&self, index: usize) -> Result<(&'a [u8], u32)> {
        ensure!(
            index < self.count,
            "dict index {} out of bounds ({})",
            index,
            self.count
        );
        let at = self.entries + index * 8;
        let key_pos = read_u32(self.data, at)?;
        let value_pos = read_u32(self.data, at + 4)?;
        Ok((load_key(self.data, key_pos)?, value_pos))
    }

    /// Binary search for `key` over the sorted entry table, returning the
    /// value offset.
    pub(crate) fn get_offset(&self, key: &[u8]) -> Result<Option<u32>> {
        let mut low = 0usize;
        let mut high = self.count;
        while low < high {
            let mid = (low + high) / 2;
            let (mid_key, value_pos) = self.entry(mid)?;
            match mid_key.cmp(key) {
                std::cmp::Ordering::Equal => return Ok(Some(value_pos)),
                std::cmp::Ordering::Less => low = mid + 1,
                std::cmp::Ordering::Greater => high = mid,
            }
        }
        Ok(None)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<ValueView<'a>>> {
        match self.get_offset(key)? {
            Some(pos) => load_value(self.data, pos).map(Some),
            None => Ok(None),
        }
    }

    /// All entries in key order, as (key bytes, value offset).
    pub(crate) fn entries(&self) -> Result<Vec<(&'a [u8], u32)>> {
        let mut out = Vec::with_capacity(self.count);
        for i in 0..self.count {
            out.push(self.entry(i)?);
        }
        Ok(out)
    }

    pub fn to_value(&self) -> Result<Value> {
        let mut map = BTreeMap::new();
        for i in 0..self.count {
            let (key, value_pos) = self.entry(i)?;
            let key = std::str::from_utf8(key)
                .map_err(|e| eyre::eyre!("dict key is not UTF-8: {}", e))?
                .to_string();
            map.insert(key, load_value(self.data, value_pos)?.to_value()?);
        }
        Ok(Value::Dict(map))
    }
}
