//! # Streaming Value Encoder
//!
//! Serializes values into an output stream while tracking the absolute
//! file offset of every byte written. Offsets, not the writer position,
//! are the currency of the file format: records reference each other by
//! absolute offset, and a delta append may reference records in the
//! already-committed prefix of the file instead of rewriting them.
//!
//! The encoder is generic over `std::io::Write`; commits feed it a
//! buffered file handle, compaction a fresh file, and tests a `Vec<u8>`.
//!
//! ## Delta Base
//!
//! An encoder built with [`Encoder::with_base`] knows the length of the
//! image it is appending to. Callers ask [`Encoder::can_reuse`] whether an
//! existing record offset falls inside that base; if so the offset is
//! emitted as-is and no bytes are written. A non-delta encoder reuses
//! nothing, which is what produces a self-contained compacted file.

use std::io::Write;

use eyre::{Result, WrapErr};

use crate::encoding::{encode_varint, zigzag_encode};
use crate::parsing::numeric::narrow_to_u32;
use crate::value::view::{load_value, ValueView};
use crate::value::{
    Value, TAG_ARRAY, TAG_BYTES, TAG_DICT, TAG_FALSE, TAG_FLOAT, TAG_INT, TAG_NULL, TAG_STRING,
    TAG_TRUE,
};

pub struct Encoder<W: Write> {
    out: W,
    pos: u64,
    start: u64,
    base_len: u64,
}

impl<W: Write> Encoder<W> {
    /// Encoder with no delta base; everything is written fresh.
    pub fn new(out: W, start: u64) -> Self {
        Self {
            out,
            pos: start,
            start,
            base_len: 0,
        }
    }

    /// Encoder appending after an existing image of `base_len` bytes;
    /// offsets below `base_len` may be reused instead of re-encoded.
    pub fn with_base(out: W, start: u64, base_len: u64) -> Self {
        Self {
            out,
            pos: start,
            start,
            base_len,
        }
    }

    /// Absolute file offset of the next byte to be written.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Bytes emitted since construction.
    pub fn bytes_written(&self) -> u64 {
        self.pos - self.start
    }

    /// Whether this encoder appends against a delta base.
    pub fn is_delta(&self) -> bool {
        self.base_len > 0
    }

    /// Whether a record at `offset` already exists in the delta base and
    /// can be referenced instead of rewritten.
    pub fn can_reuse(&self, offset: u32) -> bool {
        self.is_delta() && (offset as u64) < self.base_len
    }

    pub(crate) fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.out
            .write_all(bytes)
            .wrap_err("failed to write snapshot data")?;
        self.pos += bytes.len() as u64;
        Ok(())
    }

    pub(crate) fn write_varint(&mut self, value: u64) -> Result<()> {
        let mut buf = [0u8; 9];
        let len = encode_varint(value, &mut buf);
        self.write_all(&buf[..len])
    }

    /// Pads with zero bytes so the next write starts at a multiple of
    /// `align`.
    pub(crate) fn align_to(&mut self, align: u64) -> Result<()> {
        let rem = self.pos % align;
        if rem != 0 {
            let pad = [0u8; 8];
            self.write_all(&pad[..(align - rem) as usize])?;
        }
        Ok(())
    }

    /// Writes a key record, returning its offset.
    pub(crate) fn write_key(&mut self, key: &[u8]) -> Result<u32> {
        let at = narrow_to_u32(self.pos);
        self.write_varint(key.len() as u64)?;
        self.write_all(key)?;
        Ok(at)
    }

    /// Serializes an owned value tree, returning the offset of its root
    /// record. Children are emitted before the records that reference
    /// them.
    pub fn encode_value(&mut self, value: &Value) -> Result<u32> {
        match value {
            Value::Null => self.write_tag(TAG_NULL),
            Value::Bool(false) => self.write_tag(TAG_FALSE),
            Value::Bool(true) => self.write_tag(TAG_TRUE),
            Value::Int(n) => {
                let at = narrow_to_u32(self.pos);
                self.write_all(&[TAG_INT])?;
                self.write_varint(zigzag_encode(*n))?;
                Ok(at)
            }
            Value::Float(f) => {
                let at = narrow_to_u32(self.pos);
                self.write_all(&[TAG_FLOAT])?;
                self.write_all(&f.to_le_bytes())?;
                Ok(at)
            }
            Value::String(s) => self.write_payload(TAG_STRING, s.as_bytes()),
            Value::Bytes(b) => self.write_payload(TAG_BYTES, b),
            Value::Array(items) => {
                let mut offsets = Vec::with_capacity(items.len());
                for item in items {
                    offsets.push(self.encode_value(item)?);
                }
                self.write_array_record(&offsets)
            }
            Value::Dict(map) => {
                let mut entries = Vec::with_capacity(map.len());
                for (key, item) in map {
                    let key_pos = self.write_key(key.as_bytes())?;
                    let value_pos = self.encode_value(item)?;
                    entries.push((key_pos, value_pos));
                }
                self.write_dict_record(&entries)
            }
        }
    }

    /// Deep-copies a serialized value from `source` into this stream,
    /// returning the offset of the copy. Used by non-delta writes, where
    /// records in the old image cannot be referenced.
    pub(crate) fn encode_view(&mut self, source: &[u8], pos: u32) -> Result<u32> {
        match load_value(source, pos)? {
            ValueView::Null => self.write_tag(TAG_NULL),
            ValueView::Bool(false) => self.write_tag(TAG_FALSE),
            ValueView::Bool(true) => self.write_tag(TAG_TRUE),
            ValueView::Int(n) => {
                let at = narrow_to_u32(self.pos);
                self.write_all(&[TAG_INT])?;
                self.write_varint(zigzag_encode(n))?;
                Ok(at)
            }
            ValueView::Float(f) => {
                let at = narrow_to_u32(self.pos);
                self.write_all(&[TAG_FLOAT])?;
                self.write_all(&f.to_le_bytes())?;
                Ok(at)
            }
            ValueView::String(s) => self.write_payload(TAG_STRING, s.as_bytes()),
            ValueView::Bytes(b) => self.write_payload(TAG_BYTES, b),
            ValueView::Array(array) => {
                let mut offsets = Vec::with_capacity(array.len());
                for i in 0..array.len() {
                    let child = array.offset_at(i)?;
                    offsets.push(self.encode_view(source, child)?);
                }
                self.write_array_record(&offsets)
            }
            ValueView::Dict(dict) => {
                let mut entries = Vec::with_capacity(dict.len());
                for i in 0..dict.len() {
                    let (key, child) = dict.entry(i)?;
                    let key_pos = self.write_key(key)?;
                    let value_pos = self.encode_view(source, child)?;
                    entries.push((key_pos, value_pos));
                }
                self.write_dict_record(&entries)
            }
        }
    }

    /// Writes an array record over already-encoded children.
    pub(crate) fn write_array_record(&mut self, offsets: &[u32]) -> Result<u32> {
        let at = narrow_to_u32(self.pos);
        self.write_all(&[TAG_ARRAY])?;
        self.write_varint(offsets.len() as u64)?;
        for offset in offsets {
            self.write_all(&offset.to_le_bytes())?;
        }
        Ok(at)
    }

    /// Writes a dict record over already-encoded keys and values. Entries
    /// must be sorted ascending by key bytes.
    pub(crate) fn write_dict_record(&mut self, entries: &[(u32, u32)]) -> Result<u32> {
        let at = narrow_to_u32(self.pos);
        self.write_all(&[TAG_DICT])?;
        self.write_varint(entries.len() as u64)?;
        for (key_pos, value_pos) in entries {
            self.write_all(&key_pos.to_le_bytes())?;
            self.write_all(&value_pos.to_le_bytes())?;
        }
        Ok(at)
    }

    fn write_tag(&mut self, tag: u8) -> Result<u32> {
        let at = narrow_to_u32(self.pos);
        self.write_all(&[tag])?;
        Ok(at)
    }

    fn write_payload(&mut self, tag: u8, payload: &[u8]) -> Result<u32> {
        let at = narrow_to_u32(self.pos);
        self.write_all(&[tag])?;
        self.write_varint(payload.len() as u64)?;
        self.write_all(payload)?;
        Ok(at)
    }
}
