//! # Heap Collections
//!
//! Mutable, reference-counted forms of document values. A value reached
//! through `get_mutable` is *promoted*: its immutable representation (a
//! record in the file image, or an owned value put earlier in the session)
//! is wrapped in a shared mutable collection that the overlay retains
//! until commit or revert.
//!
//! Promotion is shallow: a promoted dict wraps its source record and
//! copies nothing until individual entries are written, and a promoted
//! array copies only the element pointer table. Repeated `get_mutable`
//! calls for the same key return handles to the same shared collection.
//!
//! References always point from parent collection to child, so plain
//! reference counting suffices; no cycles can arise.

use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::RwLock;

use crate::storage::MappedFile;
use crate::trie::overlay::Overlay;
use crate::value::view::{load_value, ValueView};
use crate::value::{CollectionKind, Value};

/// A pending value held by an overlay slot or array element.
#[derive(Debug, Clone)]
pub enum HeapValue {
    /// A value already serialized in the file image.
    Stored(u32),
    /// An owned immutable value from this session.
    Owned(Value),
    /// A shared mutable dict promotion.
    Dict(Arc<RwLock<Overlay>>),
    /// A shared mutable array promotion.
    Array(Arc<RwLock<HeapArray>>),
}

impl HeapValue {
    /// Deep-decodes into an owned [`Value`], resolving in-file pointers
    /// through `data`.
    pub(crate) fn to_value(&self, data: &[u8]) -> Result<Value> {
        match self {
            HeapValue::Stored(pos) => load_value(data, *pos)?.to_value(),
            HeapValue::Owned(value) => Ok(value.clone()),
            HeapValue::Dict(dict) => dict.read().to_value(data),
            HeapValue::Array(array) => array.read().to_value(data),
        }
    }

    /// This value as a shared collection of `kind`, if it already is one.
    pub(crate) fn as_collection(&self, kind: CollectionKind) -> Option<HeapValue> {
        match (self, kind) {
            (HeapValue::Dict(_), CollectionKind::Dict) => Some(self.clone()),
            (HeapValue::Array(_), CollectionKind::Array) => Some(self.clone()),
            _ => None,
        }
    }

    /// Promotes an in-file value to a mutable collection when its kind
    /// matches; `None` otherwise.
    pub(crate) fn promote_stored(
        data: &[u8],
        pos: u32,
        kind: CollectionKind,
    ) -> Result<Option<HeapValue>> {
        match (load_value(data, pos)?, kind) {
            (ValueView::Dict(_), CollectionKind::Dict) => Ok(Some(HeapValue::Dict(Arc::new(
                RwLock::new(Overlay::from_dict(data, pos)?),
            )))),
            (ValueView::Array(array), CollectionKind::Array) => Ok(Some(HeapValue::Array(
                Arc::new(RwLock::new(HeapArray::from_view(&array)?)),
            ))),
            _ => Ok(None),
        }
    }

    /// Promotes an owned value to a mutable collection when its kind
    /// matches; `None` otherwise.
    pub(crate) fn promote_owned(value: &Value, kind: CollectionKind) -> Result<Option<HeapValue>> {
        match (value, kind) {
            (Value::Dict(map), CollectionKind::Dict) => Ok(Some(HeapValue::Dict(Arc::new(
                RwLock::new(Overlay::from_value_dict(map)),
            )))),
            (Value::Array(items), CollectionKind::Array) => Ok(Some(HeapValue::Array(Arc::new(
                RwLock::new(HeapArray::from_values(items)),
            )))),
            _ => Ok(None),
        }
    }
}

/// A mutable array: elements are heap values, promoted lazily.
#[derive(Debug, Default)]
pub struct HeapArray {
    items: Vec<HeapValue>,
}

impl HeapArray {
    pub(crate) fn from_view(view: &crate::value::ArrayView) -> Result<Self> {
        let mut items = Vec::with_capacity(view.len());
        for i in 0..view.len() {
            items.push(HeapValue::Stored(view.offset_at(i)?));
        }
        Ok(Self { items })
    }

    pub(crate) fn from_values(values: &[Value]) -> Self {
        Self {
            items: values
                .iter()
                .map(|v| HeapValue::Owned(v.clone()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn get(&self, data: &[u8], index: usize) -> Result<Option<Value>> {
        match self.items.get(index) {
            Some(item) => item.to_value(data).map(Some),
            None => Ok(None),
        }
    }

    pub(crate) fn set(&mut self, index: usize, value: Value) -> Result<()> {
        ensure!(
            index < self.items.len(),
            "array index {} out of bounds ({})",
            index,
            self.items.len()
        );
        self.items[index] = HeapValue::Owned(value);
        Ok(())
    }

    pub(crate) fn push(&mut self, value: Value) {
        self.items.push(HeapValue::Owned(value));
    }

    pub(crate) fn remove(&mut self, index: usize) -> Result<()> {
        ensure!(
            index < self.items.len(),
            "array index {} out of bounds ({})",
            index,
            self.items.len()
        );
        self.items.remove(index);
        Ok(())
    }

    pub(crate) fn get_mutable(
        &mut self,
        data: &[u8],
        index: usize,
        kind: CollectionKind,
    ) -> Result<Option<HeapValue>> {
        let Some(item) = self.items.get_mut(index) else {
            return Ok(None);
        };
        if let Some(existing) = item.as_collection(kind) {
            return Ok(Some(existing));
        }
        let promoted = match item {
            HeapValue::Stored(pos) => HeapValue::promote_stored(data, *pos, kind)?,
            HeapValue::Owned(owned) => HeapValue::promote_owned(owned, kind)?,
            _ => None,
        };
        if let Some(promoted) = &promoted {
            *item = promoted.clone();
        }
        Ok(promoted)
    }

    pub(crate) fn to_value(&self, data: &[u8]) -> Result<Value> {
        let mut items = Vec::with_capacity(self.items.len());
        for item in &self.items {
            items.push(item.to_value(data)?);
        }
        Ok(Value::Array(items))
    }

    pub(crate) fn items(&self) -> &[HeapValue] {
        &self.items
    }
}

/// Shared handle to a mutable dict installed in the overlay. Edits made
/// through the handle are part of the next commit; after a commit or
/// revert the handle is detached from the database and further edits have
/// no effect.
#[derive(Clone)]
pub struct MutableDict {
    inner: Arc<RwLock<Overlay>>,
    file: Arc<MappedFile>,
    snapshot_len: u64,
}

impl MutableDict {
    pub(crate) fn new(inner: Arc<RwLock<Overlay>>, file: Arc<MappedFile>, snapshot_len: u64) -> Self {
        Self {
            inner,
            file,
            snapshot_len,
        }
    }

    fn data(&self) -> &[u8] {
        &self.file.contents()[..self.snapshot_len as usize]
    }

    pub fn len(&self) -> usize {
        self.inner.read().count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.inner.read().get_value(self.data(), key.as_bytes())
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.inner
            .write()
            .set(self.data(), key.as_bytes(), HeapValue::Owned(value.into()))
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        self.inner.write().remove(self.data(), key.as_bytes())
    }

    pub fn remove_all(&self) -> Result<()> {
        self.inner.write().remove_all(self.data())
    }

    /// Promotes the nested dict at `key` and returns a handle to it.
    pub fn get_mutable_dict(&self, key: &str) -> Result<Option<MutableDict>> {
        let promoted =
            self.inner
                .write()
                .get_mutable(self.data(), key.as_bytes(), CollectionKind::Dict)?;
        Ok(promoted.and_then(|value| match value {
            HeapValue::Dict(dict) => Some(MutableDict::new(
                dict,
                Arc::clone(&self.file),
                self.snapshot_len,
            )),
            _ => None,
        }))
    }

    /// Promotes the nested array at `key` and returns a handle to it.
    pub fn get_mutable_array(&self, key: &str) -> Result<Option<MutableArray>> {
        let promoted =
            self.inner
                .write()
                .get_mutable(self.data(), key.as_bytes(), CollectionKind::Array)?;
        Ok(promoted.and_then(|value| match value {
            HeapValue::Array(array) => Some(MutableArray {
                inner: array,
                file: Arc::clone(&self.file),
                snapshot_len: self.snapshot_len,
            }),
            _ => None,
        }))
    }

    /// The effective contents as an owned document.
    pub fn to_value(&self) -> Result<Value> {
        self.inner.read().to_value(self.data())
    }

    /// The effective entries, sorted by key.
    pub fn entries(&self) -> Result<Vec<(String, Value)>> {
        let data = self.data();
        let mut inner = self.inner.write();
        let pairs = inner.kv_pairs(data)?;
        pairs
            .iter()
            .map(|(key, value)| {
                let key = std::str::from_utf8(key)
                    .map_err(|e| eyre::eyre!("dict key is not UTF-8: {}", e))?
                    .to_string();
                Ok((key, value.clone()))
            })
            .collect()
    }
}

impl std::fmt::Debug for MutableDict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutableDict")
            .field("len", &self.len())
            .finish()
    }
}

/// Shared handle to a mutable array, with the same lifetime rules as
/// [`MutableDict`].
#[derive(Clone)]
pub struct MutableArray {
    inner: Arc<RwLock<HeapArray>>,
    file: Arc<MappedFile>,
    snapshot_len: u64,
}

impl MutableArray {
    fn data(&self) -> &[u8] {
        &self.file.contents()[..self.snapshot_len as usize]
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn get(&self, index: usize) -> Result<Option<Value>> {
        self.inner.read().get(self.data(), index)
    }

    pub fn set(&self, index: usize, value: impl Into<Value>) -> Result<()> {
        self.inner.write().set(index, value.into())
    }

    pub fn push(&self, value: impl Into<Value>) {
        self.inner.write().push(value.into());
    }

    pub fn remove(&self, index: usize) -> Result<()> {
        self.inner.write().remove(index)
    }

    pub fn get_mutable_dict(&self, index: usize) -> Result<Option<MutableDict>> {
        let promoted = self
            .inner
            .write()
            .get_mutable(self.data(), index, CollectionKind::Dict)?;
        Ok(promoted.and_then(|value| match value {
            HeapValue::Dict(dict) => Some(MutableDict::new(
                dict,
                Arc::clone(&self.file),
                self.snapshot_len,
            )),
            _ => None,
        }))
    }

    pub fn get_mutable_array(&self, index: usize) -> Result<Option<MutableArray>> {
        let promoted = self
            .inner
            .write()
            .get_mutable(self.data(), index, CollectionKind::Array)?;
        Ok(promoted.and_then(|value| match value {
            HeapValue::Array(array) => Some(MutableArray {
                inner: array,
                file: Arc::clone(&self.file),
                snapshot_len: self.snapshot_len,
            }),
            _ => None,
        }))
    }

    pub fn to_value(&self) -> Result<Value> {
        self.inner.read().to_value(self.data())
    }
}

impl std::fmt::Debug for MutableArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutableArray")
            .field("len", &self.len())
            .finish()
    }
}
