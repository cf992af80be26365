//! # Mutable Overlay
//!
//! The copy-on-write shadow that accumulates changes between commits. An
//! overlay wraps an optional immutable source (the snapshot trie at the
//! database level, or an in-file dict record for a promoted nested
//! collection) and records per-key slots:
//!
//! - an occupied slot shadows whatever the source holds for that key
//! - an [`ValueSlot::Empty`] slot over a source-present key is a
//!   tombstone, meaning "removed"
//!
//! Key bytes live inside the map entries, so erasing a key releases its
//! storage with it.
//!
//! ## Merged Iteration
//!
//! The source yields its entries sorted by key and the overlay map is a
//! sorted map, so the effective contents are produced by a streaming
//! merge: the overlay wins ties (as an override or a tombstone), and
//! tombstoned keys are skipped entirely. The `count` field is maintained
//! incrementally so the effective size never requires a scan.

use std::collections::BTreeMap;

use eyre::Result;

use crate::trie::persistent::HashTrie;
use crate::value::heap::HeapValue;
use crate::value::view::{load_value, ValueView};
use crate::value::{CollectionKind, Value};

/// One overlay entry: a pending value, or a tombstone.
#[derive(Debug, Clone)]
pub enum ValueSlot {
    /// Tombstone: the key is removed, shadowing the source.
    Empty,
    /// The key's pending value.
    Occupied(HeapValue),
}

impl ValueSlot {
    pub fn is_empty(&self) -> bool {
        matches!(self, ValueSlot::Empty)
    }
}

/// Where an overlay's unchanged entries come from.
#[derive(Debug, Clone, Copy)]
pub(crate) enum OverlaySource {
    /// The snapshot index trie.
    Trie(HashTrie),
    /// A dict record in the file image.
    Dict(u32),
}

impl OverlaySource {
    fn get(&self, data: &[u8], key: &[u8]) -> Result<Option<u32>> {
        match self {
            OverlaySource::Trie(trie) => trie.get(data, key),
            OverlaySource::Dict(pos) => match load_value(data, *pos)? {
                ValueView::Dict(dict) => dict.get_offset(key),
                _ => Ok(None),
            },
        }
    }

    fn entries<'a>(&self, data: &'a [u8]) -> Result<Vec<(&'a [u8], u32)>> {
        match self {
            OverlaySource::Trie(trie) => trie.entries(data),
            OverlaySource::Dict(pos) => match load_value(data, *pos)? {
                ValueView::Dict(dict) => dict.entries(),
                _ => Ok(Vec::new()),
            },
        }
    }
}

/// A mutable shadow over an optional immutable source.
#[derive(Debug, Default)]
pub struct Overlay {
    source: Option<OverlaySource>,
    map: BTreeMap<Box<[u8]>, ValueSlot>,
    count: u64,
    changed: bool,
    projection: Option<Vec<(Box<[u8]>, Value)>>,
}

impl Overlay {
    /// Overlay over a snapshot trie (the database index).
    pub(crate) fn with_trie(trie: HashTrie) -> Self {
        Self {
            source: Some(OverlaySource::Trie(trie)),
            count: trie.count() as u64,
            ..Self::default()
        }
    }

    /// Overlay over an in-file dict record (a promoted nested dict).
    pub(crate) fn from_dict(data: &[u8], pos: u32) -> Result<Self> {
        let len = match load_value(data, pos)? {
            ValueView::Dict(dict) => dict.len(),
            other => eyre::bail!("expected a dict record, found {:?}", other),
        };
        Ok(Self {
            source: Some(OverlaySource::Dict(pos)),
            count: len as u64,
            ..Self::default()
        })
    }

    /// Overlay materialized from an owned dict value (a document that was
    /// put in this session and then promoted to mutable form).
    pub(crate) fn from_value_dict(map: &BTreeMap<String, Value>) -> Self {
        let entries = map
            .iter()
            .map(|(k, v)| {
                (
                    k.as_bytes().into(),
                    ValueSlot::Occupied(HeapValue::Owned(v.clone())),
                )
            })
            .collect::<BTreeMap<_, _>>();
        Self {
            source: None,
            count: entries.len() as u64,
            map: entries,
            ..Self::default()
        }
    }

    /// Effective number of keys: source keys not tombstoned plus
    /// overlay-only keys.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Whether any mutation happened since this overlay was created.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub(crate) fn mark_changed(&mut self) {
        self.changed = true;
        self.projection = None;
    }

    /// Raw pending slots, sorted by key. Tombstones included.
    pub(crate) fn pending(&self) -> impl Iterator<Item = (&[u8], &ValueSlot)> {
        self.map.iter().map(|(k, v)| (k.as_ref(), v))
    }

    /// Effective lookup: the overlay slot wins when present.
    pub(crate) fn get_value(&self, data: &[u8], key: &[u8]) -> Result<Option<Value>> {
        match self.map.get(key) {
            Some(ValueSlot::Empty) => Ok(None),
            Some(ValueSlot::Occupied(value)) => value.to_value(data).map(Some),
            None => match self.source_get(data, key)? {
                Some(pos) => load_value(data, pos)?.to_value().map(Some),
                None => Ok(None),
            },
        }
    }

    /// Effective existence check without decoding the value.
    pub(crate) fn contains(&self, data: &[u8], key: &[u8]) -> Result<bool> {
        match self.map.get(key) {
            Some(slot) => Ok(!slot.is_empty()),
            None => Ok(self.source_get(data, key)?.is_some()),
        }
    }

    fn source_get(&self, data: &[u8], key: &[u8]) -> Result<Option<u32>> {
        match &self.source {
            Some(source) => source.get(data, key),
            None => Ok(None),
        }
    }

    /// Installs a value for `key`, shadowing the source.
    pub(crate) fn set(&mut self, data: &[u8], key: &[u8], value: HeapValue) -> Result<()> {
        if !self.contains(data, key)? {
            self.count += 1;
        }
        self.map.insert(key.into(), ValueSlot::Occupied(value));
        self.mark_changed();
        Ok(())
    }

    /// Removes `key`, returning whether it existed. A source-present key
    /// is tombstoned; an overlay-only key is erased outright.
    pub(crate) fn remove(&mut self, data: &[u8], key: &[u8]) -> Result<bool> {
        if self.source_get(data, key)?.is_some() {
            if let Some(ValueSlot::Empty) = self.map.insert(key.into(), ValueSlot::Empty) {
                return Ok(false); // already removed
            }
        } else {
            match self.map.remove(key) {
                None | Some(ValueSlot::Empty) => return Ok(false),
                Some(ValueSlot::Occupied(_)) => {}
            }
        }
        self.count -= 1;
        self.mark_changed();
        Ok(true)
    }

    /// Removes every key: clears the overlay, then tombstones each
    /// surviving source key so iteration reports an empty collection.
    pub(crate) fn remove_all(&mut self, data: &[u8]) -> Result<()> {
        if self.count == 0 {
            return Ok(());
        }
        self.map.clear();
        if let Some(source) = &self.source {
            let tombstones = source
                .entries(data)?
                .into_iter()
                .map(|(key, _)| (key.into(), ValueSlot::Empty))
                .collect();
            self.map = tombstones;
        }
        self.count = 0;
        self.mark_changed();
        Ok(())
    }

    /// Returns the mutable collection at `key`, promoting an in-file or
    /// owned value if needed. `None` when the key is absent, tombstoned,
    /// or holds a value of the wrong kind. A successful return marks the
    /// overlay changed, since the caller can now mutate the result.
    pub(crate) fn get_mutable(
        &mut self,
        data: &[u8],
        key: &[u8],
        kind: CollectionKind,
    ) -> Result<Option<HeapValue>> {
        let result = if let Some(slot) = self.map.get_mut(key) {
            slot.make_mutable(data, kind)?
        } else if let Some(pos) = self.source_get(data, key)? {
            match HeapValue::promote_stored(data, pos, kind)? {
                Some(promoted) => {
                    self.map
                        .insert(key.into(), ValueSlot::Occupied(promoted.clone()));
                    Some(promoted)
                }
                None => None,
            }
        } else {
            None
        };
        if result.is_some() {
            self.mark_changed();
        }
        Ok(result)
    }

    /// Streaming sorted merge of source and overlay.
    pub(crate) fn merged<'a>(&'a self, data: &'a [u8]) -> Result<MergedIter<'a>> {
        let source = match &self.source {
            Some(source) => source.entries(data)?,
            None => Vec::new(),
        };
        Ok(MergedIter {
            source: source.into_iter().peekable(),
            overlay: self.map.iter().peekable(),
            remaining: self.count,
        })
    }

    /// The effective contents as an owned dict. Keys must be UTF-8.
    pub(crate) fn to_value(&self, data: &[u8]) -> Result<Value> {
        let mut map = BTreeMap::new();
        for (key, value) in self.merged(data)? {
            let key = std::str::from_utf8(key)
                .map_err(|e| eyre::eyre!("dict key is not UTF-8: {}", e))?
                .to_string();
            map.insert(key, value.to_value(data)?);
        }
        Ok(Value::Dict(map))
    }

    /// Lazily built flat projection of the effective contents, invalidated
    /// by every mutation.
    pub(crate) fn kv_pairs(&mut self, data: &[u8]) -> Result<&[(Box<[u8]>, Value)]> {
        if self.projection.is_none() {
            let mut flat = Vec::with_capacity(self.count as usize);
            for (key, value) in self.merged(data)? {
                flat.push((key.into(), value.to_value(data)?));
            }
            self.projection = Some(flat);
        }
        Ok(self.projection.as_deref().unwrap())
    }
}

impl ValueSlot {
    /// Promotes this slot's value to a shared mutable collection of the
    /// requested kind, replacing the slot contents when a promotion
    /// happens.
    fn make_mutable(&mut self, data: &[u8], kind: CollectionKind) -> Result<Option<HeapValue>> {
        match self {
            ValueSlot::Empty => Ok(None),
            ValueSlot::Occupied(value) => {
                if let Some(existing) = value.as_collection(kind) {
                    return Ok(Some(existing));
                }
                let promoted = match value {
                    HeapValue::Stored(pos) => HeapValue::promote_stored(data, *pos, kind)?,
                    HeapValue::Owned(owned) => HeapValue::promote_owned(owned, kind)?,
                    _ => None,
                };
                if let Some(promoted) = &promoted {
                    *value = promoted.clone();
                }
                Ok(promoted)
            }
        }
    }
}

/// A merged entry's value: either a pointer into the image or a pending
/// heap value.
#[derive(Debug, Clone, Copy)]
pub(crate) enum MergedValue<'a> {
    Stored(u32),
    Heap(&'a HeapValue),
}

impl MergedValue<'_> {
    pub(crate) fn to_value(&self, data: &[u8]) -> Result<Value> {
        match self {
            MergedValue::Stored(pos) => load_value(data, *pos)?.to_value(),
            MergedValue::Heap(value) => value.to_value(data),
        }
    }
}

/// Streaming merge of the sorted source entries and the sorted overlay
/// map. Overlay entries win ties; tombstones are skipped.
pub(crate) struct MergedIter<'a> {
    source: std::iter::Peekable<std::vec::IntoIter<(&'a [u8], u32)>>,
    overlay: std::iter::Peekable<std::collections::btree_map::Iter<'a, Box<[u8]>, ValueSlot>>,
    remaining: u64,
}

impl<'a> Iterator for MergedIter<'a> {
    type Item = (&'a [u8], MergedValue<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let take_source = match (self.source.peek(), self.overlay.peek()) {
                (None, None) => {
                    debug_assert_eq!(self.remaining, 0, "merged iterator count drift");
                    return None;
                }
                (Some(_), None) => true,
                (Some((source_key, _)), Some((overlay_key, _))) => {
                    *source_key < overlay_key.as_ref()
                }
                (None, Some(_)) => false,
            };

            if take_source {
                let (key, pos) = self.source.next().expect("peeked source entry");
                self.remaining = self.remaining.saturating_sub(1);
                return Some((key, MergedValue::Stored(pos)));
            }

            // Overlay key is <= the source key (or the source is done).
            let (key, slot) = self.overlay.next().expect("peeked overlay entry");
            if let Some((source_key, _)) = self.source.peek() {
                if *source_key == key.as_ref() {
                    self.source.next();
                }
            }
            match slot {
                ValueSlot::Empty => continue, // tombstone
                ValueSlot::Occupied(value) => {
                    self.remaining = self.remaining.saturating_sub(1);
                    return Some((key.as_ref(), MergedValue::Heap(value)));
                }
            }
        }
    }
}
