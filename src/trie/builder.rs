//! # Copy-on-Write Trie Rebuild
//!
//! The commit path turns "base trie + overlay changes" into a serialized
//! trie image. The builder loads only the nodes along changed paths into
//! an in-memory form; every untouched subtree stays a raw reference into
//! the base image.
//!
//! Serialization then has two modes, chosen by the encoder:
//!
//! - **Delta** (commit): referenced subtrees, keys, and values that
//!   already exist below the base boundary are emitted as their old
//!   offsets; only changed paths produce new bytes.
//! - **Full** (compaction): nothing is reusable, so referenced subtrees
//!   are deep-copied record by record into the new stream.
//!
//! Nodes are written bottom-up, children before parents, finishing with
//! the 8-byte `[count][root ref]` tail whose end position anchors the
//! snapshot trailer.

use std::io::Write;

use eyre::Result;

use crate::parsing::numeric::narrow_to_u32;
use crate::trie::overlay::{MergedValue, Overlay};
use crate::trie::persistent::{InteriorRef, LeafRef};
use crate::trie::{branch_at, hash_key, LEAF_BIT, MAX_DEPTH};
use crate::value::heap::HeapValue;
use crate::value::view::load_key;
use crate::value::Encoder;

pub(crate) struct TrieBuilder {
    root: Option<BuildNode>,
}

enum BuildNode {
    /// An unchanged subtree, referenced by its raw child ref in the base.
    Reused(u32),
    Interior {
        bitmap: u32,
        children: Vec<BuildNode>,
    },
    Leaf(Vec<LeafEntry>),
}

struct LeafEntry {
    key: Box<[u8]>,
    hash: u32,
    /// Offset of the key record in the base image, when the entry came
    /// from there; lets a delta rewrite of the leaf keep referencing it.
    key_pos: Option<u32>,
    value: HeapValue,
}

impl LeafEntry {
    fn new(key: &[u8], hash: u32, value: HeapValue) -> Self {
        Self {
            key: key.into(),
            hash,
            key_pos: None,
            value,
        }
    }
}

impl TrieBuilder {
    pub(crate) fn from_root(root_ref: u32) -> Self {
        Self {
            root: (root_ref != 0).then_some(BuildNode::Reused(root_ref)),
        }
    }

    pub(crate) fn insert(&mut self, base: &[u8], key: &[u8], value: HeapValue) -> Result<()> {
        let hash = hash_key(key);
        let root = self.root.take();
        self.root = Some(Self::insert_into(root, base, 0, hash, key, value)?);
        Ok(())
    }

    pub(crate) fn remove(&mut self, base: &[u8], key: &[u8]) -> Result<()> {
        let hash = hash_key(key);
        let root = self.root.take();
        let (root, _removed) = Self::remove_from(root, base, 0, hash, key)?;
        self.root = root;
        Ok(())
    }

    fn insert_into(
        node: Option<BuildNode>,
        base: &[u8],
        depth: u32,
        hash: u32,
        key: &[u8],
        value: HeapValue,
    ) -> Result<BuildNode> {
        let Some(node) = node else {
            return Ok(BuildNode::Leaf(vec![LeafEntry::new(key, hash, value)]));
        };
        match Self::expand(node, base)? {
            BuildNode::Reused(_) => unreachable!("expand returns a loaded node"),
            BuildNode::Interior {
                mut bitmap,
                mut children,
            } => {
                let bit = 1u32 << branch_at(hash, depth);
                let index = (bitmap & (bit - 1)).count_ones() as usize;
                if bitmap & bit != 0 {
                    let child = children.remove(index);
                    let child = Self::insert_into(Some(child), base, depth + 1, hash, key, value)?;
                    children.insert(index, child);
                } else {
                    bitmap |= bit;
                    children.insert(index, BuildNode::Leaf(vec![LeafEntry::new(key, hash, value)]));
                }
                Ok(BuildNode::Interior { bitmap, children })
            }
            BuildNode::Leaf(mut entries) => {
                if let Some(entry) = entries.iter_mut().find(|e| e.key.as_ref() == key) {
                    entry.value = value;
                    return Ok(BuildNode::Leaf(entries));
                }
                if entries[0].hash == hash {
                    // Full 32-bit hash collision: the keys share a leaf.
                    entries.push(LeafEntry::new(key, hash, value));
                    return Ok(BuildNode::Leaf(entries));
                }
                // The hashes differ somewhere at or below this depth, so
                // pushing the existing leaf down one level must terminate.
                debug_assert!(depth < MAX_DEPTH, "colliding hashes were not caught");
                let existing_bit = 1u32 << branch_at(entries[0].hash, depth);
                let interior = BuildNode::Interior {
                    bitmap: existing_bit,
                    children: vec![BuildNode::Leaf(entries)],
                };
                Self::insert_into(Some(interior), base, depth, hash, key, value)
            }
        }
    }

    fn remove_from(
        node: Option<BuildNode>,
        base: &[u8],
        depth: u32,
        hash: u32,
        key: &[u8],
    ) -> Result<(Option<BuildNode>, bool)> {
        let Some(node) = node else {
            return Ok((None, false));
        };
        match Self::expand(node, base)? {
            BuildNode::Reused(_) => unreachable!("expand returns a loaded node"),
            BuildNode::Interior {
                mut bitmap,
                mut children,
            } => {
                let bit = 1u32 << branch_at(hash, depth);
                if bitmap & bit == 0 {
                    return Ok((Some(BuildNode::Interior { bitmap, children }), false));
                }
                let index = (bitmap & (bit - 1)).count_ones() as usize;
                let child = children.remove(index);
                let (child, removed) = Self::remove_from(Some(child), base, depth + 1, hash, key)?;
                match child {
                    Some(child) => children.insert(index, child),
                    None => bitmap &= !bit,
                }
                if bitmap == 0 {
                    Ok((None, removed))
                } else {
                    Ok((Some(BuildNode::Interior { bitmap, children }), removed))
                }
            }
            BuildNode::Leaf(mut entries) => {
                let before = entries.len();
                entries.retain(|e| e.key.as_ref() != key);
                let removed = entries.len() < before;
                if entries.is_empty() {
                    Ok((None, removed))
                } else {
                    Ok((Some(BuildNode::Leaf(entries)), removed))
                }
            }
        }
    }

    /// Loads one level of a referenced base node into builder form.
    fn expand(node: BuildNode, base: &[u8]) -> Result<BuildNode> {
        let BuildNode::Reused(raw) = node else {
            return Ok(node);
        };
        let offset = raw & !LEAF_BIT;
        if raw & LEAF_BIT != 0 {
            let leaf = LeafRef::load(base, offset)?;
            let mut entries = Vec::with_capacity(leaf.count);
            for i in 0..leaf.count {
                let (key_pos, value_pos) = leaf.entry(base, i)?;
                let key: Box<[u8]> = load_key(base, key_pos)?.into();
                let hash = hash_key(&key);
                entries.push(LeafEntry {
                    key,
                    hash,
                    key_pos: Some(key_pos),
                    value: HeapValue::Stored(value_pos),
                });
            }
            Ok(BuildNode::Leaf(entries))
        } else {
            let interior = InteriorRef::load(base, offset)?;
            let children = (0..interior.child_count())
                .map(|i| interior.child(base, i).map(BuildNode::Reused))
                .collect::<Result<Vec<_>>>()?;
            Ok(BuildNode::Interior {
                bitmap: interior.bitmap(),
                children,
            })
        }
    }

    /// Writes the trie through `enc`, ending with the `[count][root]`
    /// tail, and returns the trie end position.
    pub(crate) fn serialize<W: Write>(
        &self,
        base: &[u8],
        enc: &mut Encoder<W>,
        count: u64,
    ) -> Result<u64> {
        let root_ref = match &self.root {
            None => 0,
            Some(node) => Self::write_node(node, base, enc)?,
        };
        enc.align_to(4)?;
        enc.write_all(&narrow_to_u32(count).to_le_bytes())?;
        enc.write_all(&root_ref.to_le_bytes())?;
        Ok(enc.position())
    }

    fn write_node<W: Write>(node: &BuildNode, base: &[u8], enc: &mut Encoder<W>) -> Result<u32> {
        match node {
            BuildNode::Reused(raw) => {
                if enc.can_reuse(raw & !LEAF_BIT) {
                    Ok(*raw)
                } else {
                    Self::copy_node(*raw, base, enc)
                }
            }
            BuildNode::Leaf(entries) => {
                let mut encoded = Vec::with_capacity(entries.len());
                for entry in entries {
                    let key_pos = match entry.key_pos {
                        Some(pos) if enc.can_reuse(pos) => pos,
                        _ => enc.write_key(&entry.key)?,
                    };
                    let value_pos = Self::write_value(&entry.value, base, enc)?;
                    encoded.push((key_pos, value_pos));
                }
                Self::write_leaf_record(&encoded, enc)
            }
            BuildNode::Interior { bitmap, children } => {
                let refs = children
                    .iter()
                    .map(|child| Self::write_node(child, base, enc))
                    .collect::<Result<Vec<_>>>()?;
                Self::write_interior_record(*bitmap, &refs, enc)
            }
        }
    }

    /// Deep-copies a referenced base subtree into the stream; used when
    /// the encoder has no delta base.
    fn copy_node<W: Write>(raw: u32, base: &[u8], enc: &mut Encoder<W>) -> Result<u32> {
        let offset = raw & !LEAF_BIT;
        if raw & LEAF_BIT != 0 {
            let leaf = LeafRef::load(base, offset)?;
            let mut encoded = Vec::with_capacity(leaf.count);
            for i in 0..leaf.count {
                let (key_pos, value_pos) = leaf.entry(base, i)?;
                let key_pos = enc.write_key(load_key(base, key_pos)?)?;
                let value_pos = enc.encode_view(base, value_pos)?;
                encoded.push((key_pos, value_pos));
            }
            Self::write_leaf_record(&encoded, enc)
        } else {
            let interior = InteriorRef::load(base, offset)?;
            let refs = (0..interior.child_count())
                .map(|i| Self::copy_node(interior.child(base, i)?, base, enc))
                .collect::<Result<Vec<_>>>()?;
            Self::write_interior_record(interior.bitmap(), &refs, enc)
        }
    }

    fn write_value<W: Write>(value: &HeapValue, base: &[u8], enc: &mut Encoder<W>) -> Result<u32> {
        match value {
            HeapValue::Stored(pos) => {
                if enc.can_reuse(*pos) {
                    Ok(*pos)
                } else {
                    enc.encode_view(base, *pos)
                }
            }
            HeapValue::Owned(owned) => enc.encode_value(owned),
            HeapValue::Dict(dict) => {
                let dict = dict.read();
                Self::write_overlay_dict(&dict, base, enc)
            }
            HeapValue::Array(array) => {
                let array = array.read();
                let mut offsets = Vec::with_capacity(array.len());
                for item in array.items() {
                    offsets.push(Self::write_value(item, base, enc)?);
                }
                enc.write_array_record(&offsets)
            }
        }
    }

    /// Serializes a promoted dict: the merged view of its source record
    /// and pending slots, unchanged values referenced in delta mode.
    fn write_overlay_dict<W: Write>(
        overlay: &Overlay,
        base: &[u8],
        enc: &mut Encoder<W>,
    ) -> Result<u32> {
        let mut entries = Vec::with_capacity(overlay.count() as usize);
        for (key, value) in overlay.merged(base)? {
            let key_pos = enc.write_key(key)?;
            let value_pos = match value {
                MergedValue::Stored(pos) if enc.can_reuse(pos) => pos,
                MergedValue::Stored(pos) => enc.encode_view(base, pos)?,
                MergedValue::Heap(heap) => Self::write_value(heap, base, enc)?,
            };
            entries.push((key_pos, value_pos));
        }
        enc.write_dict_record(&entries)
    }

    fn write_leaf_record<W: Write>(entries: &[(u32, u32)], enc: &mut Encoder<W>) -> Result<u32> {
        enc.align_to(4)?;
        let at = narrow_to_u32(enc.position());
        enc.write_all(&(entries.len() as u32).to_le_bytes())?;
        for (key_pos, value_pos) in entries {
            enc.write_all(&key_pos.to_le_bytes())?;
            enc.write_all(&value_pos.to_le_bytes())?;
        }
        Ok(at | LEAF_BIT)
    }

    fn write_interior_record<W: Write>(
        bitmap: u32,
        refs: &[u32],
        enc: &mut Encoder<W>,
    ) -> Result<u32> {
        enc.align_to(4)?;
        let at = narrow_to_u32(enc.position());
        enc.write_all(&bitmap.to_le_bytes())?;
        for child in refs {
            enc.write_all(&child.to_le_bytes())?;
        }
        Ok(at)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::trie::HashTrie;
    use crate::value::view::load_value;
    use crate::value::Value;

    /// Builds a standalone trie image from string keys and int documents.
    pub(crate) fn image_of(entries: &[(&str, i64)]) -> (Vec<u8>, HashTrie) {
        let mut builder = TrieBuilder::from_root(0);
        for (key, n) in entries {
            builder
                .insert(&[], key.as_bytes(), HeapValue::Owned(Value::Int(*n)))
                .unwrap();
        }
        let mut image = Vec::new();
        let mut enc = Encoder::new(&mut image, 0);
        let end = builder
            .serialize(&[], &mut enc, entries.len() as u64)
            .unwrap();
        drop(enc);
        assert_eq!(end as usize, image.len());
        let trie = HashTrie::from_data(&image).unwrap();
        (image, trie)
    }

    fn value_at(image: &[u8], pos: u32) -> Value {
        load_value(image, pos).unwrap().to_value().unwrap()
    }

    #[test]
    fn build_and_look_up_many_keys() {
        let entries: Vec<(String, i64)> = (0..200).map(|i| (format!("key-{:03}", i), i)).collect();
        let borrowed: Vec<(&str, i64)> = entries.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        let (image, trie) = image_of(&borrowed);

        assert_eq!(trie.count(), 200);
        for (key, n) in &entries {
            let pos = trie.get(&image, key.as_bytes()).unwrap().unwrap();
            assert_eq!(value_at(&image, pos), Value::Int(*n));
        }
        assert_eq!(trie.get(&image, b"key-999").unwrap(), None);
        assert_eq!(trie.get(&image, b"").unwrap(), None);
    }

    #[test]
    fn entries_come_back_sorted() {
        let (image, trie) = image_of(&[("pear", 1), ("apple", 2), ("fig", 3), ("mango", 4)]);
        let listed: Vec<&[u8]> = trie
            .entries(&image)
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(listed, vec![b"apple" as &[u8], b"fig", b"mango", b"pear"]);
    }

    #[test]
    fn colliding_hashes_share_a_leaf() {
        // These pairs collide under the key hash.
        let (image, trie) = image_of(&[
            ("costarring", 1),
            ("liquid", 2),
            ("declinate", 3),
            ("macallums", 4),
            ("unrelated", 5),
        ]);
        for (key, n) in [
            ("costarring", 1),
            ("liquid", 2),
            ("declinate", 3),
            ("macallums", 4),
            ("unrelated", 5),
        ] {
            let pos = trie.get(&image, key.as_bytes()).unwrap().unwrap();
            assert_eq!(value_at(&image, pos), Value::Int(n));
        }
        assert_eq!(trie.get(&image, b"costarrinh").unwrap(), None);
    }

    #[test]
    fn overwriting_a_key_replaces_its_value() {
        let mut builder = TrieBuilder::from_root(0);
        builder
            .insert(&[], b"k", HeapValue::Owned(Value::Int(1)))
            .unwrap();
        builder
            .insert(&[], b"k", HeapValue::Owned(Value::Int(2)))
            .unwrap();
        let mut image = Vec::new();
        let mut enc = Encoder::new(&mut image, 0);
        builder.serialize(&[], &mut enc, 1).unwrap();
        drop(enc);
        let trie = HashTrie::from_data(&image).unwrap();
        assert_eq!(trie.count(), 1);
        let pos = trie.get(&image, b"k").unwrap().unwrap();
        assert_eq!(value_at(&image, pos), Value::Int(2));
    }

    #[test]
    fn delta_append_reuses_untouched_subtrees() {
        let entries: Vec<(String, i64)> = (0..100).map(|i| (format!("doc-{:03}", i), i)).collect();
        let borrowed: Vec<(&str, i64)> = entries.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        let (base, base_trie) = image_of(&borrowed);
        let base_len = base.len();

        // Append one new key and one overwrite against the base image.
        let mut builder = TrieBuilder::from_root(base_trie.root_ref());
        builder
            .insert(&base, b"doc-new", HeapValue::Owned(Value::Int(1000)))
            .unwrap();
        builder
            .insert(&base, b"doc-050", HeapValue::Owned(Value::Int(-50)))
            .unwrap();

        let mut image = base.clone();
        let mut enc = Encoder::with_base(&mut image, base_len as u64, base_len as u64);
        let end = builder.serialize(&base, &mut enc, 101).unwrap();
        drop(enc);

        // The delta must be a small fraction of a full rewrite.
        let delta_bytes = end as usize - base_len;
        assert!(
            delta_bytes < base_len / 4,
            "delta of {} bytes against a {} byte base",
            delta_bytes,
            base_len
        );

        let trie = HashTrie::from_data(&image[..end as usize]).unwrap();
        assert_eq!(trie.count(), 101);
        let pos = trie.get(&image, b"doc-new").unwrap().unwrap();
        assert_eq!(value_at(&image, pos), Value::Int(1000));
        let pos = trie.get(&image, b"doc-050").unwrap().unwrap();
        assert_eq!(value_at(&image, pos), Value::Int(-50));
        let pos = trie.get(&image, b"doc-000").unwrap().unwrap();
        assert_eq!(value_at(&image, pos), Value::Int(0));
    }

    #[test]
    fn removal_prunes_empty_nodes() {
        let (base, base_trie) = image_of(&[("a", 1), ("b", 2)]);
        let mut builder = TrieBuilder::from_root(base_trie.root_ref());
        builder.remove(&base, b"a").unwrap();
        builder.remove(&base, b"b").unwrap();
        builder.remove(&base, b"never-there").unwrap();

        let mut image = base.clone();
        let mut enc = Encoder::with_base(&mut image, base.len() as u64, base.len() as u64);
        let end = builder.serialize(&base, &mut enc, 0).unwrap();
        drop(enc);

        let trie = HashTrie::from_data(&image[..end as usize]).unwrap();
        assert!(trie.is_empty());
        assert_eq!(trie.get(&image, b"a").unwrap(), None);
    }

    #[test]
    fn full_rewrite_is_self_contained() {
        let (base, base_trie) = image_of(&[("x", 7), ("y", 8), ("z", 9)]);

        let builder = TrieBuilder::from_root(base_trie.root_ref());
        let mut fresh = Vec::new();
        let mut enc = Encoder::new(&mut fresh, 0);
        let end = builder.serialize(&base, &mut enc, 3).unwrap();
        drop(enc);
        assert_eq!(end as usize, fresh.len());

        // The copy must resolve entirely within its own bytes.
        let trie = HashTrie::from_data(&fresh).unwrap();
        for (key, n) in [("x", 7), ("y", 8), ("z", 9)] {
            let pos = trie.get(&fresh, key.as_bytes()).unwrap().unwrap();
            assert_eq!(value_at(&fresh, pos), Value::Int(n));
        }
    }
}
