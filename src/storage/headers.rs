//! # File Header and Trailer Layouts
//!
//! The two fixed-layout records of the file format, as zerocopy structs
//! with little-endian fields:
//!
//! - [`FileHeader`]: 24 bytes at offset 0, written once when the file
//!   receives its first snapshot. Identifies the file type.
//! - [`FileTrailer`]: 32 bytes ending every snapshot. Recovery scans for
//!   its two magics and validates the recorded positions; a trailer that
//!   passes is the anchor of a complete, durable snapshot.
//!
//! Both layouts carry compile-time size assertions; a field change that
//! alters the on-disk size fails the build.

use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{FILE_HEADER_SIZE, FILE_TRAILER_SIZE};

/// Magic text opening every database file.
pub const FILE_MAGIC_TEXT: &[u8; 14] = b"FleeceDB\n\0\0\0\0\0";
/// Second header magic.
pub const FILE_MAGIC2: u64 = 0xBAD7_2422_7CA1_955F;
/// First trailer magic.
pub const TRAILER_MAGIC1: u64 = 0x332F_FAB5_BC64_4D0C;
/// Second trailer magic.
pub const TRAILER_MAGIC2: u64 = 0x84A7_32B5_C0E6_948B;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    magic_text: [u8; 14],
    size: U16,
    magic2: U64,
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE);

impl FileHeader {
    pub fn new() -> Self {
        Self {
            magic_text: *FILE_MAGIC_TEXT,
            size: U16::new(FILE_HEADER_SIZE as u16),
            magic2: U64::new(FILE_MAGIC2),
        }
    }

    /// Whether `bytes` starts with a valid header. The recorded header
    /// size must be plausible for the page size in use; anything larger
    /// marks the file as foreign or corrupt.
    pub fn validate_prefix(bytes: &[u8], page_size: u64) -> bool {
        if bytes.len() < FILE_HEADER_SIZE {
            return false;
        }
        let Ok(header) = Self::ref_from_bytes(&bytes[..FILE_HEADER_SIZE]) else {
            return false;
        };
        header.magic_text == *FILE_MAGIC_TEXT
            && header.magic2.get() == FILE_MAGIC2
            && (header.size.get() as u64) < page_size.max(4096)
    }

    pub fn size(&self) -> u16 {
        self.size.get()
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileTrailer {
    magic1: U64,
    /// Distance from the trailer start back to the end of the trie image.
    tree_offset: U32,
    padding: U32,
    /// Absolute position of the previous snapshot's end, or 0.
    prev_trailer_pos: U64,
    magic2: U64,
}

const _: () = assert!(std::mem::size_of::<FileTrailer>() == FILE_TRAILER_SIZE);

impl FileTrailer {
    pub fn new(tree_offset: u32, prev_trailer_pos: u64) -> Self {
        Self {
            magic1: U64::new(TRAILER_MAGIC1),
            tree_offset: U32::new(tree_offset),
            padding: U32::new(0),
            prev_trailer_pos: U64::new(prev_trailer_pos),
            magic2: U64::new(TRAILER_MAGIC2),
        }
    }

    /// Parses the trailer record ending at `end` within `bytes`, checking
    /// both magics. Positional validation is the caller's job; this only
    /// establishes that a trailer-shaped record is present.
    pub fn read_ending_at(bytes: &[u8], end: usize) -> Option<&Self> {
        let start = end.checked_sub(FILE_TRAILER_SIZE)?;
        let trailer = Self::ref_from_bytes(bytes.get(start..end)?).ok()?;
        (trailer.magic1.get() == TRAILER_MAGIC1 && trailer.magic2.get() == TRAILER_MAGIC2)
            .then_some(trailer)
    }

    pub fn tree_offset(&self) -> u32 {
        self.tree_offset.get()
    }

    pub fn prev_trailer_pos(&self) -> u64 {
        self.prev_trailer_pos.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_24_bytes() {
        assert_eq!(std::mem::size_of::<FileHeader>(), 24);
    }

    #[test]
    fn trailer_is_32_bytes() {
        assert_eq!(std::mem::size_of::<FileTrailer>(), 32);
    }

    #[test]
    fn header_round_trips() {
        let header = FileHeader::new();
        let bytes = header.as_bytes();
        assert_eq!(&bytes[..9], b"FleeceDB\n");
        assert!(FileHeader::validate_prefix(bytes, 4096));
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut bytes = FileHeader::new().as_bytes().to_vec();
        bytes[0] ^= 0xFF;
        assert!(!FileHeader::validate_prefix(&bytes, 4096));

        let mut bytes = FileHeader::new().as_bytes().to_vec();
        bytes[16] ^= 0xFF; // magic2
        assert!(!FileHeader::validate_prefix(&bytes, 4096));

        assert!(!FileHeader::validate_prefix(&[], 4096));
    }

    #[test]
    fn header_rejects_an_oversized_header_size() {
        let mut bytes = FileHeader::new().as_bytes().to_vec();
        bytes[14] = 0xFF;
        bytes[15] = 0xFF;
        assert!(!FileHeader::validate_prefix(&bytes, 4096));
        // A larger page size raises the ceiling.
        assert!(FileHeader::validate_prefix(&bytes, 1 << 20));
    }

    #[test]
    fn trailer_round_trips() {
        let trailer = FileTrailer::new(100, 4096);
        let bytes = trailer.as_bytes();
        let parsed = FileTrailer::read_ending_at(bytes, bytes.len()).unwrap();
        assert_eq!(parsed.tree_offset(), 100);
        assert_eq!(parsed.prev_trailer_pos(), 4096);
    }

    #[test]
    fn trailer_rejects_bad_magics_and_bounds() {
        let trailer = FileTrailer::new(0, 0);
        let mut bytes = trailer.as_bytes().to_vec();
        bytes[0] ^= 1;
        assert!(FileTrailer::read_ending_at(&bytes, bytes.len()).is_none());

        let mut bytes = trailer.as_bytes().to_vec();
        bytes[31] ^= 1;
        assert!(FileTrailer::read_ending_at(&bytes, bytes.len()).is_none());

        assert!(FileTrailer::read_ending_at(&[0u8; 16], 16).is_none());
        assert!(FileTrailer::read_ending_at(&[0u8; 64], 200).is_none());
    }
}
