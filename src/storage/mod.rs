//! # Storage Layer
//!
//! Single-file, append-only storage with memory-mapped reads. A database
//! file is a header followed by a sequence of immutable snapshots:
//!
//! ```text
//!  offset  size  content
//!  ------  ----  ----------------------------------------
//!    0      24   file header (magic text + magic2)
//!   24       *   snapshot 0: trie bytes + padding + trailer
//!    ...     *   snapshot 1: delta trie bytes + padding + trailer
//! ```
//!
//! Every snapshot ends on a page boundary, and the 32-byte trailer
//! occupies the last bytes of its page. Because bytes are only ever
//! appended, a reader holding any earlier snapshot boundary sees a
//! perfectly stable prefix of the file regardless of later commits.
//!
//! ## Mapping Strategy
//!
//! The whole reservation (`max_map_size` bytes) is mapped once at open.
//! Growing the file never remaps, so the base address is stable and
//! borrowed slices stay valid across commits; pages past the current file
//! size are simply never touched. This is what makes concurrent readers
//! safe without any locking: their view is a length captured at load
//! time over an address range that never moves.
//!
//! ## Write Path
//!
//! Writes do not go through the map. Appends use buffered file I/O on the
//! underlying handle, followed by explicit durability barriers; the map
//! observes the new bytes through the unified page cache once the view
//! length is advanced.
//!
//! ## Module Organization
//!
//! - `mmap`: the [`MappedFile`] reservation-mapped file
//! - `headers`: zerocopy layouts for the file header and snapshot trailer

mod headers;
mod mmap;

pub use headers::{
    FileHeader, FileTrailer, FILE_MAGIC2, FILE_MAGIC_TEXT, TRAILER_MAGIC1, TRAILER_MAGIC2,
};
pub use mmap::MappedFile;

/// Size of the file header at offset 0.
pub const FILE_HEADER_SIZE: usize = 24;
/// Size of the trailer ending each snapshot.
pub const FILE_TRAILER_SIZE: usize = 32;
/// Default snapshot alignment and recovery scan step.
pub const DEFAULT_PAGE_SIZE: u64 = 4096;
/// Default mapping reservation: 1 GiB of address space.
pub const DEFAULT_MAX_MAP_SIZE: u64 = 1 << 30;

/// How a database file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing file, reads only.
    ReadOnly,
    /// Existing file, reads and writes.
    ReadWrite,
    /// Reads and writes, creating the file if missing.
    ReadWriteCreate,
}

impl OpenMode {
    pub fn is_writeable(&self) -> bool {
        !matches!(self, OpenMode::ReadOnly)
    }
}
