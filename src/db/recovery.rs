//! # Snapshot Load and Recovery
//!
//! Loading a checkpoint is the same operation whether the target is the
//! current end of the file, an explicit historical checkpoint, or a file
//! whose tail was torn by a crash. The algorithm:
//!
//! 1. A zero target is an empty database.
//! 2. Validate the file header; failure means the file is foreign or
//!    corrupt and nothing can be trusted.
//! 3. Round a non-page-aligned target down to the last full page.
//! 4. Validate the trailer ending at the target. On failure, step back
//!    one page and retry until a valid trailer is found or the scan runs
//!    out of file.
//!
//! The commit protocol flushes trie bytes to disk before it writes the
//! trailer, so a trailer that validates always anchors fully durable
//! data; a torn append can only produce *invalid* trailers above the last
//! good one, which this scan skips. Recoverable anomalies emit warnings
//! and leave the handle marked damaged; a file with no recoverable
//! trailer at all is an `InvalidData` error.

use tracing::warn;

use eyre::Result;

use crate::error::StoreError;
use crate::storage::{FileHeader, FileTrailer, FILE_TRAILER_SIZE};
use crate::trie::{HashTrie, Overlay};

use super::Db;

impl Db {
    /// Loads the snapshot ending at `target`, scanning backward past any
    /// damaged tail. Resets the overlay.
    pub(crate) fn load_checkpoint(&mut self, target: u64) -> Result<()> {
        if target == 0 {
            self.data_len = 0;
            self.prev_checkpoint = 0;
            self.damaged = false;
            self.trie = HashTrie::empty();
            self.overlay = Overlay::with_trie(self.trie);
            return Ok(());
        }

        // Assume the worst until a trailer validates cleanly.
        self.damaged = true;

        if target < self.page_size {
            warn!(
                "not a database file (too small): {}",
                self.file.path().display()
            );
            return Err(StoreError::invalid_data("Not a DB file (too small)"));
        }

        let file = std::sync::Arc::clone(&self.file);
        let contents = file.contents();

        if !FileHeader::validate_prefix(contents, self.page_size) {
            warn!(
                "not a database file, or the header is corrupted: {}",
                self.file.path().display()
            );
            return Err(StoreError::invalid_data(
                "Not a DB file; or else header is corrupted",
            ));
        }

        let mut size = target;
        let mut damaged_size = false;
        if size % self.page_size != 0 {
            warn!(
                "file size {:#x} is not page-aligned; skipping back to the last full page",
                size
            );
            size -= size % self.page_size;
            damaged_size = true;
        }

        let mut damaged_trailer = false;
        loop {
            if let Some((prev, trie)) = self.validate_trailer(contents, size) {
                self.data_len = size;
                self.prev_checkpoint = prev;
                self.trie = trie;
                self.overlay = Overlay::with_trie(trie);
                break;
            }
            if !damaged_trailer && self.page_size > 1 {
                warn!(
                    "trailer at {:#x} is invalid; scanning backwards for a valid one",
                    size
                );
                damaged_trailer = true;
            }
            if size <= self.page_size || self.page_size == 1 {
                warn!(
                    "no valid trailer found; database file is fatally damaged: {}",
                    self.file.path().display()
                );
                return Err(StoreError::invalid_data(
                    "DB file is fatally damaged: no valid trailer found",
                ));
            }
            size -= self.page_size;
        }

        if damaged_trailer || damaged_size {
            warn!("valid trailer found at {:#x}; using it", size);
        } else {
            self.damaged = false;
        }
        Ok(())
    }

    /// Checks the snapshot ending at `size`: trailer magics, the recorded
    /// previous-checkpoint position, the derived trie end, and the trie
    /// tail itself. Any failure means "keep scanning".
    fn validate_trailer(&self, contents: &[u8], size: u64) -> Option<(u64, HashTrie)> {
        if size < self.page_size || size % self.page_size != 0 {
            return None;
        }
        if size < FILE_TRAILER_SIZE as u64 || size as usize > contents.len() {
            return None;
        }
        let trailer = FileTrailer::read_ending_at(contents, size as usize)?;

        let prev = trailer.prev_trailer_pos();
        if prev > size - self.page_size || prev % self.page_size != 0 {
            return None;
        }

        let trailer_start = size - FILE_TRAILER_SIZE as u64;
        let trie_end = trailer_start.checked_sub(trailer.tree_offset() as u64)?;
        if trie_end < prev || trie_end % 2 != 0 {
            return None;
        }

        let trie = HashTrie::from_data(&contents[..trie_end as usize]).ok()?;
        Some((prev, trie))
    }
}
