//! # Commit Protocol
//!
//! A commit appends one snapshot: the delta-encoded trie, padding up to a
//! page boundary, and the 32-byte trailer that makes the snapshot real.
//! The order of operations is what makes a torn append recoverable:
//!
//! 1. Seek to the previous checkpoint and write the header if the file
//!    is empty.
//! 2. Stream the merged (overlay + base) trie through a delta encoder;
//!    unchanged subtrees and values are referenced, not rewritten.
//! 3. Grow the file to the next page boundary, leaving trailer room.
//! 4. **First barrier**: flush to stable storage. After this point the
//!    trie bytes are durable but the snapshot does not exist yet.
//! 5. Write the trailer into the last 32 bytes.
//! 6. **Second barrier**: flush again, making the trailer durable.
//!
//! A crash before step 6 leaves at most an invalid trailer above the
//! previous snapshot, which recovery skips. The barriers prefer a
//! full-device flush where the platform has one; a failed fsync is warned
//! and the commit proceeds, since the file contents are still correct and
//! only the durability timing is uncertain.
//!
//! `write_to` is the same machinery in non-delta form: a fresh file gets
//! a self-contained copy of the current snapshot with no history behind
//! it, which is how compaction works.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use tracing::warn;

use crate::parsing::numeric::narrow_to_u32;
use crate::storage::{FileHeader, FileTrailer, FILE_HEADER_SIZE, FILE_TRAILER_SIZE};
use crate::trie::builder::TrieBuilder;
use crate::trie::ValueSlot;
use crate::value::Encoder;

use super::Db;

use zerocopy::IntoBytes;

impl Db {
    /// Appends the pending changes as a new snapshot and returns the new
    /// file size. The caller reloads at that checkpoint.
    pub(crate) fn append_snapshot(&mut self) -> Result<u64> {
        let file = Arc::clone(&self.file);
        let base_len = self.data_len;
        let base = &file.contents()[..base_len as usize];

        let mut handle = file.file();
        handle
            .seek(SeekFrom::Start(base_len))
            .wrap_err("failed to seek to the end of the last snapshot")?;

        let mut pos = base_len;
        let mut out = BufWriter::new(handle);
        if base_len == 0 {
            out.write_all(FileHeader::new().as_bytes())
                .wrap_err("failed to write the file header")?;
            pos += FILE_HEADER_SIZE as u64;
        }

        let mut encoder = Encoder::with_base(&mut out, pos, base_len);
        let builder = self.pending_trie(base)?;
        let trie_end = builder.serialize(base, &mut encoder, self.overlay.count())?;
        out.flush().wrap_err("failed to write snapshot data")?;
        drop(out);

        let final_pos = self.finish_snapshot(handle, trie_end, base_len)?;
        Ok(final_pos)
    }

    /// Writes a standalone, full (non-delta) image of the current
    /// snapshot, pending changes included, to a fresh file.
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let target = File::create(path)
            .wrap_err_with(|| format!("failed to create '{}'", path.display()))?;
        let base = self.data();

        let mut out = BufWriter::new(&target);
        out.write_all(FileHeader::new().as_bytes())
            .wrap_err("failed to write the file header")?;

        let mut encoder = Encoder::new(&mut out, FILE_HEADER_SIZE as u64);
        let builder = self.pending_trie(base)?;
        let trie_end = builder.serialize(base, &mut encoder, self.overlay.count())?;
        out.flush().wrap_err("failed to write snapshot data")?;
        drop(out);

        self.finish_snapshot(&target, trie_end, 0)?;
        Ok(())
    }

    /// Pads to a page boundary, runs both durability barriers around the
    /// trailer write, and returns the final file size.
    fn finish_snapshot(&self, handle: &File, trie_end: u64, prev_checkpoint: u64) -> Result<u64> {
        let mut final_pos = trie_end + FILE_TRAILER_SIZE as u64;
        if final_pos % self.page_size != 0 {
            final_pos += self.page_size - final_pos % self.page_size;
        }
        ensure!(
            final_pos <= self.file.max_size(),
            "commit of {} bytes would exceed the {} byte mapping reservation",
            final_pos,
            self.file.max_size()
        );
        handle
            .set_len(final_pos)
            .wrap_err("failed to grow the file to a page boundary")?;

        // The trie bytes must be durable before a trailer can claim them.
        flush_file(handle, true);

        let trailer_start = final_pos - FILE_TRAILER_SIZE as u64;
        let trailer = FileTrailer::new(
            narrow_to_u32(trailer_start - trie_end),
            prev_checkpoint,
        );
        let mut writer = handle;
        writer
            .seek(SeekFrom::Start(trailer_start))
            .wrap_err("failed to seek to the trailer position")?;
        writer
            .write_all(trailer.as_bytes())
            .wrap_err("failed to write the snapshot trailer")?;

        flush_file(handle, false);
        Ok(final_pos)
    }

    /// The base trie with every pending overlay slot applied.
    fn pending_trie(&self, base: &[u8]) -> Result<TrieBuilder> {
        let mut builder = TrieBuilder::from_root(self.trie.root_ref());
        for (key, slot) in self.overlay.pending() {
            match slot {
                ValueSlot::Empty => builder.remove(base, key)?,
                ValueSlot::Occupied(value) => builder.insert(base, key, value.clone())?,
            }
        }
        Ok(builder)
    }
}

/// Flushes `file` to stable storage. On Apple platforms a full-device
/// flush is attempted first when `full_sync` is set, falling back to a
/// plain fsync if the fcntl is unsupported or fails. An fsync failure is
/// reported as a warning rather than an error: the write-back already
/// happened and only its durability timing is in question.
fn flush_file(file: &File, full_sync: bool) {
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        use std::os::fd::AsRawFd;
        if full_sync {
            // SAFETY: fcntl with F_FULLFSYNC takes no pointer arguments
            // and only acts on the (valid, open) descriptor.
            let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC, 0) };
            if rc == 0 {
                return;
            }
        }
    }
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    let _ = full_sync;

    if let Err(err) = file.sync_all() {
        warn!("failed to flush the database file to disk: {}", err);
    }
}
