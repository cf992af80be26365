//! # Reservation-Mapped File
//!
//! [`MappedFile`] owns a database file handle and a single read-only
//! mapping of `max_map_size` bytes created at open. The mapping may
//! extend far past the end of the file; that is the point. Growing the
//! file (always by appending) makes more of the reservation readable
//! without ever remapping, so the base address is stable for the life of
//! the handle and slices borrowed from [`MappedFile::contents`] survive
//! any number of commits.
//!
//! The accessible length is tracked separately from the file so a handle
//! shared between a writer and historical readers has one consistent
//! notion of "how much of the map is real". Readers additionally cap
//! their own view at the snapshot length they loaded.
//!
//! Appends go through the file handle (`std::io` on `&File`), not the
//! map; on the platforms this crate targets the page cache keeps the two
//! coherent.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::{ensure, Result, WrapErr};
use memmap2::{Mmap, MmapOptions};

use super::OpenMode;

#[derive(Debug)]
pub struct MappedFile {
    file: File,
    map: Mmap,
    len: AtomicU64,
    max_size: u64,
    path: PathBuf,
    writeable: bool,
}

impl MappedFile {
    /// Opens (or, with [`OpenMode::ReadWriteCreate`], creates) a database
    /// file and maps a `max_size`-byte reservation over it.
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode, max_size: u64) -> Result<Self> {
        let path = path.as_ref();

        ensure!(max_size > 0, "maximum mapped size must be positive");
        ensure!(
            max_size <= u32::MAX as u64,
            "maximum mapped size {} exceeds the 32-bit offset range of the file format",
            max_size
        );

        let file = OpenOptions::new()
            .read(true)
            .write(mode.is_writeable())
            .create(mode == OpenMode::ReadWriteCreate)
            .open(path)
            .wrap_err_with(|| format!("failed to open database file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?
            .len();

        ensure!(
            len <= max_size,
            "database file '{}' is {} bytes, larger than the {} byte mapping reservation",
            path.display(),
            len,
            max_size
        );

        // SAFETY: Mmap::map is unsafe because the underlying file could be
        // modified externally, invalidating the mapped contents. This is
        // safe because:
        // 1. The file format is append-only: bytes below any loaded
        //    snapshot length are never rewritten by this crate
        // 2. The reservation covers max_size bytes up front, so the file
        //    growing underneath never requires a remap and the base
        //    address is stable for the life of this value
        // 3. All access goes through contents(), which exposes only
        //    [0, len) where len never exceeds the file size, so pages
        //    beyond end-of-file are never faulted in
        // 4. Database files are not meant to be modified by external
        //    processes while open
        let map = unsafe {
            MmapOptions::new()
                .len(max_size as usize)
                .map(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            map,
            len: AtomicU64::new(len),
            max_size,
            path: path.to_path_buf(),
            writeable: mode.is_writeable(),
        })
    }

    /// The readable prefix of the mapping: every committed byte.
    pub fn contents(&self) -> &[u8] {
        &self.map[..self.len.load(Ordering::Acquire) as usize]
    }

    /// Current accessible length in bytes.
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extends the accessible view after the file itself has grown. The
    /// new bytes must already be on disk; this only publishes them to
    /// readers of [`MappedFile::contents`].
    pub fn resize_to(&self, new_len: u64) -> Result<()> {
        ensure!(
            new_len <= self.max_size,
            "resize to {} exceeds the {} byte mapping reservation",
            new_len,
            self.max_size
        );
        self.len.store(new_len, Ordering::Release);
        Ok(())
    }

    /// The underlying handle, for appending and durability barriers.
    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_writeable(&self) -> bool {
        self.writeable
    }
}
