//! # Database Builder
//!
//! Fluent configuration for opening a database. Every knob has a sane
//! default, so the common case is two calls:
//!
//! ```ignore
//! let db = Db::builder().path("./app.db").open()?;
//! ```
//!
//! | Option         | Default          | Meaning                           |
//! |----------------|------------------|-----------------------------------|
//! | `mode`         | ReadWriteCreate  | file access and creation          |
//! | `page_size`    | 4096             | snapshot alignment and scan step  |
//! | `max_map_size` | 1 GiB            | mapping reservation / growth cap  |
//!
//! The page size is a property of the file: opening an existing database
//! with a different page size than it was written with will fail trailer
//! validation. The mapping reservation only consumes address space, not
//! memory, so the default is deliberately generous.

use std::path::{Path, PathBuf};

use eyre::Result;

use crate::storage::{OpenMode, DEFAULT_MAX_MAP_SIZE, DEFAULT_PAGE_SIZE};

use super::Db;

pub struct DbBuilder {
    path: Option<PathBuf>,
    mode: OpenMode,
    max_map_size: u64,
    page_size: u64,
}

impl DbBuilder {
    pub fn new() -> Self {
        Self {
            path: None,
            mode: OpenMode::ReadWriteCreate,
            max_map_size: DEFAULT_MAX_MAP_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Path of the database file. Required.
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    /// File access mode.
    pub fn mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    /// Shorthand for `mode(OpenMode::ReadOnly)`.
    pub fn read_only(self) -> Self {
        self.mode(OpenMode::ReadOnly)
    }

    /// Mapping reservation, which is also the size the file may grow to.
    pub fn max_map_size(mut self, bytes: u64) -> Self {
        self.max_map_size = bytes;
        self
    }

    /// Snapshot alignment. Must match the value the file was created
    /// with.
    pub fn page_size(mut self, bytes: u64) -> Self {
        self.page_size = bytes;
        self
    }

    /// Opens the database and loads its latest snapshot.
    pub fn open(self) -> Result<Db> {
        let path = self
            .path
            .ok_or_else(|| eyre::eyre!("database path not specified: call .path() first"))?;
        Db::open(path, self.mode, self.max_map_size, self.page_size)
    }
}

impl Default for DbBuilder {
    fn default() -> Self {
        Self::new()
    }
}
